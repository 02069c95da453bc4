use crate::services::schema;
use crate::time::TimeRange;
use chrono::{Duration, NaiveDateTime};
use duckdb::{params, Connection};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ACCOUNTS: [&str; 6] = ["astro", "bio", "chem", "climate", "ml", "physics"];
const QUEUES: [&str; 4] = ["normal", "debug", "gpu", "bigmem"];
const USERS: [&str; 8] = [
    "agarcia", "bchen", "ckumar", "dlee", "emiller", "fnguyen", "gpatel", "hsmith",
];

/// Fills `table` with synthetic job records spread evenly across the
/// requested range. Replaces the table wholesale; the generator is seeded
/// from the range so repeated loads of the same window are reproducible.
pub fn synthesize_rows(
    conn: &Connection,
    table: &str,
    range: &TimeRange,
    rows: u64,
) -> duckdb::Result<u64> {
    conn.execute_batch(&schema::create_table_sql(table))?;

    let span_seconds = (range.end - range.start).num_seconds().max(1);
    let step_seconds = span_seconds as f64 / rows as f64;
    let mut rng = StdRng::seed_from_u64(range.start.timestamp() as u64 ^ rows);

    let placeholders = vec!["?"; schema::EXPECTED_COLUMNS.len()].join(", ");
    let mut stmt = conn.prepare(&format!("INSERT INTO \"{table}\" VALUES ({placeholders})"))?;

    for i in 0..rows {
        let offset = (i as f64 * step_seconds) + rng.gen_range(0.0..step_seconds.max(1.0)) * 0.5;
        let time = range.start + Duration::seconds(offset as i64);
        let queue = QUEUES[rng.gen_range(0..QUEUES.len())];

        let wait_minutes = rng.gen_range(0..240);
        let runtime_minutes = match queue {
            "debug" => rng.gen_range(1..30),
            _ => rng.gen_range(5..1_440),
        };
        let submit = time - Duration::minutes(wait_minutes + runtime_minutes);
        let start = submit + Duration::minutes(wait_minutes);
        let end = time;
        let timelimit = f64::from(rng.gen_range(1..48)) * 3600.0;

        let nhosts = if queue == "bigmem" {
            1
        } else {
            rng.gen_range(1..17)
        };
        let ncores = nhosts * rng.gen_range(1..65);
        let host = format!("node{:04}", rng.gen_range(1..512));
        let exitcode = if rng.gen_bool(0.92) { "0:0" } else { "1:0" };

        let gpu_used = if queue == "gpu" {
            rng.gen_range(5.0..98.0)
        } else {
            0.0
        };
        let mem_used: f64 = if rng.gen_bool(0.02) {
            // Occasional outlier so trimmed aggregation has something to trim.
            rng.gen_range(400.0..1_500.0)
        } else {
            rng.gen_range(0.5..64.0)
        };
        let mem_used_minus_cache = mem_used * rng.gen_range(0.4..0.95);

        stmt.execute(params![
            naive(time),
            naive(submit),
            naive(start),
            naive(end),
            timelimit,
            f64::from(nhosts),
            f64::from(ncores),
            ACCOUNTS[rng.gen_range(0..ACCOUNTS.len())],
            queue,
            host,
            exitcode,
            USERS[rng.gen_range(0..USERS.len())],
            rng.gen_range(1.0..100.0),
            gpu_used,
            mem_used,
            mem_used_minus_cache,
            rng.gen_range(0.0..200.0),
            rng.gen_range(0.0..100.0),
        ])?;
    }

    Ok(rows)
}

fn naive(value: chrono::DateTime<chrono::Utc>) -> NaiveDateTime {
    value.naive_utc()
}
