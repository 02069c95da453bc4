use crate::services::engine::{EngineError, EngineSession};
use crate::services::schema;
use crate::time::TimeRange;
use chrono::DateTime;
use duckdb::types::{TimeUnit, ValueRef};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no rows matched the export filter")]
    NoDataToExport,
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("export query failed: {0}")]
    Engine(#[from] EngineError),
    #[error("csv serialization failed: {0}")]
    Serialize(String),
}

#[derive(Debug)]
pub struct CsvExport {
    pub bytes: Vec<u8>,
    pub rows: u64,
}

/// `SELECT *` over the resolved table, optionally filtered by the active
/// time-range selection, serialized to CSV. Fields containing the
/// delimiter are quoted by the writer; temporal values render ISO-8601;
/// NULL renders as an empty field. Nothing is produced when zero rows
/// match.
pub async fn export_csv(
    engine: &Arc<EngineSession>,
    table: &str,
    range: Option<TimeRange>,
) -> Result<CsvExport, ExportError> {
    if !schema::is_known_table(table) {
        return Err(ExportError::UnknownTable(table.to_string()));
    }

    let table = table.to_string();
    let (header, rows) = engine
        .run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_name = ? AND table_schema = 'main' ORDER BY ordinal_position",
            )?;
            let mut name_rows = stmt.query([table.as_str()])?;
            let mut header: Vec<String> = Vec::new();
            while let Some(row) = name_rows.next()? {
                header.push(row.get(0)?);
            }

            let where_clause = range
                .map(|r| format!(" WHERE {}", r.filter_sql()))
                .unwrap_or_default();
            let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\"{where_clause}"))?;
            let mut result = stmt.query([])?;
            let mut rows: Vec<Vec<String>> = Vec::new();
            while let Some(row) = result.next()? {
                let mut record = Vec::with_capacity(header.len());
                for idx in 0..header.len() {
                    record.push(format_field(row.get_ref(idx)?));
                }
                rows.push(record);
            }
            Ok((header, rows))
        })
        .await?;

    if rows.is_empty() {
        return Err(ExportError::NoDataToExport);
    }

    let row_count = rows.len() as u64;
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&header)
        .map_err(|err| ExportError::Serialize(err.to_string()))?;
    for record in rows {
        writer
            .write_record(&record)
            .map_err(|err| ExportError::Serialize(err.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| ExportError::Serialize(err.to_string()))?;

    Ok(CsvExport {
        bytes,
        rows: row_count,
    })
}

fn format_field(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Boolean(v) => v.to_string(),
        ValueRef::TinyInt(v) => v.to_string(),
        ValueRef::SmallInt(v) => v.to_string(),
        ValueRef::Int(v) => v.to_string(),
        ValueRef::BigInt(v) => v.to_string(),
        ValueRef::HugeInt(v) => v.to_string(),
        ValueRef::UTinyInt(v) => v.to_string(),
        ValueRef::USmallInt(v) => v.to_string(),
        ValueRef::UInt(v) => v.to_string(),
        ValueRef::UBigInt(v) => v.to_string(),
        ValueRef::Float(v) => v.to_string(),
        ValueRef::Double(v) => v.to_string(),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Timestamp(unit, raw) => format_timestamp(unit, raw),
        ValueRef::Date32(days) => chrono::NaiveDate::from_num_days_from_ce_opt(days + 719_163)
            .map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        other => {
            tracing::warn!(kind = ?other.data_type(), "unsupported column type in export; writing empty field");
            String::new()
        }
    }
}

fn format_timestamp(unit: TimeUnit, raw: i64) -> String {
    let micros = match unit {
        TimeUnit::Second => raw.saturating_mul(1_000_000),
        TimeUnit::Millisecond => raw.saturating_mul(1_000),
        TimeUnit::Microsecond => raw,
        TimeUnit::Nanosecond => raw / 1_000,
    };
    DateTime::from_timestamp_micros(micros)
        .map(|ts| ts.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::schema::PRIMARY_TABLE;
    use crate::test_support;
    use anyhow::Result;

    async fn seeded_engine(
        temp: &tempfile::TempDir,
        seed_sql: &str,
    ) -> Result<Arc<EngineSession>> {
        let engine = test_support::mem_session(temp.path());
        engine.ensure_connected().await?;
        let sql = format!(
            "{}\n{}",
            schema::create_table_sql(PRIMARY_TABLE),
            seed_sql
        );
        engine.run(move |conn| conn.execute_batch(&sql)).await?;
        Ok(engine)
    }

    #[tokio::test]
    async fn quoted_fields_round_trip_through_a_csv_parser() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = seeded_engine(
            &temp,
            "INSERT INTO jobs (\"time\", account, username) \
             VALUES ('2023-01-15 08:00:00', 'astro,cosmology', NULL);",
        )
        .await?;

        let export = export_csv(&engine, PRIMARY_TABLE, None).await?;
        assert_eq!(export.rows, 1);

        let text = String::from_utf8(export.bytes.clone())?;
        assert!(text.contains("\"astro,cosmology\""));

        let mut reader = csv::Reader::from_reader(export.bytes.as_slice());
        let headers = reader.headers()?.clone();
        let account_idx = headers.iter().position(|h| h == "account").unwrap();
        let username_idx = headers.iter().position(|h| h == "username").unwrap();
        let time_idx = headers.iter().position(|h| h == "time").unwrap();

        let record = reader.records().next().unwrap()?;
        assert_eq!(&record[account_idx], "astro,cosmology");
        assert_eq!(&record[username_idx], "");
        assert_eq!(&record[time_idx], "2023-01-15T08:00:00");
        Ok(())
    }

    #[tokio::test]
    async fn header_row_matches_column_order() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = seeded_engine(
            &temp,
            "INSERT INTO jobs (\"time\") VALUES ('2023-01-15 08:00:00');",
        )
        .await?;

        let export = export_csv(&engine, PRIMARY_TABLE, None).await?;
        let mut reader = csv::Reader::from_reader(export.bytes.as_slice());
        let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
        let expected: Vec<String> = schema::EXPECTED_COLUMNS
            .iter()
            .map(|spec| spec.name.to_string())
            .collect();
        assert_eq!(headers, expected);
        Ok(())
    }

    #[tokio::test]
    async fn empty_result_produces_no_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = seeded_engine(&temp, "").await?;

        let err = export_csv(&engine, PRIMARY_TABLE, None).await.unwrap_err();
        assert!(matches!(err, ExportError::NoDataToExport));
        Ok(())
    }

    #[tokio::test]
    async fn time_range_filter_limits_the_export() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = seeded_engine(
            &temp,
            "INSERT INTO jobs (\"time\") VALUES ('2023-01-14 23:00:00');
             INSERT INTO jobs (\"time\") VALUES ('2023-01-15 08:00:00');
             INSERT INTO jobs (\"time\") VALUES ('2023-01-16 00:30:00');",
        )
        .await?;

        let export = export_csv(&engine, PRIMARY_TABLE, Some(test_support::day_range())).await?;
        assert_eq!(export.rows, 1);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_unknown_tables() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = seeded_engine(&temp, "").await?;

        let err = export_csv(&engine, "jobs'; --", None).await.unwrap_err();
        assert!(matches!(err, ExportError::UnknownTable(_)));
        Ok(())
    }

    #[tokio::test]
    async fn full_demo_export_has_one_line_per_row_plus_header() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = test_support::mem_session(temp.path());
        engine.ensure_connected().await?;
        let range = test_support::day_range();
        engine
            .run(move |conn| {
                crate::services::acquire::demo::synthesize_rows(conn, PRIMARY_TABLE, &range, 500)
            })
            .await?;

        let export = export_csv(&engine, PRIMARY_TABLE, None).await?;
        assert_eq!(export.rows, 500);
        let text = String::from_utf8(export.bytes)?;
        assert_eq!(text.lines().count(), 501);
        Ok(())
    }
}
