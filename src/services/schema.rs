use duckdb::Connection;
use std::collections::HashSet;

pub const PRIMARY_TABLE: &str = "jobs";
pub const STAGING_TABLE: &str = "jobs_staging";
pub const COMPLETE_TABLE: &str = "jobs_full";

const KNOWN_TABLES: [&str; 3] = [PRIMARY_TABLE, STAGING_TABLE, COMPLETE_TABLE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Timestamp,
    Numeric,
    Text,
}

impl ColumnKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Timestamp => "TIMESTAMP",
            Self::Numeric => "DOUBLE",
            Self::Text => "VARCHAR",
        }
    }

    /// Placeholder value used when backfilling a column the source data
    /// never had. Numeric placeholders are zero so charts render a flat
    /// line instead of failing on an absent column.
    pub fn default_sql(self) -> &'static str {
        match self {
            Self::Timestamp => "TIMESTAMP '1970-01-01 00:00:00'",
            Self::Numeric => "0",
            Self::Text => "''",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Numeric => "numeric",
            Self::Text => "text",
        }
    }
}

/// Percentile band and activation threshold for outlier-trimmed
/// aggregation. The threshold compares raw magnitude, not a statistical
/// signal; it is deliberately configuration, tuned per metric.
#[derive(Debug, Clone, Copy)]
pub struct TrimSpec {
    pub low: f64,
    pub high: f64,
    pub magnitude_threshold: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub label: &'static str,
    pub trim: Option<TrimSpec>,
}

impl ColumnSpec {
    /// Identifier as spliced into SQL. Always quoted: `end` is a reserved
    /// word and unquoted splices are what the identifier guards exist to
    /// prevent.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.name)
    }
}

const TRIM_1_99: TrimSpec = TrimSpec {
    low: 0.01,
    high: 0.99,
    magnitude_threshold: 100.0,
};

const TRIM_IO: TrimSpec = TrimSpec {
    low: 0.01,
    high: 0.99,
    magnitude_threshold: 500.0,
};

/// Every column the chart and export layers assume exists. Order matters:
/// backfilled tables and the CSV header follow catalog order.
pub const EXPECTED_COLUMNS: [ColumnSpec; 18] = [
    ColumnSpec {
        name: "time",
        kind: ColumnKind::Timestamp,
        label: "Record time",
        trim: None,
    },
    ColumnSpec {
        name: "submit",
        kind: ColumnKind::Timestamp,
        label: "Submit time",
        trim: None,
    },
    ColumnSpec {
        name: "start",
        kind: ColumnKind::Timestamp,
        label: "Start time",
        trim: None,
    },
    ColumnSpec {
        name: "end",
        kind: ColumnKind::Timestamp,
        label: "End time",
        trim: None,
    },
    ColumnSpec {
        name: "timelimit",
        kind: ColumnKind::Numeric,
        label: "Time limit (s)",
        trim: None,
    },
    ColumnSpec {
        name: "nhosts",
        kind: ColumnKind::Numeric,
        label: "Hosts",
        trim: None,
    },
    ColumnSpec {
        name: "ncores",
        kind: ColumnKind::Numeric,
        label: "Cores",
        trim: None,
    },
    ColumnSpec {
        name: "account",
        kind: ColumnKind::Text,
        label: "Account",
        trim: None,
    },
    ColumnSpec {
        name: "queue",
        kind: ColumnKind::Text,
        label: "Queue",
        trim: None,
    },
    ColumnSpec {
        name: "host",
        kind: ColumnKind::Text,
        label: "Host",
        trim: None,
    },
    ColumnSpec {
        name: "exitcode",
        kind: ColumnKind::Text,
        label: "Exit code",
        trim: None,
    },
    ColumnSpec {
        name: "username",
        kind: ColumnKind::Text,
        label: "User",
        trim: None,
    },
    ColumnSpec {
        name: "cpu_used",
        kind: ColumnKind::Numeric,
        label: "CPU used (%)",
        trim: None,
    },
    ColumnSpec {
        name: "gpu_used",
        kind: ColumnKind::Numeric,
        label: "GPU used (%)",
        trim: None,
    },
    ColumnSpec {
        name: "mem_used",
        kind: ColumnKind::Numeric,
        label: "Memory used (GiB)",
        trim: Some(TRIM_1_99),
    },
    ColumnSpec {
        name: "mem_used_minus_cache",
        kind: ColumnKind::Numeric,
        label: "Memory minus cache (GiB)",
        trim: Some(TRIM_1_99),
    },
    ColumnSpec {
        name: "nfs_mb",
        kind: ColumnKind::Numeric,
        label: "NFS throughput (MB/s)",
        trim: Some(TRIM_IO),
    },
    ColumnSpec {
        name: "block_mb",
        kind: ColumnKind::Numeric,
        label: "Block I/O (MB/s)",
        trim: Some(TRIM_IO),
    },
];

pub fn expected_column(name: &str) -> Option<&'static ColumnSpec> {
    EXPECTED_COLUMNS.iter().find(|spec| spec.name == name)
}

pub fn is_known_table(name: &str) -> bool {
    KNOWN_TABLES.contains(&name)
}

pub fn table_exists(conn: &Connection, table: &str) -> duckdb::Result<bool> {
    let mut stmt = conn.prepare(
        "SELECT count(*) FROM information_schema.tables WHERE table_name = ? AND table_schema = 'main'",
    )?;
    let count: i64 = stmt.query_row([table], |row| row.get(0))?;
    Ok(count > 0)
}

/// Live column names of a table, lowercased.
fn live_columns(conn: &Connection, table: &str) -> duckdb::Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT column_name FROM information_schema.columns WHERE table_name = ? AND table_schema = 'main'",
    )?;
    let mut rows = stmt.query([table])?;
    let mut out = HashSet::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        out.insert(name.to_lowercase());
    }
    Ok(out)
}

/// Expected columns the table does not expose, in catalog order.
/// Read-only: inspection never mutates the table.
pub fn missing_columns(
    conn: &Connection,
    table: &str,
) -> duckdb::Result<Vec<&'static ColumnSpec>> {
    let live = live_columns(conn, table)?;
    Ok(EXPECTED_COLUMNS
        .iter()
        .filter(|spec| !live.contains(spec.name))
        .collect())
}

/// Returns the name of a table guaranteed to expose the full expected
/// column set. When nothing is missing the input name comes back unchanged
/// and no write happens. When materialization fails the original name
/// comes back too: charts over a short table degrade per-column instead of
/// taking the page down.
pub fn materialize_complete_table(conn: &Connection, table: &str) -> String {
    let missing = match missing_columns(conn, table) {
        Ok(missing) => missing,
        Err(err) => {
            tracing::warn!(table, error = %err, "failed to inspect table columns; using table as-is");
            return table.to_string();
        }
    };
    if missing.is_empty() {
        return table.to_string();
    }

    let backfill = missing
        .iter()
        .map(|spec| format!("{} AS {}", spec.kind.default_sql(), spec.quoted()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "CREATE OR REPLACE TABLE \"{COMPLETE_TABLE}\" AS SELECT *, {backfill} FROM \"{table}\""
    );
    match conn.execute_batch(&sql) {
        Ok(()) => {
            tracing::info!(
                table,
                complete = COMPLETE_TABLE,
                backfilled = missing.len(),
                "materialized complete table with placeholder columns"
            );
            COMPLETE_TABLE.to_string()
        }
        Err(err) => {
            tracing::warn!(table, error = %err, "failed to materialize complete table; using table as-is");
            table.to_string()
        }
    }
}

/// `CREATE TABLE` statement for a job table with the full expected schema.
pub fn create_table_sql(table: &str) -> String {
    let columns = EXPECTED_COLUMNS
        .iter()
        .map(|spec| format!("{} {}", spec.quoted(), spec.kind.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE OR REPLACE TABLE \"{table}\" ({columns})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use duckdb::Connection;

    #[test]
    fn catalog_lookup_is_exact() {
        assert!(expected_column("cpu_used").is_some());
        assert!(expected_column("CPU_USED").is_none());
        assert!(expected_column("cpu_used; DROP TABLE jobs").is_none());
        assert!(is_known_table("jobs"));
        assert!(!is_known_table("jobs; --"));
    }

    #[test]
    fn reports_missing_columns_in_catalog_order() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE jobs (\"time\" TIMESTAMP, account VARCHAR)")?;

        let missing = missing_columns(&conn, PRIMARY_TABLE)?;
        let names: Vec<&str> = missing.iter().map(|spec| spec.name).collect();
        assert!(!names.contains(&"time"));
        assert!(!names.contains(&"account"));
        assert_eq!(names.first(), Some(&"submit"));
        assert_eq!(names.last(), Some(&"block_mb"));
        Ok(())
    }

    #[test]
    fn no_op_when_table_is_already_complete() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&create_table_sql(PRIMARY_TABLE))?;

        let resolved = materialize_complete_table(&conn, PRIMARY_TABLE);
        assert_eq!(resolved, PRIMARY_TABLE);
        assert!(!table_exists(&conn, COMPLETE_TABLE)?);
        Ok(())
    }

    #[test]
    fn backfills_missing_columns_with_defaults() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE jobs (\"time\" TIMESTAMP, account VARCHAR);
             INSERT INTO jobs VALUES ('2023-01-15 08:00:00', 'astro');
             INSERT INTO jobs VALUES ('2023-01-15 09:00:00', 'bio');",
        )?;

        let resolved = materialize_complete_table(&conn, PRIMARY_TABLE);
        assert_eq!(resolved, COMPLETE_TABLE);
        assert!(missing_columns(&conn, &resolved)?.is_empty());

        let mut stmt =
            conn.prepare("SELECT count(*) FROM jobs_full WHERE gpu_used = 0 AND username = ''")?;
        let zero_filled: i64 = stmt.query_row([], |row| row.get(0))?;
        assert_eq!(zero_filled, 2);
        Ok(())
    }

    #[test]
    fn falls_back_to_original_table_on_failure() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        // No such table: materialization fails, reconciliation degrades.
        let resolved = materialize_complete_table(&conn, PRIMARY_TABLE);
        assert_eq!(resolved, PRIMARY_TABLE);
        Ok(())
    }
}
