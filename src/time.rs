use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A user-selected (start, end] window over job records. `end` must be
/// after `start`; spans beyond the configured maximum are clamped by moving
/// `start` forward, since the most recent data is what the dashboard shows
/// by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, max_days: i64) -> Result<Self> {
        if end <= start {
            anyhow::bail!("time range end must be after start");
        }
        let max_span = Duration::days(max_days.max(1));
        let start = if end - start > max_span {
            let clamped = end - max_span;
            tracing::warn!(
                requested_start = %start.to_rfc3339(),
                clamped_start = %clamped.to_rfc3339(),
                max_days,
                "time range exceeds maximum span; clamping start"
            );
            clamped
        } else {
            start
        };
        Ok(Self { start, end })
    }

    /// SQL predicate over the record timestamp column. Both endpoints are
    /// rendered as literals; callers only ever build ranges from validated
    /// `DateTime` values, never from raw strings.
    pub fn filter_sql(&self) -> String {
        format!(
            "\"time\" >= '{}'::TIMESTAMP AND \"time\" <= '{}'::TIMESTAMP",
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }

    /// Filename-safe rendering, used for export defaults.
    pub fn slug(&self) -> String {
        format!(
            "{}_{}",
            self.start.format("%Y%m%dT%H%M"),
            self.end.format("%Y%m%dT%H%M")
        )
    }
}

/// Last-used time range, persisted under the data root so export defaults
/// survive a restart.
pub struct SelectionStore {
    path: PathBuf,
}

impl SelectionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Option<TimeRange> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to read persisted selection"
                );
                return None;
            }
        };
        match serde_json::from_str::<TimeRange>(&contents) {
            Ok(range) if range.end > range.start => Some(range),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to parse persisted selection"
                );
                None
            }
        }
    }

    pub fn save(&self, range: &TimeRange) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(range)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_inverted_range() {
        let start = Utc.with_ymd_and_hms(2023, 1, 15, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap();
        assert!(TimeRange::new(start, end, 31).is_err());
        assert!(TimeRange::new(start, start, 31).is_err());
    }

    #[test]
    fn clamps_span_to_maximum() {
        let start = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, end, 31).unwrap();
        assert_eq!(range.end, end);
        assert_eq!(range.end - range.start, Duration::days(31));
    }

    #[test]
    fn selection_round_trips_through_disk() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = SelectionStore::new(temp.path().join("state/selection.json"));
        assert!(store.load().is_none());

        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 1, 15, 23, 59, 0).unwrap(),
            31,
        )?;
        store.save(&range)?;
        assert_eq!(store.load(), Some(range));
        Ok(())
    }

    #[test]
    fn filter_sql_uses_validated_endpoints() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 1, 15, 23, 59, 0).unwrap(),
            31,
        )
        .unwrap();
        let sql = range.filter_sql();
        assert!(sql.contains("2023-01-15T00:00:00+00:00"));
        assert!(sql.contains("2023-01-15T23:59:00+00:00"));
    }
}
