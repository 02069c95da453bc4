use crate::services::engine::{EngineError, EngineSession};
use crate::services::schema::{self, ColumnKind, ColumnSpec};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("column {0} is not numeric")]
    NotNumeric(String),
    #[error("column {0} is not categorical")]
    NotCategorical(String),
    #[error("bin count must be at least 1")]
    InvalidBins,
    #[error("category count must be at least 1")]
    InvalidTopN,
    #[error("view construction failed: {0}")]
    Engine(#[from] EngineError),
}

/// What shape of derived view a chart asks for. Outlier trimming is not a
/// caller choice: the builder applies it to flagged columns when their
/// magnitude warrants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewRequest {
    Aggregate,
    Histogram { bins: u32 },
    TopCategories { keep: u32 },
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct AggregateRow {
    pub bucket: DateTime<Utc>,
    pub avg_value: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub samples: i64,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct HistogramRow {
    pub bin: i64,
    pub bin_start: f64,
    pub bin_end: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct CategoryRow {
    pub category: String,
    pub count: i64,
    pub is_other: bool,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum ViewRows {
    Aggregate(Vec<AggregateRow>),
    Histogram(Vec<HistogramRow>),
    Categories(Vec<CategoryRow>),
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ChartView {
    pub view: String,
    pub trimmed: bool,
    #[serde(flatten)]
    pub data: ViewRows,
}

/// Builds uniquely named derived views for one chart request at a time.
/// All identifiers are validated against the column catalog and the known
/// table names before they reach query text.
pub struct ViewBuilder {
    engine: Arc<EngineSession>,
}

impl ViewBuilder {
    pub fn new(engine: Arc<EngineSession>) -> Self {
        Self { engine }
    }

    pub async fn build(
        &self,
        table: &str,
        column: &str,
        request: ViewRequest,
    ) -> Result<ChartView, ViewError> {
        if !schema::is_known_table(table) {
            return Err(ViewError::UnknownTable(table.to_string()));
        }
        let spec = schema::expected_column(column)
            .ok_or_else(|| ViewError::UnknownColumn(column.to_string()))?;

        match request {
            ViewRequest::Aggregate => self.build_aggregate(table, spec).await,
            ViewRequest::Histogram { bins } => self.build_histogram(table, spec, bins).await,
            ViewRequest::TopCategories { keep } => self.build_top_n(table, spec, keep).await,
        }
    }

    async fn build_aggregate(
        &self,
        table: &str,
        spec: &'static ColumnSpec,
    ) -> Result<ChartView, ViewError> {
        if spec.kind != ColumnKind::Numeric {
            return Err(ViewError::NotNumeric(spec.name.to_string()));
        }

        let trim = match spec.trim {
            Some(trim) if self.magnitude(table, spec).await? > trim.magnitude_threshold => {
                Some(trim)
            }
            _ => None,
        };
        let trimmed = trim.is_some();
        let name = view_name(spec.name, if trimmed { "trim" } else { "agg" });

        let aggregate_body = format!(
            "SELECT date_trunc('hour', \"time\") AS bucket, \
                    avg({col}) AS avg_value, \
                    min({col}) AS min_value, \
                    max({col}) AS max_value, \
                    count(*) AS samples \
             FROM \"{table}\"",
            col = spec.quoted(),
        );
        let sql = if let Some(trim) = trim {
            // Trim to the configured percentile band first so a handful of
            // extreme readings cannot compress the visible range.
            format!(
                "CREATE TEMPORARY VIEW \"{name}\" AS \
                 WITH bounds AS (\
                     SELECT quantile_cont({col}, {low}) AS lo, \
                            quantile_cont({col}, {high}) AS hi \
                     FROM \"{table}\"\
                 ) \
                 {aggregate_body}, bounds \
                 WHERE {col} >= bounds.lo AND {col} <= bounds.hi \
                 GROUP BY bucket ORDER BY bucket",
                col = spec.quoted(),
                low = trim.low,
                high = trim.high,
            )
        } else {
            format!("CREATE TEMPORARY VIEW \"{name}\" AS {aggregate_body} GROUP BY bucket ORDER BY bucket")
        };

        self.create_view(sql).await?;
        let rows = self.fetch_aggregate(&name).await?;
        Ok(ChartView {
            view: name,
            trimmed,
            data: ViewRows::Aggregate(rows),
        })
    }

    async fn build_histogram(
        &self,
        table: &str,
        spec: &'static ColumnSpec,
        bins: u32,
    ) -> Result<ChartView, ViewError> {
        if spec.kind != ColumnKind::Numeric {
            return Err(ViewError::NotNumeric(spec.name.to_string()));
        }
        if bins == 0 {
            return Err(ViewError::InvalidBins);
        }

        let name = view_name(spec.name, "hist");
        // Bin index clamps to bins-1 so a value equal to the maximum lands
        // in the final bin: every bin is [start, end) except the last,
        // which is [start, end]. A constant column degenerates to bin 0.
        let sql = format!(
            "CREATE TEMPORARY VIEW \"{name}\" AS \
             WITH stats AS (\
                 SELECT min({col}) AS lo, max({col}) AS hi \
                 FROM \"{table}\" WHERE {col} IS NOT NULL\
             ), \
             edges AS (\
                 SELECT i AS bin, \
                        lo + (hi - lo) * i / {bins} AS bin_start, \
                        lo + (hi - lo) * (i + 1) / {bins} AS bin_end \
                 FROM stats, range({bins}) AS r(i) WHERE lo IS NOT NULL\
             ), \
             binned AS (\
                 SELECT coalesce(least(floor(({col} - lo) * {bins} / nullif(hi - lo, 0)), {bins} - 1), 0)::BIGINT AS bin \
                 FROM \"{table}\", stats WHERE {col} IS NOT NULL\
             ), \
             counts AS (SELECT bin, count(*) AS n FROM binned GROUP BY bin) \
             SELECT e.bin, e.bin_start, e.bin_end, coalesce(c.n, 0) AS n \
             FROM edges e LEFT JOIN counts c USING (bin) \
             ORDER BY e.bin",
            col = spec.quoted(),
        );

        self.create_view(sql).await?;
        let rows = self.fetch_histogram(&name).await?;
        Ok(ChartView {
            view: name,
            trimmed: false,
            data: ViewRows::Histogram(rows),
        })
    }

    async fn build_top_n(
        &self,
        table: &str,
        spec: &'static ColumnSpec,
        keep: u32,
    ) -> Result<ChartView, ViewError> {
        if spec.kind != ColumnKind::Text {
            return Err(ViewError::NotCategorical(spec.name.to_string()));
        }
        if keep == 0 {
            return Err(ViewError::InvalidTopN);
        }

        let name = view_name(spec.name, "top");
        let sql = format!(
            "CREATE TEMPORARY VIEW \"{name}\" AS \
             WITH counted AS (\
                 SELECT {col} AS category, count(*) AS n \
                 FROM \"{table}\" GROUP BY category\
             ), \
             ranked AS (\
                 SELECT category, n, row_number() OVER (ORDER BY n DESC, category) AS rnk \
                 FROM counted\
             ) \
             SELECT category, n, FALSE AS is_other FROM ranked WHERE rnk <= {keep} \
             UNION ALL \
             SELECT 'Others' AS category, sum(n)::BIGINT AS n, TRUE AS is_other \
             FROM ranked WHERE rnk > {keep} HAVING count(*) > 0 \
             ORDER BY is_other, n DESC, category",
            col = spec.quoted(),
        );

        self.create_view(sql).await?;
        let rows = self.fetch_categories(&name).await?;
        Ok(ChartView {
            view: name,
            trimmed: false,
            data: ViewRows::Categories(rows),
        })
    }

    /// Peak magnitude of a column, used to decide whether trimming is
    /// worth a quantile pass. Empty tables report zero.
    async fn magnitude(&self, table: &str, spec: &'static ColumnSpec) -> Result<f64, ViewError> {
        let sql = format!(
            "SELECT max(abs({col})) FROM \"{table}\"",
            col = spec.quoted()
        );
        let value = self
            .engine
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_row([], |row| row.get::<_, Option<f64>>(0))
            })
            .await?;
        Ok(value.unwrap_or(0.0))
    }

    async fn create_view(&self, sql: String) -> Result<(), ViewError> {
        self.engine
            .run(move |conn| conn.execute_batch(&sql))
            .await?;
        Ok(())
    }

    async fn fetch_aggregate(&self, view: &str) -> Result<Vec<AggregateRow>, ViewError> {
        let sql = format!("SELECT * FROM \"{view}\" ORDER BY bucket");
        let rows = self
            .engine
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let bucket: NaiveDateTime = row.get(0)?;
                    out.push(AggregateRow {
                        bucket: DateTime::<Utc>::from_naive_utc_and_offset(bucket, Utc),
                        avg_value: row.get(1)?,
                        min_value: row.get(2)?,
                        max_value: row.get(3)?,
                        samples: row.get(4)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    async fn fetch_histogram(&self, view: &str) -> Result<Vec<HistogramRow>, ViewError> {
        let sql = format!("SELECT * FROM \"{view}\" ORDER BY bin");
        let rows = self
            .engine
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(HistogramRow {
                        bin: row.get(0)?,
                        bin_start: row.get(1)?,
                        bin_end: row.get(2)?,
                        count: row.get(3)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }

    async fn fetch_categories(&self, view: &str) -> Result<Vec<CategoryRow>, ViewError> {
        let sql = format!("SELECT * FROM \"{view}\" ORDER BY is_other, n DESC, category");
        let rows = self
            .engine
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(CategoryRow {
                        category: row.get(0)?,
                        count: row.get(1)?,
                        is_other: row.get(2)?,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(rows)
    }
}

/// Collision-resistant view name: concurrent charts over the same column
/// must never share one.
fn view_name(column: &str, tag: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "v_{column}_{tag}_{}_{}",
        Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}
