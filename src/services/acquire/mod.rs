pub mod demo;
pub mod remote;

use crate::config::DashConfig;
use crate::services::engine::{EngineError, EngineSession};
use crate::services::retry::RetryPolicy;
use crate::services::schema;
use crate::time::TimeRange;
use remote::RemoteSource;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("analytical engine error: {0}")]
    Connection(#[from] EngineError),
    #[error("no data available to load")]
    NoDataAvailable,
    #[error("remote fetch failed: {0}")]
    RemoteFetch(String),
    #[error("empty result: {0}")]
    EmptyResult(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Idle,
    Connecting,
    Checking,
    Promoting,
    Fetching,
    Synthesizing,
    Reconciling,
    Ready,
    Failed,
}

/// Snapshot of the current load, observable while a load runs. `percent`
/// tracks chunks processed during a remote fetch.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct LoadStatus {
    pub phase: LoadPhase,
    pub percent: u8,
    pub resolved_table: Option<String>,
    pub rows: Option<u64>,
    pub error: Option<String>,
}

impl Default for LoadStatus {
    fn default() -> Self {
        Self {
            phase: LoadPhase::Idle,
            percent: 0,
            resolved_table: None,
            rows: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Existing table, then staging, then remote (when configured), then
    /// demo if requested.
    Auto,
    /// Skip the local fast paths and fetch from the planner.
    Remote,
    /// Synthesize demo rows unconditionally.
    Demo,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadRequest {
    pub range: TimeRange,
    pub source: DataSource,
    pub demo_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLoad {
    pub table: String,
    pub rows: u64,
}

/// One-shot load orchestration: state machine over connection, table
/// checks, staging promotion, remote fetch, demo synthesis, and schema
/// reconciliation. Sole writer of the resolved-table name.
pub struct AcquirePipeline {
    engine: Arc<EngineSession>,
    remote: Option<RemoteSource>,
    retry: RetryPolicy,
    fetch_workers: usize,
    demo_rows: u64,
    scratch_dir: PathBuf,
    status: RwLock<LoadStatus>,
    resolved: RwLock<Option<ResolvedLoad>>,
    load_serial: tokio::sync::Mutex<()>,
}

impl AcquirePipeline {
    pub fn new(engine: Arc<EngineSession>, http: reqwest::Client, config: &DashConfig) -> Self {
        let remote = config.planner_url.clone().map(|url| {
            RemoteSource::new(
                http,
                url,
                config.planner_client_id.clone(),
                config.planner_row_limit,
            )
        });
        Self {
            engine,
            remote,
            retry: RetryPolicy::from_config(config),
            fetch_workers: config.fetch_workers,
            demo_rows: config.demo_rows,
            scratch_dir: config.engine_tmp_path.join("chunks"),
            status: RwLock::new(LoadStatus::default()),
            resolved: RwLock::new(None),
            load_serial: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> LoadStatus {
        match self.status.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn resolved(&self) -> Option<ResolvedLoad> {
        match self.resolved.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_status(&self, update: impl FnOnce(&mut LoadStatus)) {
        let mut guard = match self.status.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut guard);
    }

    fn enter_phase(&self, phase: LoadPhase) {
        tracing::debug!(?phase, "load phase transition");
        self.set_status(|status| status.phase = phase);
    }

    /// Runs one load to a terminal state. Loads serialize; a new request
    /// discards the previous connection and resolved table wholesale
    /// before doing anything else, so no state from an older load can
    /// leak into this one.
    pub async fn load(self: &Arc<Self>, request: LoadRequest) -> Result<ResolvedLoad, LoadError> {
        let _serial = self.load_serial.lock().await;

        match self.resolved.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        self.set_status(|status| *status = LoadStatus::default());
        self.engine.close();

        self.enter_phase(LoadPhase::Connecting);
        let outcome = self.run_to_ready(&request).await;
        match outcome {
            Ok(resolved) => {
                match self.resolved.write() {
                    Ok(mut guard) => *guard = Some(resolved.clone()),
                    Err(poisoned) => *poisoned.into_inner() = Some(resolved.clone()),
                }
                self.set_status(|status| {
                    status.phase = LoadPhase::Ready;
                    status.percent = 100;
                    status.resolved_table = Some(resolved.table.clone());
                    status.rows = Some(resolved.rows);
                    status.error = None;
                });
                tracing::info!(table = %resolved.table, rows = resolved.rows, "load ready");
                Ok(resolved)
            }
            Err(err) => {
                self.set_status(|status| {
                    status.phase = LoadPhase::Failed;
                    status.error = Some(err.to_string());
                });
                tracing::warn!(error = %err, "load failed");
                Err(err)
            }
        }
    }

    async fn run_to_ready(self: &Arc<Self>, request: &LoadRequest) -> Result<ResolvedLoad, LoadError> {
        self.engine.ensure_connected().await?;

        self.enter_phase(LoadPhase::Checking);
        // A derived table from an earlier load is stale by definition.
        self.engine
            .run(|conn| {
                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS \"{}\"",
                    schema::COMPLETE_TABLE
                ))
            })
            .await?;

        if request.source == DataSource::Demo {
            return self.synthesize(request).await;
        }

        if request.source == DataSource::Auto {
            if self.count_rows(schema::PRIMARY_TABLE).await? > 0 {
                return self.reconcile().await;
            }
            if self.count_rows(schema::STAGING_TABLE).await? > 0 {
                return self.promote_staging().await;
            }
        }

        if let Some(remote) = self.remote.clone() {
            self.fetch_remote(&remote, request).await?;
            return self.reconcile().await;
        }

        if request.demo_fallback {
            return self.synthesize(request).await;
        }

        Err(LoadError::NoDataAvailable)
    }

    async fn promote_staging(self: &Arc<Self>) -> Result<ResolvedLoad, LoadError> {
        self.enter_phase(LoadPhase::Promoting);
        self.engine
            .run(|conn| {
                conn.execute_batch(&format!(
                    "CREATE OR REPLACE TABLE \"{}\" AS SELECT * FROM \"{}\"",
                    schema::PRIMARY_TABLE,
                    schema::STAGING_TABLE
                ))
            })
            .await?;
        self.reconcile().await
    }

    async fn fetch_remote(
        self: &Arc<Self>,
        remote: &RemoteSource,
        request: &LoadRequest,
    ) -> Result<(), LoadError> {
        self.enter_phase(LoadPhase::Fetching);
        let chunks = remote.plan_chunks(&request.range).await?;
        if chunks.is_empty() {
            return Err(LoadError::EmptyResult("no chunks".to_string()));
        }
        tracing::info!(chunks = chunks.len(), "query plan received");

        // Replace, never merge: the fetched range fully defines the table.
        self.engine
            .run(|conn| {
                conn.execute_batch(&format!(
                    "DROP TABLE IF EXISTS \"{}\"",
                    schema::PRIMARY_TABLE
                ))
            })
            .await?;

        let this = Arc::clone(self);
        let rows = remote
            .download_into_table(
                &self.engine,
                chunks,
                self.retry,
                self.fetch_workers,
                &self.scratch_dir,
                move |done, total| {
                    let percent = ((done * 100) / total.max(1)) as u8;
                    this.set_status(|status| status.percent = percent);
                },
            )
            .await?;
        if rows == 0 {
            return Err(LoadError::EmptyResult(
                "chunks present but empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn synthesize(self: &Arc<Self>, request: &LoadRequest) -> Result<ResolvedLoad, LoadError> {
        self.enter_phase(LoadPhase::Synthesizing);
        let range = request.range;
        let rows = self.demo_rows;
        self.engine
            .run(move |conn| demo::synthesize_rows(conn, schema::PRIMARY_TABLE, &range, rows))
            .await?;
        self.reconcile().await
    }

    async fn reconcile(self: &Arc<Self>) -> Result<ResolvedLoad, LoadError> {
        self.enter_phase(LoadPhase::Reconciling);
        let table = self
            .engine
            .run(|conn| {
                Ok(schema::materialize_complete_table(
                    conn,
                    schema::PRIMARY_TABLE,
                ))
            })
            .await?;
        let rows = self.count_rows(&table).await?;
        Ok(ResolvedLoad { table, rows })
    }

    async fn count_rows(&self, table: &str) -> Result<u64, LoadError> {
        let table = table.to_string();
        let count = self
            .engine
            .run(move |conn| {
                if !schema::table_exists(conn, &table)? {
                    return Ok(0);
                }
                let mut stmt = conn.prepare(&format!("SELECT count(*) FROM \"{table}\""))?;
                let count: i64 = stmt.query_row([], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await?;
        Ok(count)
    }
}
