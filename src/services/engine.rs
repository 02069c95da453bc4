use duckdb::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to open analytical engine: {0}")]
    Open(#[source] duckdb::Error),
    #[error("engine connection is not open")]
    NotConnected,
    #[error("engine query failed: {0}")]
    Query(#[from] duckdb::Error),
    #[error("engine task did not complete")]
    TaskFailed,
}

/// Session settings applied to every fresh connection. They exist to keep
/// the embedded engine inside the host's memory ceiling; failing to apply
/// one leaves the connection usable.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Database file. `None` opens an in-memory database, which loses all
    /// tables on close; production runs file-backed so populated tables
    /// survive the close/reopen cycle a fresh load performs.
    pub db_path: Option<PathBuf>,
    pub timezone: String,
    pub memory_limit: String,
    pub threads: u64,
    pub tmp_path: PathBuf,
}

impl EngineSettings {
    pub fn from_config(config: &crate::config::DashConfig) -> Self {
        Self {
            db_path: Some(config.data_root.join("storage/jobs.duckdb")),
            timezone: config.engine_timezone.clone(),
            memory_limit: config.engine_memory_limit.clone(),
            threads: config.engine_threads,
            tmp_path: config.engine_tmp_path.clone(),
        }
    }
}

/// Owner of the single embedded-engine connection. All engine work goes
/// through [`EngineSession::run`], which executes on the blocking pool
/// behind a concurrency gate so long queries never stall the async
/// executor.
pub struct EngineSession {
    settings: EngineSettings,
    conn: Mutex<Option<Connection>>,
    gate: Arc<Semaphore>,
}

impl EngineSession {
    pub fn new(settings: EngineSettings, max_concurrent: usize) -> Self {
        Self {
            settings,
            conn: Mutex::new(None),
            gate: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    fn lock_conn(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Idempotent: concurrent callers all end up observing the same live
    /// connection, and a second call while connected is a no-op.
    pub fn connect(&self) -> Result<(), EngineError> {
        let mut guard = self.lock_conn();
        if guard.is_some() {
            return Ok(());
        }
        let conn = match &self.settings.db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if let Err(err) = std::fs::create_dir_all(parent) {
                        tracing::warn!(path = %parent.display(), error = %err, "failed to create database directory");
                    }
                }
                Connection::open(path).map_err(EngineError::Open)?
            }
            None => Connection::open_in_memory().map_err(EngineError::Open)?,
        };
        self.apply_session_settings(&conn);
        *guard = Some(conn);
        tracing::info!("analytical engine connection opened");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.lock_conn().is_some()
    }

    fn apply_session_settings(&self, conn: &Connection) {
        // UTC needs no ICU; anything else does. The install needs network
        // access on a cold extension cache, and timezone handling degrades
        // to UTC arithmetic without it.
        if !self.settings.timezone.eq_ignore_ascii_case("UTC") {
            if let Err(err) = conn.execute_batch("INSTALL icu; LOAD icu;") {
                tracing::warn!(error = %err, "failed to load ICU extension; continuing without it");
            }
        }
        let tmp_dir = self.settings.tmp_path.join("engine");
        if let Err(err) = std::fs::create_dir_all(&tmp_dir) {
            tracing::warn!(path = %tmp_dir.display(), error = %err, "failed to create engine temp directory");
        }
        let statements = [
            format!(
                "SET TimeZone = '{}'",
                escape_single_quotes(&self.settings.timezone)
            ),
            format!(
                "SET temp_directory = '{}'",
                escape_single_quotes(&tmp_dir.display().to_string())
            ),
            format!(
                "SET memory_limit = '{}'",
                escape_single_quotes(&self.settings.memory_limit)
            ),
            format!("SET threads = {}", self.settings.threads.max(1)),
            "PRAGMA enable_progress_bar = false".to_string(),
        ];
        for sql in statements {
            if let Err(err) = conn.execute_batch(&sql) {
                tracing::warn!(setting = %sql, error = %err, "failed to apply engine session setting");
            }
        }
    }

    /// Drops the connection and clears scratch storage. Never propagates:
    /// cleanup must not block teardown, and calling this twice is fine.
    pub fn close(&self) {
        let conn = self.lock_conn().take();
        if conn.is_some() {
            tracing::info!("analytical engine connection closed");
        }
        drop(conn);
        let tmp_dir = self.settings.tmp_path.join("engine");
        if tmp_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&tmp_dir) {
                tracing::warn!(path = %tmp_dir.display(), error = %err, "failed to clear engine temp directory");
            }
        }
    }

    /// Runs `f` against the live connection on the blocking pool. The
    /// session mutex is held for the duration, so closures see a
    /// consistent database even when loads and chart requests interleave.
    pub async fn run<T, F>(self: &Arc<Self>, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> duckdb::Result<T> + Send + 'static,
    {
        let _permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::TaskFailed)?;
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let guard = session.lock_conn();
            let Some(conn) = guard.as_ref() else {
                return Err(EngineError::NotConnected);
            };
            f(conn).map_err(EngineError::Query)
        })
        .await
        .map_err(|_| EngineError::TaskFailed)?
    }

    /// Async counterpart to [`EngineSession::connect`]. Opening the
    /// database touches the filesystem, so it runs on the blocking pool
    /// too.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), EngineError> {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || session.connect())
            .await
            .map_err(|_| EngineError::TaskFailed)?
    }
}

pub(crate) fn escape_single_quotes(input: &str) -> String {
    input.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn test_session(tmp: &std::path::Path) -> Arc<EngineSession> {
        Arc::new(EngineSession::new(
            EngineSettings {
                db_path: None,
                timezone: "UTC".to_string(),
                memory_limit: "512MB".to_string(),
                threads: 1,
                tmp_path: tmp.to_path_buf(),
            },
            2,
        ))
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_connection() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session = test_session(temp.path());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(
                async move { session.ensure_connected().await },
            ));
        }
        for handle in handles {
            handle.await??;
        }

        // State written through one caller's view is visible to all.
        session
            .run(|conn| conn.execute_batch("CREATE TABLE probe (v INTEGER)"))
            .await?;
        let count = session
            .run(|conn| {
                conn.prepare("SELECT count(*) FROM information_schema.tables WHERE table_name = 'probe'")?
                    .query_row([], |row| row.get::<_, i64>(0))
            })
            .await?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn run_without_connection_reports_not_connected() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session = test_session(temp.path());
        let err = session
            .run(|conn| conn.execute_batch("SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotConnected));
        Ok(())
    }

    #[tokio::test]
    async fn close_is_safe_to_repeat() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session = test_session(temp.path());
        session.ensure_connected().await?;
        assert!(session.is_connected());
        session.close();
        session.close();
        assert!(!session.is_connected());

        // Reconnect starts a fresh database.
        session.ensure_connected().await?;
        assert!(session.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn file_backed_tables_survive_reconnect() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session = Arc::new(EngineSession::new(
            EngineSettings {
                db_path: Some(temp.path().join("storage/jobs.duckdb")),
                timezone: "UTC".to_string(),
                memory_limit: "512MB".to_string(),
                threads: 1,
                tmp_path: temp.path().to_path_buf(),
            },
            1,
        ));
        session.ensure_connected().await?;
        session
            .run(|conn| {
                conn.execute_batch("CREATE TABLE kept (v INTEGER); INSERT INTO kept VALUES (7)")
            })
            .await?;
        session.close();

        session.ensure_connected().await?;
        let value = session
            .run(|conn| {
                conn.prepare("SELECT v FROM kept")?
                    .query_row([], |row| row.get::<_, i64>(0))
            })
            .await?;
        assert_eq!(value, 7);
        Ok(())
    }
}
