use crate::config::DashConfig;
use crate::services::acquire::AcquirePipeline;
use crate::services::engine::{EngineSession, EngineSettings};
use crate::time::TimeRange;
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEMO_ROWS: u64 = 120;

pub fn test_config(root: &Path) -> DashConfig {
    DashConfig {
        data_root: root.to_path_buf(),
        static_root: None,
        engine_timezone: "UTC".to_string(),
        engine_memory_limit: "512MB".to_string(),
        engine_threads: 1,
        engine_max_concurrent: 2,
        engine_tmp_path: root.join("storage/tmp"),
        planner_url: None,
        planner_client_id: "jobdash-test".to_string(),
        planner_row_limit: 1_000_000,
        fetch_workers: 2,
        retry_max_attempts: 2,
        retry_base_delay: Duration::from_millis(1),
        retry_multiplier: 2.0,
        demo_rows: DEMO_ROWS,
        max_range_days: 31,
    }
}

/// File-backed engine session: tables survive the close/reopen cycle a
/// fresh load performs, which is what the acquisition tests depend on.
pub fn file_backed_session(root: &Path) -> Arc<EngineSession> {
    let config = test_config(root);
    let mut settings = EngineSettings::from_config(&config);
    settings.db_path = Some(root.join("storage/jobs.duckdb"));
    Arc::new(EngineSession::new(settings, config.engine_max_concurrent))
}

/// In-memory engine session for tests that seed and query in one breath.
pub fn mem_session(root: &Path) -> Arc<EngineSession> {
    let config = test_config(root);
    let mut settings = EngineSettings::from_config(&config);
    settings.db_path = None;
    Arc::new(EngineSession::new(settings, config.engine_max_concurrent))
}

pub fn pipeline(engine: Arc<EngineSession>, root: &Path) -> AcquirePipeline {
    AcquirePipeline::new(engine, reqwest::Client::new(), &test_config(root))
}

pub fn day_range() -> TimeRange {
    TimeRange::new(
        Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2023, 1, 15, 23, 59, 0).unwrap(),
        31,
    )
    .unwrap()
}

/// Writes a parquet chunk with `rows` job records stamped into the given
/// hour, via a scratch in-memory database.
pub fn write_chunk_file(path: &Path, rows: u32, hour: u32) -> anyhow::Result<()> {
    use crate::services::schema;

    let conn = duckdb::Connection::open_in_memory()?;
    conn.execute_batch(&schema::create_table_sql("chunk_src"))?;
    for i in 0..rows {
        conn.execute(
            &format!(
                "INSERT INTO chunk_src (\"time\", account, queue, username, cpu_used) \
                 VALUES ('2023-01-15 {hour:02}:{:02}:{:02}', 'astro', 'normal', 'agarcia', 50.0)",
                (i / 60) % 60,
                i % 60
            ),
            [],
        )?;
    }
    conn.execute_batch(&format!(
        "COPY chunk_src TO '{}' (FORMAT parquet)",
        path.display().to_string().replace('\'', "''")
    ))?;
    Ok(())
}

/// Serves a fake query planner plus its chunk files on an ephemeral local
/// port. Returns the planner base URL, or `None` when the sandbox forbids
/// binding a listener.
pub async fn spawn_planner(chunk_dir: &Path, chunk_files: &[&str]) -> Option<String> {
    use axum::routing::post;

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => return None,
        Err(err) => panic!("failed to bind planner listener: {err}"),
    };
    let addr = listener.local_addr().expect("planner listener addr");
    let base = format!("http://{addr}");

    let chunks: Vec<serde_json::Value> = chunk_files
        .iter()
        .map(|file| serde_json::json!({ "url": format!("{base}/files/{file}") }))
        .collect();
    let body = serde_json::json!({ "chunks": chunks }).to_string();
    let plan = serde_json::json!({ "transferId": "t-1", "body": body });

    let app = axum::Router::new()
        .route(
            "/",
            post(move || {
                let plan = plan.clone();
                async move { axum::Json(plan) }
            }),
        )
        .nest_service(
            "/files",
            tower_http::services::ServeDir::new(chunk_dir.to_path_buf()),
        );
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::warn!(error = %err, "test planner server exited");
        }
    });

    Some(base)
}
