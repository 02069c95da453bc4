use super::LoadError;
use crate::services::engine::{escape_single_quotes, EngineSession};
use crate::services::retry::RetryPolicy;
use crate::services::schema;
use crate::time::TimeRange;
use duckdb::Connection;
use futures::stream::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Client for the remote query-planning service. One POST carries the
/// time-range query and a row cap; the response lists partition chunks to
/// download individually.
#[derive(Clone)]
pub struct RemoteSource {
    http: reqwest::Client,
    planner_url: String,
    client_id: String,
    row_limit: u64,
}

#[derive(Debug, Serialize)]
struct PlanRequest {
    query: String,
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "rowLimit")]
    row_limit: u64,
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    #[serde(rename = "transferId")]
    #[allow(dead_code)]
    transfer_id: Option<String>,
    /// JSON string, parsed separately into [`ChunkManifest`].
    body: String,
}

#[derive(Debug, Deserialize)]
struct ChunkManifest {
    #[serde(default)]
    chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chunk {
    pub url: String,
}

impl RemoteSource {
    pub fn new(http: reqwest::Client, planner_url: String, client_id: String, row_limit: u64) -> Self {
        Self {
            http,
            planner_url,
            client_id,
            row_limit,
        }
    }

    /// Asks the planner for the chunk list covering `range`. Non-2xx
    /// responses and malformed bodies are fatal for this load attempt.
    pub async fn plan_chunks(&self, range: &TimeRange) -> Result<Vec<Chunk>, LoadError> {
        let request = PlanRequest {
            query: format!(
                "SELECT * FROM {} WHERE {}",
                schema::PRIMARY_TABLE,
                range.filter_sql()
            ),
            client_id: self.client_id.clone(),
            row_limit: self.row_limit,
        };

        let response = self
            .http
            .post(&self.planner_url)
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| LoadError::RemoteFetch(format!("query planning failed: {err}")))?;
        let plan: PlanResponse = response
            .json()
            .await
            .map_err(|err| LoadError::RemoteFetch(format!("malformed planner response: {err}")))?;
        let manifest: ChunkManifest = serde_json::from_str(&plan.body)
            .map_err(|err| LoadError::RemoteFetch(format!("malformed chunk manifest: {err}")))?;
        Ok(manifest.chunks)
    }

    /// Downloads every chunk with bounded concurrency and loads each into
    /// the primary table as it arrives. Returns the total row count.
    /// `progress` observes (chunks processed, chunks total).
    pub async fn download_into_table(
        &self,
        engine: &Arc<EngineSession>,
        chunks: Vec<Chunk>,
        retry: RetryPolicy,
        workers: usize,
        scratch_dir: &Path,
        progress: impl Fn(usize, usize) + Send + Sync + 'static,
    ) -> Result<u64, LoadError> {
        let total = chunks.len();
        let processed = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(progress);
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|err| LoadError::RemoteFetch(format!("failed to create scratch dir: {err}")))?;

        let counts: Vec<u64> = futures::stream::iter(chunks.into_iter().map(|chunk| {
            let http = self.http.clone();
            let engine = Arc::clone(engine);
            let scratch_dir = scratch_dir.to_path_buf();
            let processed = Arc::clone(&processed);
            let progress = Arc::clone(&progress);
            async move {
                let inserted =
                    fetch_one_chunk(&http, &engine, &chunk, retry, &scratch_dir).await?;
                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                progress(done, total);
                Ok::<u64, LoadError>(inserted)
            }
        }))
        .buffer_unordered(workers.max(1))
        .try_collect()
        .await?;

        Ok(counts.iter().sum())
    }
}

async fn fetch_one_chunk(
    http: &reqwest::Client,
    engine: &Arc<EngineSession>,
    chunk: &Chunk,
    retry: RetryPolicy,
    scratch_dir: &Path,
) -> Result<u64, LoadError> {
    let download = {
        let http = http.clone();
        let url = chunk.url.clone();
        move || {
            let http = http.clone();
            let url = url.clone();
            async move {
                http.get(&url)
                    .send()
                    .await
                    .and_then(|response| response.error_for_status())?
                    .bytes()
                    .await
            }
        }
    };
    let bytes = retry
        .run("chunk download", download)
        .await
        .map_err(|err| LoadError::RemoteFetch(format!("failed to download {}: {err}", chunk.url)))?;

    let scratch = scratch_dir.join(format!("chunk_{}.parquet", Uuid::new_v4().simple()));
    tokio::fs::write(&scratch, &bytes)
        .await
        .map_err(|err| LoadError::RemoteFetch(format!("failed to stage chunk: {err}")))?;

    let path = scratch.clone();
    let result = engine
        .run(move |conn| insert_chunk(conn, &path))
        .await
        .map_err(|err| LoadError::RemoteFetch(format!("failed to load chunk into engine: {err}")));

    if let Err(err) = tokio::fs::remove_file(&scratch).await {
        tracing::warn!(path = %scratch.display(), error = %err, "failed to remove chunk scratch file");
    }
    result
}

/// Loads one staged chunk file. The first chunk creates the primary table
/// from the file's own schema; later chunks append by column name. Both
/// steps happen under the session lock, so concurrent chunk tasks cannot
/// race the existence check.
fn insert_chunk(conn: &Connection, path: &Path) -> duckdb::Result<u64> {
    let file = escape_single_quotes(&path.display().to_string());
    if schema::table_exists(conn, schema::PRIMARY_TABLE)? {
        let changed = conn.execute(
            &format!(
                "INSERT INTO \"{}\" BY NAME SELECT * FROM read_parquet('{file}', union_by_name = true)",
                schema::PRIMARY_TABLE
            ),
            [],
        )?;
        Ok(changed as u64)
    } else {
        conn.execute_batch(&format!(
            "CREATE TABLE \"{}\" AS SELECT * FROM read_parquet('{file}', union_by_name = true)",
            schema::PRIMARY_TABLE
        ))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT count(*) FROM \"{}\"",
            schema::PRIMARY_TABLE
        ))?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_chunk_file;
    use anyhow::Result;

    #[test]
    fn first_chunk_creates_then_later_chunks_append() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let chunk_a = temp.path().join("a.parquet");
        let chunk_b = temp.path().join("b.parquet");
        write_chunk_file(&chunk_a, 250, 8)?;
        write_chunk_file(&chunk_b, 250, 9)?;

        let conn = Connection::open_in_memory()?;
        assert_eq!(insert_chunk(&conn, &chunk_a)?, 250);
        assert_eq!(insert_chunk(&conn, &chunk_b)?, 250);

        let count: i64 = conn
            .prepare("SELECT count(*) FROM jobs")?
            .query_row([], |row| row.get(0))?;
        assert_eq!(count, 500);
        Ok(())
    }

    #[test]
    fn chunk_manifest_parses_from_nested_body() -> Result<()> {
        let body = serde_json::json!({
            "transferId": "t-123",
            "body": "{\"chunks\": [{\"url\": \"https://example.invalid/a.parquet\"}]}"
        });
        let plan: PlanResponse = serde_json::from_value(body)?;
        let manifest: ChunkManifest = serde_json::from_str(&plan.body)?;
        assert_eq!(manifest.chunks.len(), 1);
        assert_eq!(manifest.chunks[0].url, "https://example.invalid/a.parquet");
        Ok(())
    }

    #[test]
    fn empty_manifest_parses_to_no_chunks() -> Result<()> {
        let manifest: ChunkManifest = serde_json::from_str("{\"chunks\": []}")?;
        assert!(manifest.chunks.is_empty());
        let manifest: ChunkManifest = serde_json::from_str("{}")?;
        assert!(manifest.chunks.is_empty());
        Ok(())
    }
}
