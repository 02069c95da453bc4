use anyhow::Result;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATA_ROOT: &str = "/var/lib/jobdash";

/// Runtime configuration, resolved once at startup from `JOBDASH_*`
/// environment variables. Numeric values are clamped to sane ranges so a
/// stray environment override cannot push the embedded engine past the
/// host's memory ceiling.
#[derive(Debug, Clone)]
pub struct DashConfig {
    pub data_root: PathBuf,
    pub static_root: Option<PathBuf>,

    pub engine_timezone: String,
    pub engine_memory_limit: String,
    pub engine_threads: u64,
    pub engine_max_concurrent: usize,
    pub engine_tmp_path: PathBuf,

    pub planner_url: Option<String>,
    pub planner_client_id: String,
    pub planner_row_limit: u64,
    pub fetch_workers: usize,

    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_multiplier: f64,

    pub demo_rows: u64,
    pub max_range_days: i64,
}

impl DashConfig {
    pub fn from_env(cli_static_root: Option<PathBuf>) -> Result<Self> {
        let data_root = env_path("JOBDASH_DATA_ROOT", DEFAULT_DATA_ROOT)?;
        validate_data_path(&data_root, "JOBDASH_DATA_ROOT")?;
        let static_root = cli_static_root.or_else(|| env_optional_path("JOBDASH_STATIC_ROOT"));

        let engine_tmp_default = data_root.join("storage/tmp");
        let engine_tmp_path = env_path(
            "JOBDASH_ENGINE_TMP_PATH",
            &engine_tmp_default.to_string_lossy(),
        )?;
        validate_data_path(&engine_tmp_path, "JOBDASH_ENGINE_TMP_PATH")?;

        let engine_timezone = env_string("JOBDASH_ENGINE_TIMEZONE", "UTC");
        let engine_memory_limit = env_string("JOBDASH_ENGINE_MEMORY_LIMIT", "2GB");
        let engine_threads = env_u64("JOBDASH_ENGINE_THREADS", 2).clamp(1, 16);
        let engine_max_concurrent =
            env_u64("JOBDASH_ENGINE_MAX_CONCURRENT", 2).clamp(1, 16) as usize;

        let planner_url = env_optional_string("JOBDASH_PLANNER_URL");
        let planner_client_id = env_string("JOBDASH_PLANNER_CLIENT_ID", "jobdash");
        let planner_row_limit =
            env_u64("JOBDASH_PLANNER_ROW_LIMIT", 2_000_000).clamp(1_000, 50_000_000);
        let fetch_workers = env_u64("JOBDASH_FETCH_WORKERS", 4).clamp(1, 16) as usize;

        let retry_max_attempts = env_u64("JOBDASH_RETRY_MAX_ATTEMPTS", 5).clamp(1, 10) as u32;
        let retry_base_delay =
            Duration::from_millis(env_u64("JOBDASH_RETRY_BASE_DELAY_MS", 250).clamp(10, 10_000));
        let retry_multiplier = env_f64("JOBDASH_RETRY_MULTIPLIER", 2.0).clamp(1.0, 10.0);

        let demo_rows = env_u64("JOBDASH_DEMO_ROWS", 500).clamp(1, 1_000_000);
        let max_range_days = env_u64("JOBDASH_MAX_RANGE_DAYS", 31).clamp(1, 366) as i64;

        Ok(Self {
            data_root,
            static_root,
            engine_timezone,
            engine_memory_limit,
            engine_threads,
            engine_max_concurrent,
            engine_tmp_path,
            planner_url,
            planner_client_id,
            planner_row_limit,
            fetch_workers,
            retry_max_attempts,
            retry_base_delay,
            retry_multiplier,
            demo_rows,
            max_range_days,
        })
    }

    pub fn selection_state_path(&self) -> PathBuf {
        self.data_root.join("state/selection.json")
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn env_optional_path(key: &str) -> Option<PathBuf> {
    env_optional_string(key).map(PathBuf::from)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

fn validate_data_path(path: &Path, label: &str) -> Result<()> {
    if !path.is_absolute() {
        anyhow::bail!("{label} must be an absolute path");
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            anyhow::bail!("{label} must not contain '..' segments");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_or_parent_paths() {
        assert!(validate_data_path(Path::new("relative/path"), "TEST").is_err());
        assert!(validate_data_path(Path::new("/tmp/../etc"), "TEST").is_err());
        assert!(validate_data_path(Path::new("/var/lib/jobdash"), "TEST").is_ok());
    }

    #[test]
    fn env_f64_ignores_garbage() {
        std::env::remove_var("JOBDASH_TEST_F64");
        assert_eq!(env_f64("JOBDASH_TEST_F64", 2.0), 2.0);
        std::env::set_var("JOBDASH_TEST_F64", "nan");
        assert_eq!(env_f64("JOBDASH_TEST_F64", 2.0), 2.0);
        std::env::set_var("JOBDASH_TEST_F64", "1.5");
        assert_eq!(env_f64("JOBDASH_TEST_F64", 2.0), 1.5);
        std::env::remove_var("JOBDASH_TEST_F64");
    }
}
