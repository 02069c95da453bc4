use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Shared retry policy for every retryable operation. The constants live
/// in one place (config) instead of being scattered across call sites.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::DashConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: config.retry_base_delay,
            multiplier: config.retry_multiplier,
        }
    }

    /// Delay before retrying after the given 1-based failed attempt:
    /// `base * multiplier^(attempt - 1)`, capped at one minute.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(60_000.0);
        Duration::from_millis(millis as u64)
    }

    /// Runs `op` until it succeeds or the attempt ceiling is reached,
    /// sleeping the backoff delay between attempts. The final error is
    /// returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "operation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::warn!(label, attempt, error = %err, "operation failed; giving up");
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(2), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(1000));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10_000),
            multiplier: 10.0,
        };
        assert_eq!(policy.delay_after(9), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = quick_policy(5)
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("transient {n}"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn gives_up_at_the_attempt_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = quick_policy(3)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("always".to_string()) }
            })
            .await;
        assert_eq!(result, Err("always".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
