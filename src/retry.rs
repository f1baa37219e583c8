//! Bounded retry with exponential backoff, shared by both service clients.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(retry)
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or the attempt
/// ceiling is reached. Non-transient errors are returned immediately
/// without further attempts.
pub async fn with_retries<T, E, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    is_transient: fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_transient(&err) => return Err(err),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.backoff(attempt - 1);
                warn!(
                    "{what} attempt {attempt}/{} failed ({err}), retrying in {:?}",
                    policy.max_attempts, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
