use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::{BackendError, BackendResult};

/// Bounded retry for backend calls answered with a rate limit.
#[derive(Debug, Clone)]
pub struct RateLimitBackoff {
    /// Total calls allowed while the backend keeps rate limiting.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimitBackoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RateLimitBackoff {
    /// Delay after the `attempt`-th rate-limited call (1-based). A server
    /// supplied `Retry-After` replaces the exponential step; both are capped.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        retry_after.unwrap_or(exponential).min(self.max_delay)
    }

    /// Run `call` until it stops reporting a rate limit or the attempts run
    /// out. Any other outcome is returned as-is.
    pub async fn run<T, F, Fut>(&self, label: &'static str, mut call: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Err(BackendError::RateLimited { retry_after }) if attempt < attempts => {
                    let wait = self.delay(attempt, retry_after);
                    warn!(
                        event = "backend_rate_limited",
                        call = label,
                        attempt,
                        wait_ms = wait.as_millis() as u64
                    );
                    sleep(wait).await;
                }
                other => {
                    if attempt > 1 {
                        debug!(event = "backend_call_settled", call = label, attempt, ok = other.is_ok());
                    }
                    return other;
                }
            }
        }
    }
}
