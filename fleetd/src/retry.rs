//! Bounded retries with exponential backoff around job store calls
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::store::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every following one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            base_delay: Self::DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Run `op` until it succeeds, reports [`StoreError::NotFound`], or the
/// retry budget runs out
///
/// Running out of retries turns the last error into
/// [`StoreError::Unreachable`].
pub async fn query_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &'static str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(StoreError::NotFound) => return Err(StoreError::NotFound),
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                debug!(what, attempt, ?delay, error = %e, "Store call failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(what, attempts = attempt + 1, error = %e, "Store call failed, giving up");
                return Err(StoreError::Unreachable(e.to_string()));
            }
        }
    }
}
