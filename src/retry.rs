//! Retrying invoker: deterministic exponential backoff around a fallible
//! async operation (§4.2).
//!
//! Two profiles are used throughout the engine: [`RetryPolicy::DEFAULT`] for
//! ordinary API calls, and [`RetryPolicy::OAUTH_REFRESH`] for token refresh,
//! which backs off more gently and gives up sooner since a stuck refresh
//! blocks every other call anyway. Backoff is deterministic — no jitter —
//! because tests assert on exact delay sequences.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SourceError;

/// An exponential backoff schedule: `initial`, doubling each attempt, capped
/// at `max_delay`, giving up after `max_attempts`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// The default policy for ordinary API calls: 30s initial, ×2, capped at
    /// 120s, up to 100 attempts.
    pub const DEFAULT: RetryPolicy = RetryPolicy {
        initial_delay: Duration::from_secs(30),
        multiplier: 2.0,
        max_delay: Duration::from_secs(120),
        max_attempts: 100,
    };

    /// The policy for OAuth token refresh: 1s initial, ×2, capped at 30s, up
    /// to 10 attempts.
    pub const OAUTH_REFRESH: RetryPolicy = RetryPolicy {
        initial_delay: Duration::from_secs(1),
        multiplier: 2.0,
        max_delay: Duration::from_secs(30),
        max_attempts: 10,
    };

    /// The delay before attempt `attempt` (1-indexed: the delay that
    /// precedes the *next* call after `attempt` has failed).
    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }
}

/// Run `op`, retrying on [`SourceError::is_retryable`] errors per `policy`
/// until it succeeds, a non-retryable error is returned, `max_attempts` is
/// exhausted, or `cancel` fires.
///
/// On exhaustion, returns the last error encountered.
pub async fn with_retry<F, Fut, T>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }

        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                warn!(attempt, error = %e, "retry attempts exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, error = %e, "retrying after transient error");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
