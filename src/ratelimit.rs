//! Per-endpoint rate limiter registry (§4.1).
//!
//! Each endpoint key holds a reservoir that starts at `steady` and is
//! refilled to `steady` on an absolute 60-second cadence (not a sliding
//! window), a minimum inter-arrival spacing derived from `burst`, and a
//! bounded number of concurrently in-flight calls. Callers schedule work
//! through [`RateLimiterRegistry::schedule`]; unknown endpoint keys are an
//! implementer error, not a runtime condition, so lookups panic rather than
//! return a `Result`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;

/// The `{burst, steady}` budget for one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EndpointBudget {
    /// Requests per second; drives the minimum inter-arrival spacing.
    pub burst: u32,
    /// Requests per 60-second window; the reservoir size.
    pub steady: u32,
}

impl EndpointBudget {
    pub const fn new(burst: u32, steady: u32) -> Self {
        Self { burst, steady }
    }

    /// `1000/burst × 1.25` ms, as a [`Duration`].
    fn min_inter_arrival(&self) -> Duration {
        let ms = (1000.0 / self.burst as f64) * 1.25;
        Duration::from_secs_f64(ms / 1000.0)
    }
}

/// Maximum number of in-flight calls per endpoint key.
const MAX_CONCURRENT_PER_ENDPOINT: usize = 20;

/// Absolute reservoir refresh cadence.
const RESERVOIR_REFRESH: Duration = Duration::from_secs(60);

/// Poll granularity while waiting for a reservoir token or pacing slot.
const PACING_POLL_INTERVAL: Duration = Duration::from_millis(5);

struct PacingState {
    tokens: u32,
    reservoir_refreshed_at: Instant,
    last_dispatch: Option<Instant>,
}

struct EndpointState {
    budget: EndpointBudget,
    pacing: Mutex<PacingState>,
    concurrency: Semaphore,
}

/// Registry of per-endpoint rate limiters, keyed by a stable endpoint string
/// such as `"GET:/events/"`.
pub struct RateLimiterRegistry {
    endpoints: HashMap<String, Arc<EndpointState>>,
}

impl RateLimiterRegistry {
    /// Build a registry from the static endpoint table. Typically called
    /// once at process startup with the connector's complete list of
    /// endpoints.
    pub fn new(table: impl IntoIterator<Item = (impl Into<String>, EndpointBudget)>) -> Self {
        let endpoints = table
            .into_iter()
            .map(|(key, budget)| {
                let state = Arc::new(EndpointState {
                    budget,
                    pacing: Mutex::new(PacingState {
                        tokens: budget.steady,
                        reservoir_refreshed_at: Instant::now(),
                        last_dispatch: None,
                    }),
                    concurrency: Semaphore::new(MAX_CONCURRENT_PER_ENDPOINT),
                });
                (key.into(), state)
            })
            .collect();
        Self { endpoints }
    }

    /// Run `f` under the pacing and concurrency budget of `endpoint_key`.
    ///
    /// Waits (cancellably) until a concurrency slot and a reservoir token are
    /// both available and the minimum inter-arrival spacing since the last
    /// dispatch on this key has elapsed, then invokes `f`. If `cancel` fires
    /// first, returns [`SourceError::Cancelled`] without consuming a token.
    ///
    /// # Panics
    /// Panics if `endpoint_key` was not present in the table passed to
    /// [`RateLimiterRegistry::new`] — referencing an undeclared endpoint is a
    /// connector bug, not a recoverable condition.
    pub async fn schedule<F, Fut, T>(
        &self,
        endpoint_key: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, SourceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let state = self
            .endpoints
            .get(endpoint_key)
            .unwrap_or_else(|| panic!("unknown endpoint key: {endpoint_key}"))
            .clone();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            permit = state.concurrency.acquire() => permit.expect("semaphore never closed"),
        };

        loop {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }

            let wait = {
                let mut pacing = state.pacing.lock().await;
                let now = Instant::now();

                if now.duration_since(pacing.reservoir_refreshed_at) >= RESERVOIR_REFRESH {
                    pacing.tokens = state.budget.steady;
                    pacing.reservoir_refreshed_at = now;
                }

                let min_gap = state.budget.min_inter_arrival();
                let earliest_dispatch = pacing
                    .last_dispatch
                    .map(|t| t + min_gap)
                    .unwrap_or(now);

                if pacing.tokens > 0 && now >= earliest_dispatch {
                    pacing.tokens -= 1;
                    pacing.last_dispatch = Some(now);
                    None
                } else {
                    Some(earliest_dispatch.saturating_duration_since(now).max(PACING_POLL_INTERVAL))
                }
            };

            match wait {
                None => break,
                Some(d) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                        _ = tokio::time::sleep(d) => {}
                    }
                }
            }
        }

        let result = f().await;
        drop(permit);
        result
    }
}
