//! Error types for the sync engine.
//!
//! All errors that can occur while running a sync are represented by
//! [`SourceError`]. Errors are propagated via `Result<T, SourceError>`
//! throughout the engine and classified so that retry, slice-failure, and
//! stream-failure budgets can make decisions without re-deriving taxonomy at
//! every call site.
//!
//! # Error Classification
//!
//! - **Transient** — network errors, rate-limit replies, HTTP 5xx. Retried by
//!   the retrying invoker.
//! - **ClientFault** — HTTP 400-class. Never retried; surfaced to the stream.
//! - **NonFatal** — advisory errors a stream raises to skip-and-continue the
//!   current slice.
//! - **Fatal** — cancellation, schema violations, missing streams, dependency
//!   cycles, and configuration errors. Terminates the run.

use std::fmt;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    // ── Transient — retried by the retrying invoker ──────────────────────
    /// A network-level or server-side (5xx) failure. Always retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The upstream signalled a rate limit (e.g. HTTP 429). Retryable, and
    /// may carry a server-suggested `retry_after` hint.
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited { retry_after: Option<std::time::Duration> },

    // ── Client-fault — never retried ──────────────────────────────────────
    /// An HTTP 400-class response. Not retried; bubbles to the stream.
    #[error("client fault ({status}): {message}")]
    ClientFault { status: u16, message: String },

    // ── NonFatal — absorbed by the stream's slice loop ───────────────────
    /// A stream-raised advisory error: skip the current slice and continue.
    #[error("non-fatal: {0}")]
    NonFatal(String),

    // ── Fatal — terminate the run ─────────────────────────────────────────
    /// The run was cancelled, typically because another slice or stream
    /// failed unrecoverably.
    #[error("operation cancelled")]
    Cancelled,

    /// A record did not conform to the stream's declared schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// The catalog referenced a stream the source does not provide.
    #[error("unknown stream: {0}")]
    UnknownStream(String),

    /// The stream dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A `max_stream_failures` or `max_slice_failures` budget was exceeded.
    #[error("{kind} failure budget exceeded for {name}")]
    BudgetExceeded { kind: &'static str, name: String },

    /// The configuration document was missing a required field or held an
    /// invalid value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication failed in a way retrying cannot fix (e.g. a rejected
    /// refresh token).
    #[error("authentication error: {0}")]
    Auth(String),

    // ── Infrastructure ─────────────────────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An unexpected internal error. Indicates a bug in the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The four-way classification used to decide retry/continue/abort behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    ClientFault,
    NonFatal,
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::ClientFault => "client_fault",
            ErrorClass::NonFatal => "non_fatal",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl SourceError {
    /// Classify this error for retry/budget decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            SourceError::Transient(_)
            | SourceError::RateLimited { .. }
            | SourceError::Io(_) => ErrorClass::Transient,
            SourceError::ClientFault { .. } => ErrorClass::ClientFault,
            SourceError::NonFatal(_) => ErrorClass::NonFatal,
            SourceError::Cancelled
            | SourceError::SchemaViolation(_)
            | SourceError::UnknownStream(_)
            | SourceError::CycleDetected(_)
            | SourceError::BudgetExceeded { .. }
            | SourceError::Config(_)
            | SourceError::Auth(_)
            | SourceError::Json(_)
            | SourceError::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the retrying invoker should retry this error.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether a stream loop should treat this as skip-and-continue rather
    /// than counting it against the slice-failure budget.
    pub fn is_non_fatal(&self) -> bool {
        self.class() == ErrorClass::NonFatal
    }

    /// Whether this error must terminate the run regardless of any
    /// configured failure budget. A strict subset of `class() ==
    /// ErrorClass::Fatal`: budget-exceeded, auth, and internal errors are
    /// still classified `Fatal` for display/logging purposes, but they are
    /// exactly the "unsliced stream failure" errors §7 expects the driver's
    /// own `max_stream_failures`/`max_slice_failures` budgets to absorb,
    /// so they must NOT short-circuit that budget accounting here.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SourceError::Cancelled
                | SourceError::SchemaViolation(_)
                | SourceError::UnknownStream(_)
                | SourceError::CycleDetected(_)
                | SourceError::Config(_)
        )
    }
}
