//! The `Stream` trait: per-entity sync logic (§4.7).
//!
//! Records are opaque JSON objects; a stream declares only the fields it
//! needs the engine to understand (`primary_key`, `cursor_field`) rather
//! than a full strongly-typed record shape (§9: "Dynamic record shapes").

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::shard::Shard;
use crate::state::StateManager;

/// Whether a stream should backfill everything or resume from its
/// watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    FullRefresh,
    Incremental,
}

/// A unit of work produced by `stream_slices`: either the whole stream in
/// one pass, or one of the shard planner's time ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slice {
    /// The singleton "undefined" slice: the whole stream, unsharded.
    Full,
    TimeRange(Shard),
}

/// Per-entity sync logic. The sync driver drives exactly one instance of
/// each requested stream per run.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Stable identifier used in the catalog, state map, and dependency
    /// declarations.
    fn name(&self) -> &str;

    /// The single field that uniquely identifies a record, if any.
    fn primary_key(&self) -> Option<&str>;

    /// The single field whose value is a monotonic watermark, if any. A
    /// stream with no cursor field supports full refresh only.
    fn cursor_field(&self) -> Option<&str>;

    /// A JSON Schema document describing this stream's record shape, for
    /// `discover` (§6).
    fn json_schema(&self) -> Value;

    /// Records between STATE checkpoints; `0` means "checkpoint only at
    /// shard boundaries".
    fn checkpoint_interval(&self) -> u64 {
        0
    }

    /// Names of streams that must complete before this one starts.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    fn supports_incremental(&self) -> bool {
        self.cursor_field().is_some()
    }

    /// Whether adjacent slices of this stream require cross-shard primary
    /// key dedup (§4.6). Meaningless (and ignored) when `primary_key` is
    /// `None`.
    fn dedup_across_shards(&self) -> bool {
        true
    }

    /// How many shard producers may run concurrently for this stream.
    fn shard_parallelism(&self) -> usize {
        10
    }

    /// Produce the slice sequence for this run. May be the singleton
    /// [`Slice::Full`] or a sequence of [`Slice::TimeRange`]s.
    async fn stream_slices(&self, sync_mode: SyncMode, state: &StateManager) -> Result<Vec<Slice>, SourceError>;

    /// Produce the lazy record sequence for one slice. Implementations
    /// compose the paginator, retrying invoker, and rate limiter
    /// internally; by the time a record reaches the driver it is a
    /// normalized JSON object.
    ///
    /// Takes an owned state snapshot and cancellation handle (rather than
    /// borrowing `self`) so the returned stream is `'static` and can be
    /// driven concurrently with its siblings by the orchestrator (§4.6),
    /// which spawns one task per shard.
    fn read_records(
        &self,
        sync_mode: SyncMode,
        slice: Slice,
        state: StateManager,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<Value, SourceError>>;

    /// Idempotent lifecycle hook run once before any slice of this stream
    /// is read.
    async fn on_before_read(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Idempotent lifecycle hook run once after the last slice of this
    /// stream has drained.
    async fn on_after_read(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// `{cutoff: max(current.cutoff, epoch_ms(record[cursorField]))}`. A
    /// stream with no cursor field returns `current_cutoff` unchanged.
    fn get_updated_state(&self, current_cutoff: Option<i64>, record: &Value) -> Option<i64> {
        let field = self.cursor_field()?;
        let new_val = epoch_ms_of(record, field)?;
        Some(current_cutoff.map_or(new_val, |c| c.max(new_val)))
    }
}

/// Extract `record[field]` as epoch milliseconds, accepting either an
/// RFC 3339 timestamp string or a raw numeric value already in
/// milliseconds.
pub fn epoch_ms_of(record: &Value, field: &str) -> Option<i64> {
    let value = record.get(field)?;
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let s = value.as_str()?;
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
