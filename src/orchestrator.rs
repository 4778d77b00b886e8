//! Parallel-Sequential Orchestrator: runs shards concurrently but yields
//! records strictly in shard-generation order, with optional cross-shard
//! dedup (§4.6).

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::spool::Spool;

/// The windowing constant from §4.6: a record is retained in `currentIds`
/// only if its cursor value is after `nextShardFrom - 2 minutes`.
const DEDUP_RETENTION_WINDOW: ChronoDuration = ChronoDuration::minutes(2);

/// Per-stream dedup configuration, threaded through from the owning stream.
#[derive(Debug, Clone, Copy)]
pub struct DedupPolicy {
    pub enabled: bool,
}

impl DedupPolicy {
    pub const DISABLED: DedupPolicy = DedupPolicy { enabled: false };

    /// A stream without a primary key implicitly disables dedup regardless
    /// of the configured flag (§4.6 edge case).
    pub fn resolved(enabled: bool, has_primary_key: bool) -> Self {
        DedupPolicy {
            enabled: enabled && has_primary_key,
        }
    }
}

/// One unit of work fed to the orchestrator: a record producer for a shard,
/// plus the fields needed for ordering and dedup.
pub struct ShardJob<S> {
    pub records: S,
    /// `primary_key` field name, if the stream declares one.
    pub primary_key_field: Option<String>,
    /// `cursor_field` field name, if the stream declares one.
    pub cursor_field: Option<String>,
    /// The `from` boundary of the *next* shard in generation order, if any.
    /// Anchors the dedup retention window per §4.6 step 3 — `None` for the
    /// last shard, where nothing downstream needs the retained ids anyway.
    pub next_shard_from: Option<DateTime<Utc>>,
}

type DedupKey = String;
type RecordStream = Pin<Box<dyn Stream<Item = Result<Value, SourceError>> + Send>>;

fn value_as_dedup_key(v: &Value) -> Option<DedupKey> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Whether a record's cursor value falls late enough in the shard to be
/// worth retaining for next-shard dedup: after `nextShardFrom - 2 minutes`
/// (§4.6 step 3). Without a cursor value, or without a next shard to anchor
/// against, retains the key rather than silently dropping dedup coverage.
fn is_within_retention_window(
    record: &Value,
    cursor_field: Option<&str>,
    next_shard_from: Option<DateTime<Utc>>,
) -> bool {
    let Some(field) = cursor_field else { return true };
    let Some(raw) = record.get(field).and_then(Value::as_str) else {
        return true;
    };
    let Some(next_shard_from) = next_shard_from else {
        return true;
    };
    let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) else {
        return true;
    };
    ts.with_timezone(&Utc) > next_shard_from - DEDUP_RETENTION_WINDOW
}

struct ShardState {
    spool: Arc<Spool>,
    reader: Option<RecordStream>,
    writer: Option<JoinHandle<Result<(), SourceError>>>,
    primary_key_field: Option<String>,
    cursor_field: Option<String>,
    next_shard_from: Option<DateTime<Utc>>,
}

struct ConsumeState {
    shards: Vec<ShardState>,
    index: usize,
    last_ids: HashSet<DedupKey>,
    current_ids: HashSet<DedupKey>,
    dedup: DedupPolicy,
    cancel: CancellationToken,
    failed: bool,
}

/// Run each job in `jobs` under a spool, with up to `parallel` spools
/// writing concurrently, and yield every record downstream in job order.
///
/// `jobs` must already be ordered as the shard planner generated them; the
/// orchestrator does not reorder jobs, only interleaves their production
/// with their strictly-sequential consumption.
pub fn run<S>(
    dir: &std::path::Path,
    jobs: Vec<ShardJob<S>>,
    dedup: DedupPolicy,
    parallel: usize,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Value, SourceError>>
where
    S: Stream<Item = Result<Value, SourceError>> + Unpin + Send + 'static,
{
    let gate = Arc::new(Semaphore::new(parallel.max(1)));

    let shards: Vec<ShardState> = jobs
        .into_iter()
        .map(|job| {
            let spool = Arc::new(Spool::new(dir).expect("failed to create spool file"));
            let writer_spool = spool.clone();
            let gate = gate.clone();
            let cancel = cancel.clone();
            let writer = tokio::spawn(async move {
                let _permit = gate.acquire_owned().await.expect("semaphore never closed");
                writer_spool.start(job.records, &cancel).await
            });
            ShardState {
                spool,
                reader: None,
                writer: Some(writer),
                primary_key_field: job.primary_key_field,
                cursor_field: job.cursor_field,
                next_shard_from: job.next_shard_from,
            }
        })
        .collect();

    let state = ConsumeState {
        shards,
        index: 0,
        last_ids: HashSet::new(),
        current_ids: HashSet::new(),
        dedup,
        cancel,
        failed: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if state.failed || state.index >= state.shards.len() {
                return None;
            }

            let is_last_shard = state.index + 1 == state.shards.len();
            let pk_field = state.shards[state.index].primary_key_field.clone();
            let cursor_field = state.shards[state.index].cursor_field.clone();
            let next_shard_from = state.shards[state.index].next_shard_from;

            // The reader is created once per shard and persisted across
            // unfold polls (each poll pulls exactly one record); recreating
            // it here would both re-open the file from offset 0 and panic
            // against `Spool::process`'s at-most-once guard.
            if state.shards[state.index].reader.is_none() {
                let spool = state.shards[state.index].spool.clone();
                state.shards[state.index].reader = Some(Box::pin(spool.process()));
            }
            let item = state.shards[state.index].reader.as_mut().unwrap().next().await;

            if let Some(item) = item {
                let record = match item {
                    Ok(v) => v,
                    Err(e) => {
                        state.failed = true;
                        state.cancel.cancel();
                        return Some((Err(e), state));
                    }
                };

                if state.dedup.enabled {
                    if let Some(pk_field) = &pk_field {
                        if let Some(pk) = record.get(pk_field).and_then(value_as_dedup_key) {
                            if state.last_ids.contains(&pk) {
                                continue;
                            }
                            if !is_last_shard
                                && is_within_retention_window(&record, cursor_field.as_deref(), next_shard_from)
                            {
                                state.current_ids.insert(pk);
                            }
                        }
                    }
                }

                return Some((Ok(record), state));
            }

            state.shards[state.index].reader = None;

            // Spool exhausted: reap the writer task, cleanup, and advance.
            let writer = state.shards[state.index]
                .writer
                .take()
                .expect("writer reaped twice");
            let write_result = writer.await;
            let _ = state.shards[state.index].spool.cleanup().await;

            match write_result {
                Ok(Ok(())) => {}
                Ok(Err(e)) if !matches!(e, SourceError::Cancelled) => {
                    warn!(shard = state.index, error = %e, "shard producer failed");
                    state.failed = true;
                    state.cancel.cancel();
                    return Some((Err(e), state));
                }
                Ok(Err(_)) => {
                    state.failed = true;
                    return None;
                }
                Err(join_err) => {
                    state.failed = true;
                    return Some((
                        Err(SourceError::Internal(format!("shard writer task panicked: {join_err}"))),
                        state,
                    ));
                }
            }

            if !is_last_shard {
                state.last_ids = std::mem::take(&mut state.current_ids);
            }
            debug!(shard = state.index, "shard drained");
            state.index += 1;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn job(
        ids: Vec<i64>,
        cursor: DateTime<Utc>,
        next_shard_from: Option<DateTime<Utc>>,
    ) -> ShardJob<impl Stream<Item = Result<Value, SourceError>> + Unpin> {
        let cursor = cursor.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        ShardJob {
            records: stream::iter(ids.into_iter().map(move |id| Ok(json!({"id": id, "cursor": cursor.clone()})))),
            primary_key_field: Some("id".to_string()),
            cursor_field: Some("cursor".to_string()),
            next_shard_from,
        }
    }

    #[tokio::test]
    async fn yields_records_in_shard_order() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = vec![job(vec![1, 2], Utc::now(), None), job(vec![3, 4], Utc::now(), None)];
        let cancel = CancellationToken::new();
        let out: Vec<_> = run(dir.path(), jobs, DedupPolicy::DISABLED, 2, cancel)
            .collect::<Vec<_>>()
            .await;
        let ids: Vec<i64> = out.into_iter().map(|r| r.unwrap()["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn a_shard_with_more_records_than_fit_in_one_read_chunk_does_not_panic() {
        // Regression test: the consumer used to call `spool.process()` fresh
        // on every single record pull, which both panicked against
        // `Spool::process`'s at-most-once guard on the second record and,
        // even without the assert, would have re-read the file from offset
        // zero forever. Any shard with more than one record exercises it.
        let dir = tempfile::tempdir().unwrap();
        let ids: Vec<i64> = (0..500).collect();
        let jobs = vec![job(ids.clone(), Utc::now(), None)];
        let cancel = CancellationToken::new();
        let out: Vec<_> = run(dir.path(), jobs, DedupPolicy::DISABLED, 1, cancel)
            .collect::<Vec<_>>()
            .await;
        let got: Vec<i64> = out.into_iter().map(|r| r.unwrap()["id"].as_i64().unwrap()).collect();
        assert_eq!(got, ids);
    }

    #[tokio::test]
    async fn dedup_drops_repeated_primary_key_from_previous_shard() {
        let dir = tempfile::tempdir().unwrap();
        // Historical, backfill-style cursors far from wall-clock "now" —
        // this is the normal case for a real sync and is exactly what a
        // `Utc::now()`-anchored retention window would always miss. The
        // first shard's records carry a cursor just inside the 2-minute
        // window before the *next* shard's `from`, so they should be
        // retained for dedup regardless of when the test happens to run.
        let shard2_from: DateTime<Utc> = "2020-06-01T00:05:00Z".parse().unwrap();
        let shard1_cursor: DateTime<Utc> = "2020-06-01T00:04:30Z".parse().unwrap();
        let jobs = vec![
            job(vec![1, 2], shard1_cursor, Some(shard2_from)),
            job(vec![2, 3], shard2_from, None),
        ];
        let cancel = CancellationToken::new();
        let out: Vec<_> = run(dir.path(), jobs, DedupPolicy::resolved(true, true), 2, cancel)
            .collect::<Vec<_>>()
            .await;
        let ids: Vec<i64> = out.into_iter().map(|r| r.unwrap()["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn records_older_than_the_retention_window_are_not_retained_for_dedup() {
        let dir = tempfile::tempdir().unwrap();
        // This shard's records are well outside the 2-minute window before
        // the next shard's `from`, so they should NOT be retained — the
        // repeated id in the next shard must come through, not get dropped.
        let shard2_from: DateTime<Utc> = "2020-06-01T00:05:00Z".parse().unwrap();
        let shard1_cursor: DateTime<Utc> = "2020-06-01T00:00:00Z".parse().unwrap();
        let jobs = vec![
            job(vec![1, 2], shard1_cursor, Some(shard2_from)),
            job(vec![2, 3], shard2_from, None),
        ];
        let cancel = CancellationToken::new();
        let out: Vec<_> = run(dir.path(), jobs, DedupPolicy::resolved(true, true), 2, cancel)
            .collect::<Vec<_>>()
            .await;
        let ids: Vec<i64> = out.into_iter().map(|r| r.unwrap()["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn no_primary_key_disables_dedup_even_when_requested() {
        let policy = DedupPolicy::resolved(true, false);
        assert!(!policy.enabled);
    }

    #[tokio::test]
    async fn producer_failure_aborts_and_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let failing = ShardJob {
            records: stream::iter(vec![Ok(json!({"id": 1})), Err(SourceError::Transient("boom".into()))]),
            primary_key_field: None,
            cursor_field: None,
            next_shard_from: None,
        };
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let out: Vec<_> = run(dir.path(), vec![failing], DedupPolicy::DISABLED, 1, cancel)
            .collect::<Vec<_>>()
            .await;
        assert!(out.iter().any(|r| r.is_err()));
        assert!(cancel2.is_cancelled());
    }
}
