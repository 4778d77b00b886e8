//! Sync Driver: topologically orders streams, drives each one, and emits
//! the RECORD/STATE/STATUS/LOG message sequence (§4.8).

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::dag::StreamDag;
use crate::error::SourceError;
use crate::message::{LogLevel, Message, RunStatus};
use crate::orchestrator::{self, DedupPolicy, ShardJob};
use crate::state::StateManager;
use crate::stream::{Slice, Stream, SyncMode};

/// Run-level knobs read from the connector's configuration (§6).
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    /// `-1` means unlimited.
    pub max_stream_failures: i64,
    /// `-1` means unlimited.
    pub max_slice_failures: i64,
    pub backfill: bool,
    pub initialize: bool,
}

pub struct SyncDriver {
    streams: HashMap<String, Arc<dyn Stream>>,
    config: DriverConfig,
}

impl SyncDriver {
    pub fn new(streams: Vec<Arc<dyn Stream>>, config: DriverConfig) -> Self {
        let streams = streams.into_iter().map(|s| (s.name().to_string(), s)).collect();
        Self { streams, config }
    }

    /// Drive every stream named in `requested`, in dependency order,
    /// handing each produced message to `emit` as soon as it is available
    /// rather than buffering the run in memory — `emit` is the only place
    /// that ever reaches stdout, so a caller wiring it straight to a
    /// line-buffered writer gets true streaming NDJSON (§6) and keeps
    /// whatever was already emitted if the process is killed mid-run.
    ///
    /// On success the returned `Result` is `Ok(())`; on a stream-failure
    /// budget exhaustion or a fatal error it carries the causing
    /// [`SourceError`], but a final STATE message reflecting the last
    /// successful watermarks is emitted before returning.
    pub async fn run(
        &self,
        requested: &[String],
        mut state: StateManager,
        cancel: CancellationToken,
        emit: &mut dyn FnMut(Message),
    ) -> Result<(), SourceError> {
        let mut pairs = Vec::with_capacity(requested.len());
        for name in requested {
            let Some(stream) = self.streams.get(name) else {
                return Err(SourceError::UnknownStream(name.clone()));
            };
            pairs.push((name.clone(), stream.dependencies().to_vec()));
        }

        let dag = StreamDag::build(&pairs)?;
        let order = dag.topological_order()?;

        let mut failed_streams: Vec<String> = Vec::new();

        for name in &order {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            let stream = self.streams.get(name).expect("validated above").clone();

            emit(Message::running());

            match self.run_stream(stream.as_ref(), &mut state, &cancel, emit).await {
                Ok(records_emitted) => {
                    if !self.config.backfill {
                        emit(Message::state(state.to_state_value()));
                    }
                    emit(Message::stream_status(name.clone(), RunStatus::Success, records_emitted));
                }
                Err(e) if e.is_fatal() => {
                    error!(stream = %name, error = %e, "fatal error, aborting run");
                    emit(Message::state(state.to_state_value()));
                    return Err(e);
                }
                Err(e) => {
                    let budget_ok = self.config.max_stream_failures < 0
                        || (failed_streams.len() as i64) < self.config.max_stream_failures;
                    emit(Message::errored(format!("stream {name} failed: {e}")));
                    emit(Message::stream_status(name.clone(), RunStatus::Errored, 0));
                    if budget_ok {
                        warn!(stream = %name, error = %e, "stream failed within budget, continuing");
                        failed_streams.push(name.clone());
                    } else {
                        error!(stream = %name, error = %e, "stream failure budget exceeded");
                        emit(Message::state(state.to_state_value()));
                        return Err(SourceError::BudgetExceeded {
                            kind: "stream",
                            name: name.clone(),
                        });
                    }
                }
            }
        }

        if !failed_streams.is_empty() {
            emit(Message::state(state.to_state_value()));
            return Err(SourceError::Internal(format!(
                "streams failed: [{}]",
                failed_streams.join(", ")
            )));
        }

        Ok(())
    }

    async fn run_stream(
        &self,
        stream: &dyn Stream,
        state: &mut StateManager,
        cancel: &CancellationToken,
        emit: &mut dyn FnMut(Message),
    ) -> Result<u64, SourceError> {
        stream.on_before_read().await?;

        let sync_mode = if stream.supports_incremental() && !self.config.backfill {
            SyncMode::Incremental
        } else {
            SyncMode::FullRefresh
        };

        // streamSlices/readRecords receive an owned snapshot rather than a
        // live handle, so the driver remains free to checkpoint (mutate
        // `state`) while the orchestrator drives several shards' record
        // streams concurrently (§4.6).
        let snapshot = state.clone();
        let slices = stream.stream_slices(sync_mode, &snapshot).await?;

        let spool_dir = tempfile::tempdir()?;
        let dedup = DedupPolicy::resolved(stream.dedup_across_shards(), stream.primary_key().is_some());
        let parallel = stream.shard_parallelism();

        // `nextShardFrom` anchors the dedup retention window (§4.6 step 3)
        // to the following shard's start rather than wall-clock time, so
        // each job needs a look at the slice generated right after it.
        let jobs: Vec<_> = (0..slices.len())
            .map(|i| {
                let next_shard_from = match slices.get(i + 1) {
                    Some(Slice::TimeRange(shard)) => Some(shard.from),
                    _ => None,
                };
                ShardJob {
                    records: stream.read_records(sync_mode, slices[i], state.clone(), cancel.clone()),
                    primary_key_field: stream.primary_key().map(str::to_string),
                    cursor_field: stream.cursor_field().map(str::to_string),
                    next_shard_from,
                }
            })
            .collect();

        let mut records = orchestrator::run(spool_dir.path(), jobs, dedup, parallel, cancel.clone());

        let mut records_emitted: u64 = 0;
        let mut since_checkpoint: u64 = 0;
        let mut slice_failures: i64 = 0;
        let mut cutoff = state.cutoff_ms(stream.name());

        loop {
            match records.next().await {
                None => break,
                Some(Ok(record)) => {
                    let emitted_at = chrono::Utc::now().timestamp_millis();
                    emit(Message::record(stream.name(), record.clone(), emitted_at));
                    records_emitted += 1;
                    since_checkpoint += 1;
                    cutoff = stream.get_updated_state(cutoff, &record);

                    if !self.config.backfill {
                        if let Some(c) = cutoff {
                            state.set_cutoff(stream.name(), c);
                        }
                        let interval = stream.checkpoint_interval();
                        if interval > 0 && since_checkpoint >= interval {
                            emit(Message::state(state.to_state_value()));
                            since_checkpoint = 0;
                        }
                    }
                }
                Some(Err(e)) if e.is_non_fatal() => {
                    warn!(stream = stream.name(), error = %e, "non-fatal error, continuing slice");
                    emit(Message::log(LogLevel::Warn, format!("{e}")));
                    if !self.config.backfill {
                        emit(Message::state(state.to_state_value()));
                    }
                }
                Some(Err(e)) if e.is_fatal() => {
                    return Err(e);
                }
                Some(Err(e)) => {
                    slice_failures += 1;
                    emit(Message::log(LogLevel::Error, format!("slice failed: {e}")));
                    let budget_ok =
                        self.config.max_slice_failures < 0 || slice_failures <= self.config.max_slice_failures;
                    if !budget_ok {
                        return Err(SourceError::BudgetExceeded {
                            kind: "slice",
                            name: stream.name().to_string(),
                        });
                    }
                    // The orchestrator aborts every remaining shard once one
                    // producer fails (§4.6), so there is nothing further to
                    // drain; the loop ends on the next `None`.
                }
            }
        }

        stream.on_after_read().await?;
        Ok(records_emitted)
    }
}
