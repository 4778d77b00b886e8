//! Profiles: hourly-sharded like Events, dedup on, 10-way parallel. Cursor
//! field is `created` during an initial backfill and `updated` otherwise,
//! the dual policy §9/§12 preserve as configurable rather than hardcoded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use source_base::error::SourceError;
use source_base::state::StateManager;
use source_base::stream::{Slice, Stream, SyncMode};
use tokio_util::sync::CancellationToken;

use crate::client::KlaviyoClient;
use crate::streams;

const ENDPOINT_KEY: &str = "GET:/profiles/";
const PATH: &str = "/profiles/";

pub struct ProfilesStream {
    client: KlaviyoClient,
    cursor_field: &'static str,
}

impl ProfilesStream {
    pub fn new(client: KlaviyoClient, initialize: bool) -> Self {
        let cursor_field = if initialize { "created" } else { "updated" };
        ProfilesStream { client, cursor_field }
    }
}

#[async_trait]
impl Stream for ProfilesStream {
    fn name(&self) -> &str {
        "profiles"
    }

    fn primary_key(&self) -> Option<&str> {
        Some("id")
    }

    fn cursor_field(&self) -> Option<&str> {
        Some(self.cursor_field)
    }

    fn json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "created": {"type": "string", "format": "date-time"},
                "updated": {"type": "string", "format": "date-time"},
            },
            "required": ["id"],
        })
    }

    fn shard_parallelism(&self) -> usize {
        10
    }

    fn dedup_across_shards(&self) -> bool {
        true
    }

    async fn stream_slices(&self, sync_mode: SyncMode, state: &StateManager) -> Result<Vec<Slice>, SourceError> {
        let cancel = CancellationToken::new();
        let from = match state.cutoff_ms("profiles").and_then(DateTime::from_timestamp_millis) {
            Some(dt) => dt,
            None if sync_mode == SyncMode::Incremental => {
                streams::peek_earliest_cursor(&self.client, ENDPOINT_KEY, PATH, self.cursor_field, &cancel)
                    .await?
                    .unwrap_or_else(streams::epoch_seed)
            }
            None => streams::epoch_seed(),
        };
        let to = Utc::now();
        Ok(streams::hourly_shards(from, to).into_iter().map(Slice::TimeRange).collect())
    }

    fn read_records(
        &self,
        _sync_mode: SyncMode,
        slice: Slice,
        _state: StateManager,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<Value, SourceError>> {
        let Slice::TimeRange(shard) = slice else {
            return Box::pin(stream::once(async {
                Err(SourceError::Internal("profiles requires a time-range slice".into()))
            }));
        };
        let filter = streams::shard_range_filter(self.cursor_field, &shard);
        let pages = self.client.paginate_records(ENDPOINT_KEY, PATH, Some(filter), cancel);
        Box::pin(pages.flat_map(|page| match page {
            Ok(items) => stream::iter(items.iter().map(|r| Ok(streams::normalize(r))).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        }))
    }
}
