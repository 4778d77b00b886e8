//! Events: highest volume, hourly-sharded, dedup on, 20-way parallel,
//! checkpoints every 100,000 records (§4.7).

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

const ENDPOINT_KEY: &str = "GET:/events/";
const PATH: &str = "/events/";
const CURSOR_FIELD: &str = "datetime";

pub struct EventsStream {
    client: KlaviyoClient,
}

impl EventsStream {
    pub fn new(client: KlaviyoClient, _initialize: bool) -> Self {
        // Events' cursor field is fixed to `datetime` per the concrete
        // stream policy table (§4.7); `initialize` only governs the seed
        // path below, not which field is tracked.
        EventsStream { client }
    }
}

#[async_trait]
impl Stream for EventsStream {
    fn name(&self) -> &str {
        "events"
    }

    fn primary_key(&self) -> Option<&str> {
        Some("id")
    }

    fn cursor_field(&self) -> Option<&str> {
        Some(CURSOR_FIELD)
    }

    fn json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "datetime": {"type": "string", "format": "date-time"},
            },
            "required": ["id", "datetime"],
        })
    }

    fn checkpoint_interval(&self) -> u64 {
        100_000
    }

    fn shard_parallelism(&self) -> usize {
        20
    }

    fn dedup_across_shards(&self) -> bool {
        true
    }

    async fn stream_slices(&self, sync_mode: SyncMode, state: &StateManager) -> Result<Vec<Slice>, SourceError> {
        let cancel = CancellationToken::new();
        let from = match state.cutoff_ms("events").and_then(DateTime::from_timestamp_millis) {
            Some(dt) => dt,
            None if sync_mode == SyncMode::Incremental => {
                streams::peek_earliest_cursor(&self.client, ENDPOINT_KEY, PATH, CURSOR_FIELD, &cancel)
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
                Err(SourceError::Internal("events requires a time-range slice".into()))
            }));
        };
        let filter = streams::shard_range_filter(CURSOR_FIELD, &shard);
        let pages = self.client.paginate_records(ENDPOINT_KEY, PATH, Some(filter), cancel);
        Box::pin(pages.flat_map(|page| match page {
            Ok(items) => stream::iter(items.iter().map(|r| Ok(streams::normalize(r))).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    #[test]
    fn cursor_field_is_fixed_to_datetime() {
        let client = KlaviyoClient::with_base_url(
            &Credentials::ApiKey { api_key: "k".into() },
            "http://127.0.0.1:0",
        )
        .unwrap();
        let stream = EventsStream::new(client, true);
        assert_eq!(stream.cursor_field(), Some("datetime"));
        assert_eq!(stream.checkpoint_interval(), 100_000);
        assert_eq!(stream.shard_parallelism(), 20);
    }
}
