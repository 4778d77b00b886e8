//! Templates: single linear pass, dual cursor policy like Profiles/Flows,
//! plus an *additional* always-on 1-hour watermark rewind applied on every
//! resume (not just the initial seed) to tolerate clock skew between the
//! API's `updated`/`created` timestamps and the connector's own clock
//! (§4.7's concrete policy table, distinct from the universal initial-seed
//! rewind Campaigns/Flows get only when no watermark exists yet).

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

const ENDPOINT_KEY: &str = "GET:/templates/";
const PATH: &str = "/templates/";
const RESUME_REWIND: chrono::Duration = chrono::Duration::hours(1);

pub struct TemplatesStream {
    client: KlaviyoClient,
    cursor_field: &'static str,
}

impl TemplatesStream {
    pub fn new(client: KlaviyoClient) -> Self {
        // Templates has no meaningful `initialize`-driven backfill distinction
        // in the upstream API; `updated` is always available and preferred.
        TemplatesStream { client, cursor_field: "updated" }
    }
}

#[async_trait]
impl Stream for TemplatesStream {
    fn name(&self) -> &str {
        "templates"
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

    fn dedup_across_shards(&self) -> bool {
        false
    }

    async fn stream_slices(&self, _sync_mode: SyncMode, _state: &StateManager) -> Result<Vec<Slice>, SourceError> {
        Ok(vec![Slice::Full])
    }

    fn read_records(
        &self,
        _sync_mode: SyncMode,
        _slice: Slice,
        state: StateManager,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<Value, SourceError>> {
        let watermark = state
            .cutoff_ms("templates")
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(streams::epoch_seed);
        let from: DateTime<Utc> = watermark - RESUME_REWIND;
        let filter = streams::gte_filter(self.cursor_field, from);

        let pages = self.client.paginate_records(ENDPOINT_KEY, PATH, Some(filter), cancel);
        Box::pin(pages.flat_map(|page| match page {
            Ok(items) => stream::iter(items.iter().map(|r| Ok(streams::normalize(r))).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        }))
    }
}
