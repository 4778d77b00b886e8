//! Campaigns: single linear pass, cursor fixed to `updated_at`; each
//! record fans out two bounded sub-requests (messages, tags) joined before
//! emission (§4.7, §12).

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use source_base::error::SourceError;
use source_base::state::StateManager;
use source_base::stream::{Slice, Stream, SyncMode};
use tokio_util::sync::CancellationToken;

use crate::client::KlaviyoClient;
use crate::streams;

const ENDPOINT_KEY: &str = "GET:/campaigns/";
const PATH: &str = "/campaigns/";
const CURSOR_FIELD: &str = "updated_at";

pub struct CampaignsStream {
    client: KlaviyoClient,
    #[allow(dead_code)]
    initialize: bool,
}

impl CampaignsStream {
    pub fn new(client: KlaviyoClient, initialize: bool) -> Self {
        CampaignsStream { client, initialize }
    }
}

#[async_trait]
impl Stream for CampaignsStream {
    fn name(&self) -> &str {
        "campaigns"
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
                "updated_at": {"type": "string", "format": "date-time"},
                "campaign_messages": {"type": "array"},
                "tags": {"type": "array"},
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
        let from = state
            .cutoff_ms("campaigns")
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(|| streams::epoch_seed() - chrono::Duration::hours(1));
        let filter = streams::gte_filter(CURSOR_FIELD, from);

        let client = self.client.clone();
        let pages = self.client.paginate_records(ENDPOINT_KEY, PATH, Some(filter), cancel.clone());
        let flattened = pages.flat_map(|page| match page {
            Ok(items) => stream::iter(items.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        });

        Box::pin(flattened.then(move |item| {
            let client = client.clone();
            let cancel = cancel.clone();
            async move {
                let resource = item?;
                let id = resource.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let mut record = streams::normalize(&resource);

                let messages =
                    streams::fetch_related(&client, "GET:/campaign-messages/", "/campaign-messages/", "campaign_id", &id, &cancel)
                        .await?;
                let tags = streams::fetch_related(&client, "GET:/tags/", "/tags/", "campaign_id", &id, &cancel).await?;

                if let Value::Object(map) = &mut record {
                    map.insert("campaign_messages".to_string(), Value::Array(messages));
                    map.insert("tags".to_string(), Value::Array(tags));
                }
                Ok(record)
            }
        }))
    }
}
