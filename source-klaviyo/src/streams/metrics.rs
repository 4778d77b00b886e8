//! Metrics: a small reference catalog with no reliable cursor field;
//! every run performs a full dump (§4.7).

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use source_base::error::SourceError;
use source_base::state::StateManager;
use source_base::stream::{Slice, Stream, SyncMode};
use tokio_util::sync::CancellationToken;

use crate::client::KlaviyoClient;
use crate::streams;

const ENDPOINT_KEY: &str = "GET:/metrics/";
const PATH: &str = "/metrics/";

pub struct MetricsStream {
    client: KlaviyoClient,
}

impl MetricsStream {
    pub fn new(client: KlaviyoClient) -> Self {
        MetricsStream { client }
    }
}

#[async_trait]
impl Stream for MetricsStream {
    fn name(&self) -> &str {
        "metrics"
    }

    fn primary_key(&self) -> Option<&str> {
        Some("id")
    }

    fn cursor_field(&self) -> Option<&str> {
        None
    }

    fn json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "name": {"type": "string"},
                "integration": {"type": "object"},
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
        _state: StateManager,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<Value, SourceError>> {
        let pages = self.client.paginate_records(ENDPOINT_KEY, PATH, None, cancel);
        Box::pin(pages.flat_map(|page| match page {
            Ok(items) => stream::iter(items.iter().map(|r| Ok(streams::normalize(r))).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        }))
    }
}
