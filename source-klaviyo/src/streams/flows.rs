//! Flows: single linear pass, dual cursor policy like Profiles. Each flow
//! fans out to its actions and tags, then each action fans out to its
//! messages, then each message fans out to its template relationship,
//! composed into one joined record before emission (§4.7).

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

const ENDPOINT_KEY: &str = "GET:/flows/";
const PATH: &str = "/flows/";

pub struct FlowsStream {
    client: KlaviyoClient,
    cursor_field: &'static str,
}

impl FlowsStream {
    pub fn new(client: KlaviyoClient, initialize: bool) -> Self {
        let cursor_field = if initialize { "created" } else { "updated" };
        FlowsStream { client, cursor_field }
    }

    async fn join(client: KlaviyoClient, cancel: CancellationToken, resource: Value) -> Result<Value, SourceError> {
        let id = resource.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        let mut record = streams::normalize(&resource);

        let tags = streams::fetch_related(&client, "GET:/tags/", "/tags/", "flow_id", &id, &cancel).await?;
        let actions =
            streams::fetch_related(&client, "GET:/flow-actions/", "/flow-actions/", "flow_id", &id, &cancel).await?;

        let mut joined_actions = Vec::with_capacity(actions.len());
        for action in actions {
            let action_id = action.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let messages = streams::fetch_related(
                &client,
                "GET:/flow-messages/",
                "/flow-messages/",
                "flow_action_id",
                &action_id,
                &cancel,
            )
            .await?;

            let mut joined_messages = Vec::with_capacity(messages.len());
            for message in messages {
                let message_id = message.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
                let templates = streams::fetch_related(
                    &client,
                    "GET:/templates/",
                    "/templates/",
                    "flow_message_id",
                    &message_id,
                    &cancel,
                )
                .await?;
                let mut message = message;
                if let Value::Object(map) = &mut message {
                    map.insert("templates".to_string(), Value::Array(templates));
                }
                joined_messages.push(message);
            }

            let mut action = action;
            if let Value::Object(map) = &mut action {
                map.insert("flow_messages".to_string(), Value::Array(joined_messages));
            }
            joined_actions.push(action);
        }

        if let Value::Object(map) = &mut record {
            map.insert("tags".to_string(), Value::Array(tags));
            map.insert("flow_actions".to_string(), Value::Array(joined_actions));
        }
        Ok(record)
    }
}

#[async_trait]
impl Stream for FlowsStream {
    fn name(&self) -> &str {
        "flows"
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
                "tags": {"type": "array"},
                "flow_actions": {"type": "array"},
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
            .cutoff_ms("flows")
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(|| streams::epoch_seed() - chrono::Duration::hours(1));
        let filter = streams::gte_filter(self.cursor_field, from);

        let client = self.client.clone();
        let pages = self.client.paginate_records(ENDPOINT_KEY, PATH, Some(filter), cancel.clone());
        let flattened = pages.flat_map(|page| match page {
            Ok(items) => stream::iter(items.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        });

        Box::pin(flattened.then(move |item| {
            let client = client.clone();
            let cancel = cancel.clone();
            async move { Self::join(client, cancel, item?).await }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    #[test]
    fn cursor_field_follows_initialize_flag() {
        let creds = Credentials::ApiKey { api_key: "k".into() };
        let client = KlaviyoClient::with_base_url(&creds, "http://127.0.0.1:0").unwrap();
        assert_eq!(FlowsStream::new(client.clone(), true).cursor_field(), Some("created"));
        assert_eq!(FlowsStream::new(client, false).cursor_field(), Some("updated"));
    }
}
