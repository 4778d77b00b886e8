//! Catalog discovery: the `discover` subcommand's output (§6).

use serde::Serialize;
use serde_json::Value;
use source_base::stream::Stream;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCatalogEntry {
    pub name: String,
    pub json_schema: Value,
    pub supported_sync_modes: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cursor_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_defined_primary_key: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub streams: Vec<StreamCatalogEntry>,
}

pub fn discover(streams: &[std::sync::Arc<dyn Stream>]) -> Catalog {
    let entries = streams
        .iter()
        .map(|s| {
            let mut modes = vec!["full_refresh"];
            if s.supports_incremental() {
                modes.push("incremental");
            }
            StreamCatalogEntry {
                name: s.name().to_string(),
                json_schema: s.json_schema(),
                supported_sync_modes: modes,
                default_cursor_field: s.cursor_field().map(str::to_string),
                source_defined_primary_key: s.primary_key().map(|k| vec![k.to_string()]),
            }
        })
        .collect();
    Catalog { streams: entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KlaviyoClient;
    use crate::config::Credentials;
    use crate::streams;

    #[test]
    fn discover_lists_every_requested_stream_with_its_sync_modes() {
        let creds = Credentials::ApiKey { api_key: "k".into() };
        let client = KlaviyoClient::with_base_url(&creds, "http://127.0.0.1:0").unwrap();
        let names: Vec<String> = streams::ALL_STREAM_NAMES.iter().map(|s| s.to_string()).collect();
        let config = crate::config::Config {
            credentials: creds,
            initialize: false,
            backfill: false,
            max_stream_failures: -1,
            max_slice_failures: -1,
            debug: false,
            compress_state: true,
        };
        let built = streams::build(client, &config, &names);
        let catalog = discover(&built);
        assert_eq!(catalog.streams.len(), streams::ALL_STREAM_NAMES.len());

        let metrics = catalog.streams.iter().find(|s| s.name == "metrics").unwrap();
        assert_eq!(metrics.supported_sync_modes, vec!["full_refresh"]);

        let events = catalog.streams.iter().find(|s| s.name == "events").unwrap();
        assert!(events.supported_sync_modes.contains(&"incremental"));
        assert_eq!(events.default_cursor_field.as_deref(), Some("datetime"));
    }
}
