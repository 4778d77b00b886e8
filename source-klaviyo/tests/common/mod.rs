//! Shared test helpers for integration tests: a fake Klaviyo server backed
//! by `wiremock`, and small builders for config/state documents.

use serde_json::{json, Value};
use source_base::state::StateManager;
use source_klaviyo::client::KlaviyoClient;
use source_klaviyo::config::Credentials;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A running fake Klaviyo API. Dropped (and torn down) at the end of the
/// test that owns it.
pub struct FakeKlaviyo {
    pub server: MockServer,
}

impl FakeKlaviyo {
    pub async fn new() -> Self {
        FakeKlaviyo { server: MockServer::start().await }
    }

    pub fn client(&self) -> KlaviyoClient {
        KlaviyoClient::with_base_url(&Credentials::ApiKey { api_key: "sk_test".into() }, &self.server.uri()).unwrap()
    }

    /// Mount a single unpaginated 200 response of `data` for `resource_path`
    /// (e.g. `/events/`).
    pub async fn mount_page(&self, resource_path: &str, data: Vec<Value>) {
        Mock::given(method("GET"))
            .and(path(resource_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": data})))
            .mount(&self.server)
            .await;
    }

    /// Mount an empty `data: []` response for `resource_path`, matching any
    /// query string (used for the related-resource fan-out calls streams
    /// like Campaigns/Flows make per record).
    pub async fn mount_empty(&self, resource_path: &str) {
        self.mount_page(resource_path, vec![]).await;
    }

    /// Mount a sequence of status codes for `resource_path`, served in
    /// order as `wiremock`'s up_to_n_times chains: first N-1 calls get
    /// `first_statuses`, and the final call returns 200 with `data`.
    pub async fn mount_flaky(&self, resource_path: &str, first_statuses: &[u16], data: Vec<Value>) {
        for status in first_statuses {
            Mock::given(method("GET"))
                .and(path(resource_path))
                .respond_with(ResponseTemplate::new(*status))
                .up_to_n_times(1)
                .mount(&self.server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path(resource_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": data})))
            .mount(&self.server)
            .await;
    }
}

/// A JSON:API-shaped event resource, the wire format `normalize()` expects
/// (top-level `id`, attributes nested under `attributes`).
pub fn event(id: &str, datetime: &str) -> Value {
    json!({"id": id, "attributes": {"datetime": datetime}})
}

/// State with a watermark 30 minutes old, close enough to "now" that a
/// shard-planned stream generates exactly one shard instead of walking the
/// whole history back to the epoch seed.
pub fn state_with_recent_cutoff(stream: &str) -> StateManager {
    let mut state = StateManager::empty();
    let cutoff = (chrono::Utc::now() - chrono::Duration::minutes(30)).timestamp_millis();
    state.set_cutoff(stream, cutoff);
    state
}
