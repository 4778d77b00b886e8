//! The Klaviyo HTTP client: composes authentication, the rate limiter, and
//! the retrying invoker around `reqwest`, and exposes a cursor-paginating
//! helper built on [`source_base::paginate`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::Stream as FutureStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use source_base::error::SourceError;
use source_base::paginate::{self, Page};
use source_base::ratelimit::RateLimiterRegistry;
use source_base::retry::{with_retry, RetryPolicy};

use crate::auth::Authenticator;
use crate::config::Credentials;
use crate::endpoints;

const API_BASE_URL: &str = "https://a.klaviyo.com/api";
const KLAVIYO_REVISION: &str = "2024-10-15";
const DEFAULT_PAGE_SIZE: &str = "100";

/// A cheaply-cloneable handle to the Klaviyo API. Every clone shares the
/// same underlying connection pool, rate limiter state, and auth cache.
#[derive(Clone)]
pub struct KlaviyoClient {
    http: reqwest::Client,
    base_url: Arc<str>,
    limiter: Arc<RateLimiterRegistry>,
    auth: Arc<Authenticator>,
}

impl KlaviyoClient {
    pub fn new(credentials: &Credentials) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SourceError::Config(format!("building http client: {e}")))?;
        let auth = Authenticator::new(http.clone(), credentials);
        let limiter = RateLimiterRegistry::new(endpoints::table());
        Ok(KlaviyoClient {
            http,
            base_url: Arc::from(API_BASE_URL),
            limiter: Arc::new(limiter),
            auth: Arc::new(auth),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(credentials: &Credentials, base_url: &str) -> Result<Self, SourceError> {
        let mut client = Self::new(credentials)?;
        client.base_url = Arc::from(base_url);
        Ok(client)
    }

    /// Perform a single rate-limited, retried GET and return the decoded
    /// JSON body.
    pub async fn get_json(
        &self,
        endpoint_key: &str,
        path: &str,
        query: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Value, SourceError> {
        let token = self.auth.bearer_token(cancel).await?;
        let url = format!("{}{}", self.base_url, path);

        self.limiter
            .schedule(endpoint_key, cancel, || {
                with_retry(RetryPolicy::DEFAULT, cancel, || async {
                    let resp = self
                        .http
                        .get(&url)
                        .query(query)
                        .bearer_auth(&token)
                        .header("Revision", KLAVIYO_REVISION)
                        .send()
                        .await
                        .map_err(|e| SourceError::Transient(format!("request failed: {e}")))?;
                    classify_response(resp).await
                })
            })
            .await
    }

    /// Turn `path` into a lazy stream of page arrays, threading the
    /// cursor-based pagination Klaviyo's `links.next` URLs carry.
    /// `filter` is the already-formatted, comma-joined filter expression
    /// (§6), if any.
    pub fn paginate_records(
        &self,
        endpoint_key: &'static str,
        path: &'static str,
        filter: Option<String>,
        cancel: CancellationToken,
    ) -> impl FutureStream<Item = Result<Vec<Value>, SourceError>> {
        let client = self.clone();
        paginate::paginate(move |cursor: Option<String>| {
            let client = client.clone();
            let filter = filter.clone();
            let cancel = cancel.clone();
            async move {
                let mut query = vec![("page[size]".to_string(), DEFAULT_PAGE_SIZE.to_string())];
                if let Some(c) = cursor {
                    query.push(("page[cursor]".to_string(), c));
                }
                if let Some(f) = &filter {
                    query.push(("filter".to_string(), f.clone()));
                }
                let body = client.get_json(endpoint_key, path, &query, &cancel).await?;
                let data = body
                    .get("data")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let next_cursor = body
                    .pointer("/links/next")
                    .and_then(Value::as_str)
                    .and_then(extract_cursor);
                Ok(Page { data, next_cursor })
            }
        })
    }
}

fn extract_cursor(next_url: &str) -> Option<String> {
    reqwest::Url::parse(next_url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == "page[cursor]")
        .map(|(_, v)| v.into_owned())
}

async fn classify_response(resp: reqwest::Response) -> Result<Value, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("decoding response body: {e}")));
    }

    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SourceError::RateLimited { retry_after });
    }

    if status.is_server_error() {
        return Err(SourceError::Transient(format!("server error: {status}")));
    }

    let body = resp.text().await.unwrap_or_default();
    Err(SourceError::ClientFault {
        status: status.as_u16(),
        message: body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_key_creds() -> Credentials {
        Credentials::ApiKey {
            api_key: "sk_test".to_string(),
        }
    }

    #[tokio::test]
    async fn get_json_decodes_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let client = KlaviyoClient::with_base_url(&api_key_creds(), &server.uri()).unwrap();
        let cancel = CancellationToken::new();
        let body = client
            .get_json("GET:/events/", "/events/", &[], &cancel)
            .await
            .unwrap();
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn client_fault_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events/"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "not found"})))
            .mount(&server)
            .await;

        let client = KlaviyoClient::with_base_url(&api_key_creds(), &server.uri()).unwrap();
        let cancel = CancellationToken::new();
        let result = client.get_json("GET:/events/", "/events/", &[], &cancel).await;
        assert!(matches!(result, Err(SourceError::ClientFault { status: 404, .. })));
    }

    #[test]
    fn extract_cursor_reads_the_page_cursor_query_param() {
        let url = "https://a.klaviyo.com/api/events/?page%5Bcursor%5D=abc123";
        assert_eq!(extract_cursor(url), Some("abc123".to_string()));
    }

    #[test]
    fn extract_cursor_is_none_without_the_param() {
        let url = "https://a.klaviyo.com/api/events/";
        assert_eq!(extract_cursor(url), None);
    }
}
