//! Authentication: a static API key, or OAuth2 refresh serialized
//! process-wide (§4.2, §6).

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use source_base::error::SourceError;
use source_base::retry::{with_retry, RetryPolicy};

use crate::config::Credentials;

const TOKEN_ENDPOINT: &str = "https://a.klaviyo.com/oauth/token";

/// A safety margin subtracted from the server-reported expiry so a refresh
/// is triggered slightly before the token actually lapses.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Token {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

enum Inner {
    ApiKey(String),
    OAuth(OAuthState),
}

struct OAuthState {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    // A single mutex serializes every refresh attempt process-wide,
    // matching §4.2's "refresh calls are serialized (concurrency 1) to
    // avoid stampedes" — the lock IS the concurrency gate, not just a
    // cache guard.
    cached: Arc<Mutex<Option<Token>>>,
}

/// Produces a bearer token for outgoing requests, transparently refreshing
/// an OAuth access token when needed.
pub struct Authenticator {
    inner: Inner,
}

impl Authenticator {
    pub fn new(http: reqwest::Client, credentials: &Credentials) -> Self {
        let inner = match credentials {
            Credentials::ApiKey { api_key } => Inner::ApiKey(api_key.clone()),
            Credentials::Oauth {
                client_id,
                client_secret,
                refresh_token,
            } => Inner::OAuth(OAuthState {
                http,
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                refresh_token: refresh_token.clone(),
                cached: Arc::new(Mutex::new(None)),
            }),
        };
        Authenticator { inner }
    }

    /// The current bearer token value, refreshing first if necessary
    /// (OAuth mode) or returning the static key unchanged (API-key mode).
    pub async fn bearer_token(&self, cancel: &CancellationToken) -> Result<String, SourceError> {
        match &self.inner {
            Inner::ApiKey(key) => Ok(key.clone()),
            Inner::OAuth(state) => state.token(cancel).await,
        }
    }
}

impl OAuthState {
    async fn token(&self, cancel: &CancellationToken) -> Result<String, SourceError> {
        let mut guard = self.cached.lock().await;
        if let Some(tok) = guard.as_ref() {
            if tok.expires_at > Instant::now() {
                return Ok(tok.access_token.clone());
            }
        }

        let fresh = with_retry(RetryPolicy::OAUTH_REFRESH, cancel, || self.refresh_once()).await?;
        let access_token = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(access_token)
    }

    async fn refresh_once(&self) -> Result<Token, SourceError> {
        let resp = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &self.refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("oauth refresh request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            let body: TokenResponse = resp
                .json()
                .await
                .map_err(|e| SourceError::Auth(format!("oauth refresh response decode failed: {e}")))?;
            return Ok(Token {
                access_token: body.access_token,
                expires_at: Instant::now() + Duration::from_secs(body.expires_in).saturating_sub(EXPIRY_SAFETY_MARGIN),
            });
        }

        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        let error_code = body.get("error").and_then(|v| v.as_str()).unwrap_or("");
        if error_code == "rate_limit_exceeded" {
            Err(SourceError::Transient(format!("oauth refresh rate limited ({status})")))
        } else {
            Err(SourceError::Auth(format!("oauth refresh rejected ({status}): {body}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_key_mode_returns_the_static_key() {
        let http = reqwest::Client::new();
        let auth = Authenticator::new(http, &Credentials::ApiKey { api_key: "sk_test".into() });
        let cancel = CancellationToken::new();
        assert_eq!(auth.bearer_token(&cancel).await.unwrap(), "sk_test");
    }
}
