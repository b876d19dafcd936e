//! Access tokens for Google APIs
//!
//! Two providers:
//!
//! - [`StaticToken`]: a token handed in from outside, e.g. the output of
//!   `gcloud auth print-access-token` exported as `GOOGLE_OAUTH_ACCESS_TOKEN`
//! - [`MetadataServerToken`]: the default service account of the VM the runner
//!   is on, fetched from the GCE metadata server and cached until shortly
//!   before it expires
//!
//! A token that expires mid-run surfaces as HTTP 401, which the client treats
//! as transient. An unreachable metadata server is an authentication error
//! only until the first token has been fetched; after that it is a transport
//! failure like any other.

use crate::http::{build_client, read_json, transport_error};
use async_trait::async_trait;
use pipeline_core::{CredentialProvider, PipelineError, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Environment variable holding a pre-issued access token
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// GCE metadata server token endpoint
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the cached token expires
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Fixed bearer token
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(PipelineError::Auth("access token is empty".to_string()));
        }
        Ok(Self(token.trim().to_string()))
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Service-account token from the GCE metadata server
pub struct MetadataServerToken {
    client: reqwest::Client,
    url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerToken {
    pub fn new() -> Result<Self> {
        Self::with_url(METADATA_TOKEN_URL)
    }

    /// Use a different token endpoint
    pub fn with_url(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(5))?,
            url: url.into(),
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self, refreshing: bool) -> Result<TokenResponse> {
        debug!("Fetching access token from {}", self.url);
        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() && !refreshing {
                    PipelineError::Auth(format!(
                        "metadata server unreachable (not on GCE? set {}): {}",
                        ACCESS_TOKEN_ENV, e
                    ))
                } else {
                    transport_error(e)
                }
            })?;
        read_json(response).await
    }
}

#[async_trait]
impl CredentialProvider for MetadataServerToken {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if Instant::now() < c.refresh_at {
                return Ok(c.token.clone());
            }
        }

        let fresh = self.fetch(cached.is_some()).await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(REFRESH_MARGIN);
        info!(expires_in = fresh.expires_in, "Obtained access token from metadata server");
        *cached = Some(CachedToken {
            token: fresh.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(fresh.access_token)
    }
}

/// Token from `GOOGLE_OAUTH_ACCESS_TOKEN` if set, otherwise the metadata server
pub fn from_env() -> Result<Arc<dyn CredentialProvider>> {
    match std::env::var(ACCESS_TOKEN_ENV) {
        Ok(token) if !token.trim().is_empty() => {
            debug!("Using access token from {}", ACCESS_TOKEN_ENV);
            Ok(Arc::new(StaticToken::new(token)?))
        }
        _ => {
            debug!("Using metadata server credentials");
            Ok(Arc::new(MetadataServerToken::new()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ExecutionClient;
    use crate::poller::Poller;
    use pipeline_core::{ExecutionBackend, JobRequest, PreemptionEvent, RemoteOperation};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_static_token() {
        let provider = StaticToken::new(" ya29.token \n").unwrap();
        let token = tokio_test::block_on(provider.access_token()).unwrap();
        assert_eq!(token, "ya29.token");
    }

    #[test]
    fn test_empty_static_token_rejected() {
        assert!(matches!(StaticToken::new("  "), Err(PipelineError::Auth(_))));
    }

    #[test]
    fn test_token_response_parsing() {
        let parsed: TokenResponse = serde_json::from_str(
            r#"{"access_token": "abc", "expires_in": 3599, "token_type": "Bearer"}"#,
        )
        .unwrap();
        assert_eq!(parsed.access_token, "abc");
        assert_eq!(parsed.expires_in, 3599);
    }

    #[tokio::test]
    async fn test_unreachable_metadata_server_is_an_auth_error() {
        let provider = MetadataServerToken::with_url(DEAD_URL).unwrap();
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_) | PipelineError::Transport(_)));
        assert!(provider.cached.lock().await.is_none());
    }

    const DEAD_URL: &str = "http://127.0.0.1:9/token";

    /// Provider whose token has been fetched once and is now due for refresh
    async fn expired_provider() -> MetadataServerToken {
        let provider = MetadataServerToken::with_url(DEAD_URL).unwrap();
        *provider.cached.lock().await = Some(CachedToken {
            token: "stale".to_string(),
            refresh_at: Instant::now(),
        });
        provider
    }

    #[tokio::test]
    async fn test_failed_refresh_is_transient() {
        let err = expired_provider().await.access_token().await.unwrap_err();
        assert!(matches!(err, PipelineError::Transport(_)), "{err:?}");
        assert!(err.is_transient());
    }

    /// Asks for a token on every status check, like the Genomics backend
    struct TokenGatedBackend {
        credentials: MetadataServerToken,
        checks: AtomicU32,
    }

    #[async_trait]
    impl ExecutionBackend for TokenGatedBackend {
        async fn submit(&self, _request: &JobRequest) -> Result<RemoteOperation> {
            Err(PipelineError::invalid_response("not used"))
        }

        async fn get_operation(&self, name: &str) -> Result<RemoteOperation> {
            if self.checks.fetch_add(1, Ordering::SeqCst) == 0 {
                self.credentials.access_token().await?;
            }
            Ok(RemoteOperation::new(name).with_done())
        }

        async fn list_preemption_events(
            &self,
            _instance: &str,
            _zone: &str,
        ) -> Result<Vec<PreemptionEvent>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_polling_survives_metadata_server_outage() {
        let backend = Arc::new(TokenGatedBackend {
            credentials: expired_provider().await,
            checks: AtomicU32::new(0),
        });
        let poller = Poller::new(ExecutionClient::new(backend.clone()))
            .with_interval(Duration::from_millis(10));

        let done = poller
            .wait_until_done(RemoteOperation::new("op"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(done.succeeded());
        assert_eq!(backend.checks.load(Ordering::SeqCst), 2);
    }
}
