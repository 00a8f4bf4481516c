//! Credential exchange with the identity provider on `/v2/auth`.
//!
//! The caller's Basic credentials and query string are forwarded to the
//! provider's own token endpoint. The provider's answer only decides whether
//! the credentials are good; the token handed to the client is minted by the
//! gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::Error;

/// Why an exchange did not produce a token.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// Provider refused the credentials.
    #[error("credentials rejected by identity provider")]
    Rejected,

    /// Provider answered, but not with a usable token.
    #[error("malformed identity provider response: {0}")]
    Malformed(String),

    /// Provider unreachable or timed out.
    #[error("identity provider unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
}

/// Checks registry credentials against the identity provider.
#[async_trait]
pub trait CredentialExchange: Send + Sync + 'static {
    /// Forward `authorization` (and the original query) to the provider.
    /// Returns the provider's token on success.
    async fn exchange(&self, authorization: &str, query: Option<&str>) -> Result<String, ExchangeError>;
}

#[derive(Debug, Deserialize)]
struct ProviderTokenResponse {
    token: String,
}

/// Provider reached over HTTP at `<upstream>/v2/auth`.
pub struct UpstreamRegistryAuth {
    auth_url: String,
    http: reqwest::Client,
}

impl UpstreamRegistryAuth {
    /// Create for the provider rooted at `upstream`, with a bounded timeout.
    pub fn new(upstream: &str, timeout: Duration) -> crate::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("registry provider client: {e}")))?;

        Ok(Self {
            auth_url: format!("{}/v2/auth", upstream.trim_end_matches('/')),
            http,
        })
    }
}

#[async_trait]
impl CredentialExchange for UpstreamRegistryAuth {
    async fn exchange(&self, authorization: &str, query: Option<&str>) -> Result<String, ExchangeError> {
        let url = match query {
            Some(q) if !q.is_empty() => format!("{}?{q}", self.auth_url),
            _ => self.auth_url.clone(),
        };

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            debug!(status = %status, "Identity provider rejected registry credentials");
            return Err(ExchangeError::Rejected);
        }
        if !status.is_success() {
            warn!(status = %status, "Identity provider returned unexpected status");
            return Err(ExchangeError::Malformed(format!("status {status}")));
        }

        let body = response.bytes().await?;
        parse_token(&body)
    }
}

/// Parse `{"token": "..."}`; anything else is malformed.
fn parse_token(body: &[u8]) -> Result<String, ExchangeError> {
    let parsed: ProviderTokenResponse =
        serde_json::from_slice(body).map_err(|e| ExchangeError::Malformed(e.to_string()))?;
    if parsed.token.is_empty() {
        return Err(ExchangeError::Malformed("empty token".to_string()));
    }
    Ok(parsed.token)
}
