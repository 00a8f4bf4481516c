//! Token authenticator — non-session credentials for API and CLI clients.
//!
//! Supports:
//! - `Authorization: Bearer <token>` and `Authorization: token <token>`
//! - `Authorization: Basic` where the password is the token (git, docker)
//! - Static tokens from configuration
//! - An external validation endpoint
//!
//! Every failure path yields "no principal"; the dispatcher then applies the
//! whitelist and login rules as for any anonymous request.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::TokenAuthConfig;
use crate::{Error, Result};

/// Resolves a principal from an `Authorization` header value.
#[async_trait]
pub trait TokenAuthenticator: Send + Sync + 'static {
    /// `None` on any parse or validation failure.
    async fn authenticate(&self, authorization: &str) -> Option<String>;
}

/// Static token with resolved value
#[derive(Debug, Clone)]
struct ResolvedToken {
    key: String,
    user: String,
}

/// Response of the external validation endpoint
#[derive(Debug, Deserialize)]
struct ValidationResponse {
    #[serde(alias = "email", alias = "login")]
    user: String,
}

/// Config-driven authenticator: static table first, then the validation URL.
pub struct HttpTokenAuthenticator {
    tokens: Vec<ResolvedToken>,
    validate_url: Option<String>,
    http: reqwest::Client,
}

impl HttpTokenAuthenticator {
    /// Create from configuration. Fails if the HTTP client cannot be built.
    pub fn new(config: &TokenAuthConfig) -> Result<Self> {
        let tokens = config
            .tokens
            .iter()
            .map(|t| ResolvedToken {
                key: t.resolve_key(),
                user: t.user.clone(),
            })
            .filter(|t| !t.key.is_empty())
            .collect();

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("token validation client: {e}")))?;

        Ok(Self {
            tokens,
            validate_url: config.validate_url.clone(),
            http,
        })
    }

    fn lookup_static(&self, token: &str) -> Option<String> {
        // Scan the whole table so timing does not reveal the matching slot
        let mut found = None;
        for entry in &self.tokens {
            if bool::from(entry.key.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(entry.user.clone());
            }
        }
        found
    }

    async fn validate_remote(&self, url: &str, token: &str) -> Option<String> {
        let response = match self.http.get(url).bearer_auth(token).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Token validation request failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(status = %response.status(), "Token rejected by validator");
            return None;
        }

        match response.json::<ValidationResponse>().await {
            Ok(v) if !v.user.is_empty() => Some(v.user),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Token validator returned an unreadable body");
                None
            }
        }
    }
}

#[async_trait]
impl TokenAuthenticator for HttpTokenAuthenticator {
    async fn authenticate(&self, authorization: &str) -> Option<String> {
        let token = extract_token(authorization)?;

        if let Some(user) = self.lookup_static(&token) {
            debug!(user = %user, "Authenticated with static token");
            return Some(user);
        }

        let url = self.validate_url.as_deref()?;
        let user = self.validate_remote(url, &token).await?;
        debug!(user = %user, "Authenticated with validated token");
        Some(user)
    }
}

/// Pull the token out of the supported `Authorization` schemes.
pub(crate) fn extract_token(authorization: &str) -> Option<String> {
    let (scheme, rest) = authorization.trim().split_once(' ')?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }

    if scheme.eq_ignore_ascii_case("bearer") || scheme.eq_ignore_ascii_case("token") {
        return Some(rest.to_string());
    }

    if scheme.eq_ignore_ascii_case("basic") {
        let (_, password) = decode_basic(rest)?;
        if password.is_empty() {
            return None;
        }
        return Some(password);
    }

    None
}

/// Decode a Basic credential payload into `(username, password)`.
pub(crate) fn decode_basic(encoded: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}
