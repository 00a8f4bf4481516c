//! OpenID Connect identity provider used by the browser login flow.
//!
//! # Flow
//!
//! 1. [`IdentityProvider::authorization_url`] builds the provider redirect
//!    carrying the CSRF `state` and `access_type=offline`.
//! 2. [`IdentityProvider::exchange_code`] posts the one-time code to the
//!    token endpoint and receives an ID token.
//! 3. The ID token header names a `kid`; the matching key comes from the
//!    provider's JWKS (cached for 1 hour, refreshed once on unknown `kid`).
//! 4. Signature, `exp`, `iss` and `aud` are verified, then the email domain
//!    is checked against the allow-list.
//!
//! # Security properties
//!
//! - Clock leeway of 60 seconds tolerates minor clock skew between the IdP and
//!   the gateway host.
//! - Unverified emails (`email_verified: false`) are rejected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::{Config, OidcConfig};
use crate::{Error, Result};

/// Error variants for OIDC failures.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// JWT decode / signature verification failed.
    #[error("ID token verification failed: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),

    /// The token endpoint refused the code.
    #[error("Code exchange rejected ({status}): {detail}")]
    ExchangeRejected {
        /// HTTP status returned by the token endpoint.
        status: u16,
        /// Response body (truncated).
        detail: String,
    },

    /// The token endpoint answered without an `id_token`.
    #[error("Token endpoint response carried no id_token")]
    MissingIdToken,

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the provider's JWKS.
    #[error("Unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The ID token carries no email, or the provider flagged it unverified.
    #[error("ID token has no verified email")]
    EmailNotVerified,

    /// The token's `email` domain is not in the configured allow-list.
    #[error("Email domain not allowed: {0}")]
    DomainNotAllowed(String),

    /// Network or HTTP error while talking to the provider.
    #[error("Identity provider request failed: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// The federated identity provider seen by the login flow.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// URL the browser is sent to, carrying `state`.
    fn authorization_url(&self, state: &str) -> String;

    /// Exchange an authorization code for a verified principal (email).
    async fn exchange_code(&self, code: &str) -> std::result::Result<String, OidcError>;
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/// Claims we read from an ID token.
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    /// Subject
    sub: String,
    /// Email
    #[serde(default)]
    email: Option<String>,
    /// Email verification flag (absent = trusted)
    #[serde(default)]
    email_verified: Option<bool>,
}

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// JWKS cache — one entry per JWKS URI.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    /// How long to cache a fetched JWKS (default 1 hour).
    ttl: Duration,
}

impl JwksCache {
    /// Create with default 1-hour TTL.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("JWKS client: {e}")))?;

        Ok(Self {
            inner: DashMap::new(),
            http,
            ttl: Duration::from_secs(3600),
        })
    }

    /// Return the cached JWKS for `jwks_uri`, fetching it if stale.
    ///
    /// If `force_refresh` is `true`, the cache is bypassed regardless of TTL.
    pub async fn get_or_fetch(
        &self,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> std::result::Result<JwkSet, OidcError> {
        if !force_refresh {
            if let Some(cached) = self.inner.get(jwks_uri) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!("Fetching JWKS from {jwks_uri}");
        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
                ttl: self.ttl,
            },
        );

        Ok(jwks)
    }
}

/// OpenID Connect provider: authorization redirect, code exchange, ID token
/// verification.
pub struct OidcProvider {
    config: OidcConfig,
    auth_url: Url,
    redirect_url: String,
    jwks_uri: String,
    http: reqwest::Client,
    jwks_cache: Arc<JwksCache>,
}

impl OidcProvider {
    /// Create from the gateway configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the authorization URL does not parse.
    pub fn new(config: &Config) -> Result<Self> {
        let oidc = config.oidc.clone();
        let auth_url = Url::parse(&oidc.auth_url)
            .map_err(|e| Error::Config(format!("oidc.auth_url: {e}")))?;

        if !oidc.issuer.starts_with("https://") {
            warn!(issuer = %oidc.issuer, "OIDC issuer is not HTTPS");
        }

        let jwks_uri = oidc
            .jwks_uri
            .clone()
            .unwrap_or_else(|| default_jwks_uri(&oidc.issuer));

        let http = reqwest::Client::builder()
            .timeout(oidc.timeout)
            .build()
            .map_err(|e| Error::Config(format!("OIDC client: {e}")))?;

        Ok(Self {
            auth_url,
            redirect_url: config.oidc_redirect_url(),
            jwks_uri,
            http,
            jwks_cache: Arc::new(JwksCache::new(oidc.timeout)?),
            config: oidc,
        })
    }

    /// Verify an ID token and return the principal it names.
    async fn verify(&self, id_token: &str) -> std::result::Result<String, OidcError> {
        let header = jsonwebtoken::decode_header(id_token)?;
        let kid = header.kid.clone().ok_or(OidcError::MissingKeyId)?;
        let decoding_key = self.find_decoding_key(&kid).await?;

        let mut validation = build_validation(&header);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.client_id.as_str()]);

        let token_data: TokenData<IdTokenClaims> =
            jsonwebtoken::decode(id_token, &decoding_key, &validation)?;
        let claims = token_data.claims;

        if claims.email_verified == Some(false) {
            return Err(OidcError::EmailNotVerified);
        }
        let email = claims.email.ok_or(OidcError::EmailNotVerified)?;

        if !self.config.allowed_domains.is_empty() {
            let domain = email.split('@').next_back().unwrap_or("");
            if !self
                .config
                .allowed_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
            {
                return Err(OidcError::DomainNotAllowed(domain.to_string()));
            }
        }

        debug!(subject = %claims.sub, email = %email, "ID token verified");
        Ok(email)
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache if not found.
    async fn find_decoding_key(&self, kid: &str) -> std::result::Result<DecodingKey, OidcError> {
        let jwks = self.jwks_cache.get_or_fetch(&self.jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        // Unknown kid: refresh once and retry
        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks_cache.get_or_fetch(&self.jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| OidcError::UnknownKeyId(kid.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    fn authorization_url(&self, state: &str) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("access_type", "offline");
        url.into()
    }

    async fn exchange_code(&self, code: &str) -> std::result::Result<String, OidcError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_url.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut detail = response.text().await.unwrap_or_default();
            detail.truncate(256);
            return Err(OidcError::ExchangeRejected {
                status: status.as_u16(),
                detail,
            });
        }

        let tokens: TokenResponse = response.json().await?;
        let id_token = tokens.id_token.ok_or(OidcError::MissingIdToken)?;
        self.verify(&id_token).await
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => {
                DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok()
            }
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60; // 60-second clock skew tolerance
    v
}

/// Derive the default JWKS URI from the issuer URL.
fn default_jwks_uri(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}
