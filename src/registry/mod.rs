//! Registry v2 token gateway
//!
//! Speaks the container registry token-authentication protocol on the
//! registry host:
//!
//! - `/v2/` without credentials gets the configured "unsupported" status so
//!   old clients fall back instead of prompting for a login
//! - any other `/v2/*` path without credentials gets a `Bearer` challenge
//!   pointing at `/v2/auth` on this host
//! - `/v2/auth` trades Basic credentials, checked by the identity provider,
//!   for a token signed by the gateway
//! - `/v2/*` with a Bearer token is verified locally and answered with the
//!   scope the path asks for
//!
//! Requests from interactive browsers, or outside `/v2`, are declined and
//! continue through the normal pipeline.

mod token;
mod upstream;

use std::sync::Arc;

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use token::{AccessEntry, RegistryClaims, TokenContext, TokenSigner};
pub use upstream::{CredentialExchange, ExchangeError, UpstreamRegistryAuth};

use crate::config::Config;
use crate::error::AuthError;
use crate::gateway::response::{self, NO_CACHE};
use crate::target::strip_port;
use crate::token_auth::decode_basic;

/// Version header every registry response carries
pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";
/// Value of [`API_VERSION_HEADER`]
pub const API_VERSION: &str = "registry/2.0";

/// User-Agent fragments of interactive browsers
const BROWSER_AGENTS: [&str; 4] = ["Mozilla/", "MSIE", "Trident/", "Opera"];

/// Path segments that end a repository name
const RESOURCE_KINDS: [&str; 3] = ["manifests", "blobs", "tags"];

#[derive(Serialize)]
struct IssuedToken {
    token: String,
}

#[derive(Serialize)]
struct VerifiedToken<'a> {
    token: &'a str,
    access: Vec<AccessEntry>,
}

/// Registry-host request handler
pub struct RegistryGateway {
    host: String,
    service: String,
    realm: String,
    unsupported_status: StatusCode,
    signer: Arc<TokenSigner>,
    exchange: Arc<dyn CredentialExchange>,
}

impl std::fmt::Debug for RegistryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryGateway")
            .field("host", &self.host)
            .field("service", &self.service)
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

impl RegistryGateway {
    /// Create from configuration with the given signer and credential check.
    #[must_use]
    pub fn new(config: &Config, signer: Arc<TokenSigner>, exchange: Arc<dyn CredentialExchange>) -> Self {
        let registry = &config.registry;
        Self {
            host: registry.host.to_ascii_lowercase(),
            service: registry.service.clone(),
            realm: format!("{}://{}/v2/auth", config.server.scheme, registry.host),
            unsupported_status: StatusCode::from_u16(registry.unsupported_status)
                .unwrap_or(StatusCode::IM_A_TEAPOT),
            signer,
            exchange,
        }
    }

    /// Whether `host` (port ignored) is the registry host.
    #[must_use]
    pub fn serves_host(&self, host: &str) -> bool {
        strip_port(host).eq_ignore_ascii_case(&self.host)
    }

    /// Handle a request. `None` means declined: not the registry host, a
    /// browser, or a path outside `/v2`.
    pub async fn handle(&self, host: &str, method: &Method, uri: &Uri, headers: &HeaderMap) -> Option<Response> {
        if !self.serves_host(host) {
            return None;
        }
        if is_browser(headers) {
            debug!("Browser on registry host, declining");
            return None;
        }

        let path = uri.path();
        if path != "/v2" && !path.starts_with("/v2/") {
            return None;
        }

        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let response = match (path, authorization) {
            ("/v2" | "/v2/", None) => {
                debug!("Unversioned registry probe");
                AuthError::ProtocolMismatch(self.unsupported_status).into_response()
            }
            ("/v2/auth", _) => self.issue(authorization, uri.query()).await,
            (_, None) => self.challenge(),
            (_, Some(authorization)) => self.verify(authorization, path, method),
        };

        Some(with_registry_headers(response))
    }

    /// `/v2/auth`: Basic credentials for a signed token
    async fn issue(&self, authorization: Option<&str>, query: Option<&str>) -> Response {
        let Some((authorization, username)) = authorization.and_then(|value| {
            let (scheme, encoded) = value.split_once(' ')?;
            if !scheme.eq_ignore_ascii_case("basic") {
                return None;
            }
            let (user, _) = decode_basic(encoded)?;
            Some((value, user))
        }) else {
            return self.challenge();
        };

        match self.exchange.exchange(authorization, query).await {
            Ok(_) => {}
            Err(ExchangeError::Rejected) => {
                info!(user = %username, "Registry credentials rejected");
                return self.challenge();
            }
            Err(e) => {
                warn!(user = %username, error = %e, "Registry credential exchange failed");
                return AuthError::Upstream(e.to_string()).into_response();
            }
        }

        match self.signer.issue(&username) {
            Ok(token) => {
                info!(user = %username, "Issued registry token");
                (StatusCode::OK, Json(IssuedToken { token })).into_response()
            }
            Err(e) => {
                warn!(error = %e, "Failed to sign registry token");
                response::empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Any other `/v2/*` path with credentials
    fn verify(&self, authorization: &str, path: &str, method: &Method) -> Response {
        let Some(token) = authorization
            .split_once(' ')
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
        else {
            return self.challenge();
        };

        match self.signer.verify(token) {
            Ok(claims) => {
                debug!(user = %claims.sub, path = %path, "Registry token verified");
                let body = VerifiedToken {
                    token,
                    access: scope_for(path, method),
                };
                (StatusCode::OK, Json(body)).into_response()
            }
            Err(e) => {
                debug!(error = %e, "Registry token rejected");
                self.challenge()
            }
        }
    }

    /// 401 with the `Bearer` challenge, empty body
    fn challenge(&self) -> Response {
        let mut response = AuthError::Authentication(String::new()).into_response();
        let value = format!(r#"Bearer realm="{}",service="{}""#, self.realm, self.service);
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// Interactive browsers are sent through the login flow instead.
fn is_browser(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|agent| BROWSER_AGENTS.iter().any(|b| agent.contains(b)))
}

fn with_registry_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
    response
}

/// Scope requested by a `/v2/*` path.
///
/// `/v2/_catalog` is `registry:catalog:*`; otherwise the repository name is
/// everything before `manifests`, `blobs` or `tags`. Reads need `pull`,
/// everything else `pull,push`.
pub fn scope_for(path: &str, method: &Method) -> Vec<AccessEntry> {
    let rest = path.trim_start_matches("/v2").trim_matches('/');
    if rest.is_empty() {
        return Vec::new();
    }

    if rest == "_catalog" {
        return vec![AccessEntry {
            kind: "registry".to_string(),
            name: "catalog".to_string(),
            actions: vec!["*".to_string()],
        }];
    }

    let segments: Vec<&str> = rest.split('/').collect();
    let end = segments
        .iter()
        .position(|s| RESOURCE_KINDS.contains(s))
        .unwrap_or(segments.len());
    let name = segments[..end].join("/");
    if name.is_empty() {
        return Vec::new();
    }

    let actions = if *method == Method::GET || *method == Method::HEAD {
        vec!["pull".to_string()]
    } else {
        vec!["pull".to_string(), "push".to_string()]
    };

    vec![AccessEntry {
        kind: "repository".to_string(),
        name,
        actions,
    }]
}
