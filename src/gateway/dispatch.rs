//! Request dispatcher: one fallback handler that runs every request through
//! the authorization pipeline.
//!
//! Routing is an ordered table of `(predicate, route)` pairs. The first
//! matching entry wins, except that a registry route which declines the
//! request falls through to the next entry.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header, uri::PathAndQuery},
    response::{IntoResponse, Response},
};
use tracing::{debug, info};

use super::proxy::ProxyTransport;
use super::response;
use crate::config::Config;
use crate::error::AuthError;
use crate::login::LoginFlow;
use crate::policy::{AccessDecision, AccessPolicy};
use crate::registry::RegistryGateway;
use crate::session::SessionStore;
use crate::target::{normalize_path, strip_port};
use crate::token_auth::TokenAuthenticator;
use crate::{Error, Result};

/// Body of the fence rejection
pub const ACCESS_DENIED: &str = "Access Denied";

const X_REQUESTED_WITH: &str = "x-requested-with";

/// Shared application state
pub struct AppState {
    /// Immutable configuration
    pub config: Arc<Config>,
    /// Browser sessions
    pub sessions: Arc<dyn SessionStore>,
    /// Non-session credentials
    pub tokens: Arc<dyn TokenAuthenticator>,
    /// Whitelist and fence
    pub policy: AccessPolicy,
    /// `/launch` and `/oidc`
    pub login: LoginFlow,
    /// Registry token protocol, when enabled
    pub registry: Option<RegistryGateway>,
    /// Upstream forwarding
    pub proxy: Arc<dyn ProxyTransport>,
    user_header: HeaderName,
    unauthorized_status: StatusCode,
}

impl AppState {
    /// Assemble the state. Fails if the configured identity header or
    /// unauthorized status is invalid.
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<dyn SessionStore>,
        tokens: Arc<dyn TokenAuthenticator>,
        login: LoginFlow,
        registry: Option<RegistryGateway>,
        proxy: Arc<dyn ProxyTransport>,
    ) -> Result<Self> {
        let user_header = HeaderName::from_bytes(config.server.user_header().as_bytes())
            .map_err(|e| Error::Config(format!("identity header: {e}")))?;
        let unauthorized_status = StatusCode::from_u16(config.server.unauthorized_status)
            .map_err(|e| Error::Config(format!("unauthorized status: {e}")))?;

        Ok(Self {
            policy: AccessPolicy::new(&config.policy),
            config,
            sessions,
            tokens,
            login,
            registry,
            proxy,
            user_header,
            unauthorized_status,
        })
    }
}

/// Subsystem a request is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Health,
    Login,
    Registry,
    Protected,
}

type Predicate = fn(&AppState, &str, &Uri) -> bool;

/// Dispatch order, first match wins
const ROUTES: [(Predicate, Route); 4] = [
    (is_health_check, Route::Health),
    (is_gateway_host, Route::Login),
    (is_registry_host, Route::Registry),
    (any_request, Route::Protected),
];

fn any_request(_state: &AppState, _host: &str, _uri: &Uri) -> bool {
    true
}

fn is_health_check(state: &AppState, _host: &str, uri: &Uri) -> bool {
    uri.path() == state.config.server.health_path
}

fn is_gateway_host(state: &AppState, host: &str, _uri: &Uri) -> bool {
    strip_port(host).eq_ignore_ascii_case(&state.config.server.host)
}

fn is_registry_host(state: &AppState, host: &str, _uri: &Uri) -> bool {
    state.registry.as_ref().is_some_and(|r| r.serves_host(host))
}

/// Fallback handler for every request
pub async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let host = request_host(request.headers(), request.uri());

    for (predicate, route) in ROUTES {
        if !predicate(&state, &host, request.uri()) {
            continue;
        }
        match route {
            Route::Health => {
                return (StatusCode::OK, state.config.server.health_reply.clone()).into_response();
            }
            Route::Login => return state.login.handle(request.uri(), request.headers()).await,
            Route::Registry => {
                if let Some(registry) = &state.registry {
                    let handled = registry
                        .handle(&host, request.method(), request.uri(), request.headers())
                        .await;
                    if let Some(response) = handled {
                        return response;
                    }
                }
            }
            Route::Protected => return protected(&state, &host, request).await,
        }
    }

    response::empty(StatusCode::NOT_FOUND)
}

/// Resolve identity, apply policy, forward or refuse.
async fn protected(state: &AppState, host: &str, mut request: Request) -> Response {
    // Policy and upstream must see the same path
    let Some(path) = canonicalize(request.uri_mut()) else {
        debug!(uri = %request.uri(), "Refusing unnormalizable path");
        return AuthError::BadRequest("Bad Request".to_string()).into_response();
    };

    // Identity is only ever set by the gateway
    request.headers_mut().remove(&state.user_header);

    let principal = resolve_principal(state, request.headers()).await;
    if let Some(principal) = principal.as_deref() {
        match HeaderValue::from_str(principal) {
            Ok(value) => {
                request.headers_mut().insert(state.user_header.clone(), value);
            }
            Err(_) => {
                debug!("Principal is not a valid header value");
                return AuthError::Authentication(String::new()).into_response();
            }
        }
    }

    let method = request.method().as_str().to_string();
    match state.policy.decide(principal.as_deref(), host, &path, &method) {
        AccessDecision::Whitelisted | AccessDecision::Allow => state.proxy.forward(host, request).await,
        AccessDecision::ForceLogin => force_login(state, host, request.uri(), request.headers()),
        AccessDecision::Deny => {
            info!(principal = ?principal, host = %host, path = %path, "Denied by fence");
            AuthError::Authorization(ACCESS_DENIED.to_string()).into_response()
        }
    }
}

/// Rewrite `uri` to its normalized path, keeping the query. Returns the path.
fn canonicalize(uri: &mut Uri) -> Option<String> {
    let path = normalize_path(uri.path())?;
    if path != uri.path() {
        let path_and_query = match uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.clone(),
        };
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
        *uri = Uri::from_parts(parts).ok()?;
    }
    Some(path)
}

/// Session user first, then the token authenticator.
async fn resolve_principal(state: &AppState, headers: &HeaderMap) -> Option<String> {
    if let Some(user) = state.sessions.load(headers).and_then(|s| s.user) {
        return Some(user);
    }
    let authorization = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    state.tokens.authenticate(authorization).await
}

/// Anonymous request that needs a login.
fn force_login(state: &AppState, host: &str, uri: &Uri, headers: &HeaderMap) -> Response {
    // Scripts and websockets cannot follow a login redirect
    if headers.contains_key(header::UPGRADE) || headers.contains_key(X_REQUESTED_WITH) {
        return response::empty(state.unauthorized_status);
    }

    let server = &state.config.server;
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let original = format!("{}://{host}{path}", server.scheme);
    let next: String = url::form_urlencoded::byte_serialize(original.as_bytes()).collect();
    let target = format!("{}/launch?next={next}", server.base_url());

    debug!(host = %host, "Forcing login");
    response::script_redirect(state.unauthorized_status, &target)
}

/// Request host, lowercased, from `Host` or the URI authority.
fn request_host(headers: &HeaderMap, uri: &Uri) -> String {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(axum::http::uri::Authority::as_str))
        .unwrap_or_default()
        .to_ascii_lowercase()
}
