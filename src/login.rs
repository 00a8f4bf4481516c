//! Browser login flow on the gateway host.
//!
//! `/launch` stores a fresh CSRF `state` and the post-login target in the
//! session and sends the browser to the identity provider. `/oidc` is the
//! provider callback: it only accepts a `state` equal to the one stored in
//! the session, trades the code for a principal and finishes the login.

use std::sync::Arc;

use axum::{
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::gateway::response::{self, html_escape};
use crate::oidc::IdentityProvider;
use crate::session::{Session, SessionStore};

/// Body of the CSRF rejection
pub const INVALID_STATE: &str = "Invalid Browser State";

/// Query parameters the login endpoints read
#[derive(Debug, Default)]
struct LoginQuery {
    next: Option<String>,
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl LoginQuery {
    fn parse(uri: &Uri) -> Self {
        let mut query = Self::default();
        let Some(raw) = uri.query() else {
            return query;
        };
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            let slot = match key.as_ref() {
                "next" => &mut query.next,
                "state" => &mut query.state,
                "code" => &mut query.code,
                "error" => &mut query.error,
                "error_description" => &mut query.error_description,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        query
    }
}

/// `/launch` and `/oidc` handlers
pub struct LoginFlow {
    sessions: Arc<dyn SessionStore>,
    provider: Arc<dyn IdentityProvider>,
}

impl LoginFlow {
    /// Create with the session store and identity provider.
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionStore>, provider: Arc<dyn IdentityProvider>) -> Self {
        Self { sessions, provider }
    }

    /// Route a gateway-host request. Unknown paths get 404.
    pub async fn handle(&self, uri: &Uri, headers: &HeaderMap) -> Response {
        let query = LoginQuery::parse(uri);
        if let Some(error) = query.error.as_deref() {
            return provider_error(error, query.error_description.as_deref());
        }

        match uri.path() {
            "/launch" => self.launch(headers, query.next),
            "/oidc" => self.callback(headers, query).await,
            path => {
                debug!(path = %path, "Unknown path on gateway host");
                response::empty(StatusCode::NOT_FOUND)
            }
        }
    }

    /// Start a login: new state, remember `next`, redirect to the provider.
    fn launch(&self, headers: &HeaderMap, next: Option<String>) -> Response {
        let mut session = self.sessions.load(headers).unwrap_or_else(|| self.sessions.create());

        let state = hex::encode(rand::random::<[u8; 32]>());
        session.state = Some(state.clone());
        session.next = next;

        let target = self.provider.authorization_url(&state);
        let mut response = response::script_redirect(StatusCode::OK, &target);
        if let Err(e) = self.sessions.save(&session, response.headers_mut()) {
            warn!(error = %e, "Failed to save session");
            return response::empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
        debug!("Login launched");
        response
    }

    /// Provider callback: check state, exchange code, log the user in.
    async fn callback(&self, headers: &HeaderMap, query: LoginQuery) -> Response {
        let Some(mut session) = self.sessions.load(headers) else {
            debug!("Callback without a session");
            return AuthError::Authorization(INVALID_STATE.to_string()).into_response();
        };

        if !state_matches(&session, query.state.as_deref()) {
            warn!("Callback state does not match the session");
            return AuthError::Authorization(INVALID_STATE.to_string()).into_response();
        }

        let Some(code) = query.code.filter(|c| !c.is_empty()) else {
            return AuthError::BadRequest("Missing authorization code".to_string()).into_response();
        };

        let user = match self.provider.exchange_code(&code).await {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "Code exchange failed");
                return AuthError::Authentication(e.to_string()).into_response();
            }
        };

        let next = session.next.take().unwrap_or_default();
        session.state = None;
        session.user = Some(user.clone());

        let mut response = response::found(&next);
        if let Err(e) = self.sessions.save(&session, response.headers_mut()) {
            warn!(error = %e, "Failed to save session");
            return response::empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
        info!(user = %user, "Login completed");
        response
    }
}

/// Stored state must be present, non-empty and equal to the presented one.
fn state_matches(session: &Session, presented: Option<&str>) -> bool {
    match (session.state.as_deref(), presented) {
        (Some(stored), Some(presented)) if !stored.is_empty() => {
            bool::from(stored.as_bytes().ct_eq(presented.as_bytes()))
        }
        _ => false,
    }
}

/// 400 page for an authorization error reported by the provider.
fn provider_error(error: &str, description: Option<&str>) -> Response {
    warn!(error = %error, "Identity provider reported an error");
    let mut body = format!("Login failed: {}", html_escape(error));
    if let Some(description) = description.filter(|d| !d.is_empty()) {
        body.push_str(": ");
        body.push_str(&html_escape(description));
    }
    AuthError::BadRequest(body).into_response()
}
