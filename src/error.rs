//! Error types for the beyond gateway
//!
//! [`Error`] covers startup and collaborator failures. Per-request outcomes
//! that end a request early are [`AuthError`], which knows how to render
//! itself as an HTTP response.

use std::io;

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing or verification key could not be loaded
    #[error("Key error: {0}")]
    Key(String),

    /// Token could not be signed or verified
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// Identity provider rejected or failed a request
    #[error("Identity provider error: {0}")]
    Provider(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Request-level failures of the authorization pipeline.
///
/// None of these are fatal to the process; each one terminates a single
/// request with the status and body documented on the variant.
#[derive(Error, Debug)]
pub enum AuthError {
    /// No or invalid credentials. 401 with the given (possibly empty) body.
    #[error("authentication failed")]
    Authentication(String),

    /// Valid identity, policy says no. 403 with a short reason.
    #[error("access denied: {0}")]
    Authorization(String),

    /// Client speaks a registry protocol version this gateway does not serve.
    #[error("unsupported registry protocol")]
    ProtocolMismatch(StatusCode),

    /// Identity provider or upstream unreachable or returned garbage. 502.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Malformed request (bad query, provider-reported login error). 400.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl AuthError {
    /// HTTP status for this failure
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::ProtocolMismatch(status) => *status,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Upstream detail stays in the logs, the caller only sees the status.
        let body = match self {
            Self::Authentication(body) | Self::Authorization(body) | Self::BadRequest(body) => body,
            Self::ProtocolMismatch(_) | Self::Upstream(_) => String::new(),
        };
        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(crate::gateway::response::NO_CACHE),
        );
        response
    }
}
