//! Beyond Library
//!
//! Identity-aware reverse proxy. Every request is authenticated and
//! authorized at the edge before it reaches an internal service.
//!
//! # Features
//!
//! - **Browser login**: OpenID Connect handshake on `/launch` and `/oidc`
//!   with a CSRF state bound to an encrypted session cookie
//! - **Registry tokens**: the container registry v2 token protocol, with
//!   tokens signed and verified by the gateway
//! - **API tokens**: static and remotely validated bearer tokens
//! - **Policy**: whitelist rules that bypass login, fence rules that
//!   restrict hosts to listed principals
//! - **Identity propagation**: the principal is passed upstream in
//!   `<prefix>-User`; client-supplied copies are dropped

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod login;
pub mod oidc;
pub mod policy;
pub mod registry;
pub mod session;
pub mod target;
pub mod token_auth;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let initialized = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    initialized.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
