//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, http::StatusCode};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::dispatch::{AppState, dispatch};
use super::proxy::HttpForwarder;
use crate::config::Config;
use crate::login::LoginFlow;
use crate::oidc::OidcProvider;
use crate::registry::{RegistryGateway, TokenSigner, UpstreamRegistryAuth};
use crate::session::CookieSessionStore;
use crate::token_auth::HttpTokenAuthenticator;
use crate::{Error, Result};

/// Identity-aware proxy server
pub struct Gateway {
    /// Configuration
    config: Arc<Config>,
    /// Shared request state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway with the production collaborators.
    ///
    /// # Errors
    ///
    /// Fails when the identity provider URLs or registry keys are unusable.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let sessions = Arc::new(CookieSessionStore::new(&config.session));
        let tokens = Arc::new(HttpTokenAuthenticator::new(&config.token_auth)?);
        let provider = Arc::new(OidcProvider::new(&config)?);
        let login = LoginFlow::new(sessions.clone(), provider);

        let registry = if config.registry.enabled {
            let signer = Arc::new(TokenSigner::load(&config.registry)?);
            info!(key_id = %signer.key_id(), "Loaded registry signing key");
            let exchange = Arc::new(UpstreamRegistryAuth::new(
                &config.registry.upstream,
                config.registry.timeout,
            )?);
            Some(RegistryGateway::new(&config, signer, exchange))
        } else {
            None
        };

        let proxy = Arc::new(HttpForwarder::new(&config)?);
        let state = AppState::new(Arc::clone(&config), sessions, tokens, login, registry, proxy)?;

        Ok(Self {
            config,
            state: Arc::new(state),
        })
    }

    /// Wrap already-assembled state (custom collaborators).
    #[must_use]
    pub fn from_state(config: Arc<Config>, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// The HTTP application
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), &self.config)
    }

    /// Run the gateway until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let listener = bind_listener(&self.config.server.listen).await?;
        let app = self.router();

        let server = &self.config.server;
        info!("============================================================");
        info!("BEYOND v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(listen = %server.listen, "Listening");
        info!(host = %server.host, "Login host: {}/launch", server.base_url());
        info!(path = %server.health_path, "Health check");
        if self.config.registry.enabled {
            info!(
                host = %self.config.registry.host,
                upstream = %self.config.registry.upstream,
                "Registry token gateway enabled"
            );
        }
        if matches!(self.config.session.secret.as_deref(), None | Some("auto")) {
            warn!("Session secret is generated per process - sessions will not survive a restart");
        }
        if self.config.oidc.client_id.is_empty() {
            warn!("oidc.client_id is empty - browser logins will fail");
        }
        info!(
            whitelist = self.config.policy.whitelist.len(),
            fence = self.config.policy.fence.len(),
            upstreams = self.config.proxy.upstreams.len(),
            "Policy loaded"
        );
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// Create the router: one fallback carrying the dispatcher.
pub fn create_router(state: Arc<AppState>, config: &Config) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            config.server.request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the listener.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unparseable address and [`Error::Io`]
/// when the socket cannot be bound.
pub async fn bind_listener(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address '{addr}': {e}")))?;
    Ok(TcpListener::bind(addr).await?)
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rejects_bare_colon() {
        let err = bind_listener(":").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn bind_accepts_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn gateway_builds_from_defaults() {
        let gateway = Gateway::new(Config::default()).unwrap();
        let _router = gateway.router();
    }

    #[test]
    fn enabled_registry_without_key_files_fails() {
        let mut config = Config::default();
        config.registry.enabled = true;
        config.registry.upstream = "https://quay.example.com".to_string();
        config.registry.signing_key = "/nonexistent/key.pem".to_string();
        config.registry.verification_key = "/nonexistent/key.pub.pem".to_string();
        assert!(matches!(Gateway::new(config), Err(Error::Key(_))));
    }
}
