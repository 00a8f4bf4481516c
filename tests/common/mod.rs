//! Shared harness: a gateway router wired to fake collaborators.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get as route_get,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http_body_util::BodyExt;
use tower::ServiceExt;

use beyond::config::{Config, FenceRule, StaticTokenConfig, WhitelistRule};
use beyond::gateway::{AppState, ProxyTransport, create_router};
use beyond::login::LoginFlow;
use beyond::oidc::{IdentityProvider, OidcError};
use beyond::registry::{RegistryGateway, TokenSigner, UpstreamRegistryAuth};
use beyond::session::{CookieSessionStore, Session, SessionStore};
use beyond::token_auth::HttpTokenAuthenticator;

pub const PRIVATE_KEY: &[u8] = include_bytes!("../fixtures/registry_key.pem");
pub const PUBLIC_KEY: &[u8] = include_bytes!("../fixtures/registry_key.pub.pem");

/// Upstream that answers with the identity header it received, or `-`,
/// and reports the host and path it was asked for.
pub struct EchoUpstream;

#[async_trait]
impl ProxyTransport for EchoUpstream {
    async fn forward(&self, host: &str, request: Request) -> Response {
        let user = request
            .headers()
            .get("beyond-user")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let path = request.uri().path_and_query().map_or("/", |pq| pq.as_str()).to_string();
        (
            StatusCode::OK,
            [("x-upstream-host", host.to_string()), ("x-upstream-path", path)],
            user,
        )
            .into_response()
    }
}

/// Provider that accepts the codes `good` and `ops`.
pub struct FakeIdentityProvider;

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    fn authorization_url(&self, state: &str) -> String {
        format!("https://idp.example.com/auth?state={state}&access_type=offline")
    }

    async fn exchange_code(&self, code: &str) -> Result<String, OidcError> {
        match code {
            "good" => Ok("joe@example.com".to_string()),
            "ops" => Ok("amy@ops.example.com".to_string()),
            _ => Err(OidcError::ExchangeRejected {
                status: 400,
                detail: "invalid_grant".to_string(),
            }),
        }
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "beyond.example.com".to_string();
    config.session.secret = Some("integration-secret".to_string());
    config.token_auth.tokens = vec![StaticTokenConfig {
        key: "ci-secret".to_string(),
        user: "ci@example.com".to_string(),
    }];
    config.policy.whitelist = vec![WhitelistRule {
        host: "status.example.com".to_string(),
        path: Some("/public/*".to_string()),
        methods: vec!["GET".to_string()],
    }];
    config.policy.fence = vec![
        FenceRule {
            host: "admin.example.com".to_string(),
            path: None,
            allow: vec!["@ops.example.com".to_string()],
        },
        FenceRule {
            host: "app.example.com".to_string(),
            path: Some("/private/*".to_string()),
            allow: vec!["alice@example.com".to_string()],
        },
    ];
    config.registry.enabled = true;
    config.registry.host = "docker.example.com".to_string();
    config.registry.service = "docker.example.com".to_string();
    config
}

pub struct Harness {
    pub router: Router,
    pub sessions: Arc<CookieSessionStore>,
    pub signer: Arc<TokenSigner>,
}

impl Harness {
    /// Build with the registry provider at `registry_upstream`.
    pub fn new(registry_upstream: &str) -> Self {
        let config = Arc::new(test_config());
        let sessions = Arc::new(CookieSessionStore::new(&config.session));
        let tokens = Arc::new(HttpTokenAuthenticator::new(&config.token_auth).unwrap());
        let login = LoginFlow::new(sessions.clone(), Arc::new(FakeIdentityProvider));

        let signer = Arc::new(
            TokenSigner::from_pem(PRIVATE_KEY, PUBLIC_KEY, "beyond", Duration::from_secs(3600)).unwrap(),
        );
        let exchange = Arc::new(UpstreamRegistryAuth::new(registry_upstream, Duration::from_secs(2)).unwrap());
        let registry = RegistryGateway::new(&config, signer.clone(), exchange);

        let state = AppState::new(
            Arc::clone(&config),
            sessions.clone(),
            tokens,
            login,
            Some(registry),
            Arc::new(EchoUpstream),
        )
        .unwrap();

        Self {
            router: create_router(Arc::new(state), &config),
            sessions,
            signer,
        }
    }

    /// Harness whose registry provider is unreachable.
    pub fn offline() -> Self {
        Self::new("http://127.0.0.1:9")
    }

    pub async fn send(&self, request: Request) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// `Cookie` header carrying a session logged in as `user`.
    pub fn session_cookie(&self, user: &str) -> HeaderValue {
        let mut headers = HeaderMap::new();
        let session = Session {
            user: Some(user.to_string()),
            ..Session::default()
        };
        self.sessions.save(&session, &mut headers).unwrap();
        cookie_from_set_cookie(&headers)
    }
}

/// Turn the `Set-Cookie` of a response into a request `Cookie` value.
pub fn cookie_from_set_cookie(headers: &HeaderMap) -> HeaderValue {
    let set_cookie = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
    HeaderValue::from_str(set_cookie.split(';').next().unwrap()).unwrap()
}

pub fn get(host: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(uri).header(header::HOST, host)
}

pub fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

pub async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn empty() -> Body {
    Body::empty()
}

/// Fake identity provider for registry credentials, served on an
/// ephemeral port. Accepts `joe:secret`; `broken:json` gets a non-JSON 200.
pub async fn spawn_registry_provider() -> String {
    async fn auth(headers: HeaderMap) -> Response {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if authorization == basic("joe", "secret") {
            Json(serde_json::json!({ "token": "provider-token", "expires_in": 300 })).into_response()
        } else if authorization == basic("broken", "json") {
            (StatusCode::OK, "<html>maintenance</html>").into_response()
        } else {
            StatusCode::UNAUTHORIZED.into_response()
        }
    }

    let app = Router::new().route("/v2/auth", route_get(auth));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}
