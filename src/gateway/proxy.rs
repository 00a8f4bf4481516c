//! Forwarding of authorized requests to the upstream services.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AuthError;
use crate::target::strip_port;
use crate::{Error, Result};

/// Connection-scoped headers never forwarded in either direction
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
];

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Where allowed requests go.
#[async_trait]
pub trait ProxyTransport: Send + Sync + 'static {
    /// Forward `request` (identity header already set) and relay the answer.
    async fn forward(&self, host: &str, request: Request) -> Response;
}

/// Reverse proxy over `reqwest`, upstream chosen by request host.
pub struct HttpForwarder {
    client: Client,
    upstreams: HashMap<String, String>,
    default_upstream: Option<String>,
    scheme: String,
    max_body_size: usize,
}

impl HttpForwarder {
    /// Create from configuration
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.proxy.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            // Upstream redirects are relayed to the client, not followed
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("proxy client: {e}")))?;

        let upstreams = config
            .proxy
            .upstreams
            .iter()
            .map(|(host, url)| (host.to_ascii_lowercase(), url.trim_end_matches('/').to_string()))
            .collect();

        Ok(Self {
            client,
            upstreams,
            default_upstream: config
                .proxy
                .default_upstream
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            scheme: config.server.scheme.clone(),
            max_body_size: config.server.max_body_size,
        })
    }

    /// Upstream base URL for `host`, falling back to the default.
    fn upstream_for(&self, host: &str) -> Option<&str> {
        let host = host.to_ascii_lowercase();
        self.upstreams
            .get(&host)
            .or_else(|| self.upstreams.get(strip_port(&host)))
            .or(self.default_upstream.as_ref())
            .map(String::as_str)
    }
}

#[async_trait]
impl ProxyTransport for HttpForwarder {
    async fn forward(&self, host: &str, request: Request) -> Response {
        let Some(upstream) = self.upstream_for(host) else {
            warn!(host = %host, "No upstream configured for host");
            return AuthError::Upstream(format!("no upstream for {host}")).into_response();
        };

        let (parts, body) = request.into_parts();
        let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let url = format!("{upstream}{path}");

        let body = match axum::body::to_bytes(body, self.max_body_size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Request body rejected");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(X_FORWARDED_HOST, value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.scheme) {
            headers.insert(X_FORWARDED_PROTO, value);
        }

        debug!(method = %parts.method, url = %url, "Forwarding");
        let upstream_response = match self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %url, error = %e, "Upstream request failed");
                return AuthError::Upstream(e.to_string()).into_response();
            }
        };

        let status = upstream_response.status();
        let mut response_headers = upstream_response.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        response_headers.remove(header::CONTENT_LENGTH);

        let bytes = match upstream_response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(url = %url, error = %e, "Upstream body read failed");
                return AuthError::Upstream(e.to_string()).into_response();
            }
        };

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in &named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
