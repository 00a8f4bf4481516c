//! Configuration management
//!
//! The whole gateway is driven by one immutable [`Config`] built at startup.
//! Handlers never mutate it; tests construct their own instance.

use std::{collections::HashMap, env, path::Path, time::Duration};

use axum::http::StatusCode;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Listener, hosts and pipeline knobs
    pub server: ServerConfig,
    /// Browser session cookie
    pub session: SessionConfig,
    /// Federated login provider
    pub oidc: OidcConfig,
    /// Registry v2 token authentication
    pub registry: RegistryConfig,
    /// Non-session credential validation
    pub token_auth: TokenAuthConfig,
    /// Whitelist and fence rules
    pub policy: PolicyConfig,
    /// Upstream services behind the gateway
    pub proxy: ProxyConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on
    pub listen: String,
    /// Scheme used when building public URLs (`https` behind a TLS terminator)
    pub scheme: String,
    /// Host name of the gateway itself (serves `/launch` and `/oidc`)
    pub host: String,
    /// Load balancer health check path, answered before any auth
    pub health_path: String,
    /// Body returned on the health check path
    pub health_reply: String,
    /// Prefix of the identity header sent upstream (`<prefix>-User`)
    pub header_prefix: String,
    /// Status returned when a login is forced
    pub unauthorized_status: u16,
    /// Whole-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum request body size forwarded upstream (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            scheme: "https".to_string(),
            host: "beyond.example.com".to_string(),
            health_path: "/healthz.html".to_string(),
            health_reply: "OK".to_string(),
            header_prefix: "Beyond".to_string(),
            unauthorized_status: 418,
            request_timeout: Duration::from_secs(60),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ServerConfig {
    /// Name of the identity header propagated to upstream services
    #[must_use]
    pub fn user_header(&self) -> String {
        format!("{}-User", self.header_prefix)
    }

    /// Base URL of the gateway host, e.g. `https://beyond.example.com`
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

/// Session cookie configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cookie name
    pub cookie_name: String,
    /// Cookie `Domain` attribute, e.g. `.example.com` to cover every proxied host
    pub cookie_domain: Option<String>,
    /// MAC secret. Supports a literal value, `env:VAR_NAME`, or `auto`
    /// (random per process, sessions do not survive restarts)
    pub secret: Option<String>,
    /// Session lifetime
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Set the `Secure` cookie attribute
    pub secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "beyond".to_string(),
            cookie_domain: None,
            secret: Some("auto".to_string()),
            max_age: Duration::from_secs(7 * 24 * 3600),
            secure: true,
        }
    }
}

impl SessionConfig {
    /// Resolve the MAC secret (expand env vars, generate if `auto`)
    #[must_use]
    pub fn resolve_secret(&self) -> Vec<u8> {
        match self.secret.as_deref() {
            None | Some("auto") => {
                let random_bytes: [u8; 32] = rand::random();
                random_bytes.to_vec()
            }
            Some(secret) => resolve_env(secret).into_bytes(),
        }
    }
}

/// OpenID Connect provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Issuer URL, compared against the `iss` claim of ID tokens
    pub issuer: String,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Authorization endpoint
    pub auth_url: String,
    /// Token endpoint
    pub token_url: String,
    /// JWKS endpoint (default: `<issuer>/.well-known/jwks.json`)
    pub jwks_uri: Option<String>,
    /// Redirect URI registered with the provider (default: `<gateway>/oidc`)
    pub redirect_url: Option<String>,
    /// Scopes requested at the authorization endpoint
    pub scopes: Vec<String>,
    /// Email domains allowed to log in (empty = any)
    pub allowed_domains: Vec<String>,
    /// Timeout for token endpoint and JWKS calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: "https://accounts.google.com".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            jwks_uri: Some("https://www.googleapis.com/oauth2/v3/certs".to_string()),
            redirect_url: None,
            scopes: vec!["openid".to_string(), "email".to_string()],
            allowed_domains: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Registry v2 token authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Enable the registry token gateway
    pub enabled: bool,
    /// Registry-facing host name
    pub host: String,
    /// `service` advertised in the `WWW-Authenticate` challenge
    pub service: String,
    /// `iss` claim of minted tokens
    pub issuer: String,
    /// Base URL of the identity provider that checks Basic credentials
    /// (its `/v2/auth` endpoint is called)
    pub upstream: String,
    /// RSA private key (PEM file) used to sign tokens
    pub signing_key: String,
    /// RSA public key (PEM file) used to verify tokens
    pub verification_key: String,
    /// Lifetime of minted tokens
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Status for clients probing `/v2/` without the token protocol
    pub unsupported_status: u16,
    /// Timeout for the credential exchange with the identity provider
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "docker.example.com".to_string(),
            service: "docker.example.com".to_string(),
            issuer: "beyond".to_string(),
            upstream: String::new(),
            signing_key: String::new(),
            verification_key: String::new(),
            token_ttl: Duration::from_secs(3600),
            unsupported_status: 418,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Token authenticator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenAuthConfig {
    /// Static tokens mapped to principals
    pub tokens: Vec<StaticTokenConfig>,
    /// External validation endpoint, called with `Authorization: Bearer <token>`
    pub validate_url: Option<String>,
    /// Timeout for the validation call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TokenAuthConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            validate_url: None,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Static token entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticTokenConfig {
    /// The token value (supports `env:VAR_NAME`)
    pub key: String,
    /// Principal the token authenticates as
    pub user: String,
}

impl StaticTokenConfig {
    /// Resolve the token value (expand env vars)
    #[must_use]
    pub fn resolve_key(&self) -> String {
        resolve_env(&self.key)
    }
}

/// Access policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Rules that let matching requests through without authentication
    pub whitelist: Vec<WhitelistRule>,
    /// Rules that restrict hosts/paths to listed principals
    pub fence: Vec<FenceRule>,
}

/// Unauthenticated bypass rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistRule {
    /// Host, exact or `*.example.com`
    pub host: String,
    /// Path glob (default: every path)
    #[serde(default)]
    pub path: Option<String>,
    /// Methods (default: every method)
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Deny rule for authenticated principals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceRule {
    /// Host, exact or `*.example.com`
    pub host: String,
    /// Path glob (default: every path)
    #[serde(default)]
    pub path: Option<String>,
    /// Principals allowed through: exact ids or `@domain` entries
    #[serde(default)]
    pub allow: Vec<String>,
}

/// Proxy transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream used when no host-specific entry exists
    pub default_upstream: Option<String>,
    /// Upstream base URL per request host
    pub upstreams: HashMap<String, String>,
    /// Timeout for forwarded requests
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            default_upstream: None,
            upstreams: HashMap::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Expand an `env:VAR_NAME` reference, falling back to the literal value.
fn resolve_env(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (BEYOND_ prefix)
        figment = figment.merge(Env::prefixed("BEYOND_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars();
        config.oidc.client_secret = resolve_env(&config.oidc.client_secret);
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        for (name, code) in [
            ("server.unauthorized_status", self.server.unauthorized_status),
            ("registry.unsupported_status", self.registry.unsupported_status),
        ] {
            StatusCode::from_u16(code)
                .map_err(|_| Error::Config(format!("{name}: invalid HTTP status {code}")))?;
        }

        if self.server.header_prefix.is_empty()
            || axum::http::HeaderName::from_bytes(self.server.user_header().as_bytes()).is_err()
        {
            return Err(Error::Config(format!(
                "server.header_prefix: '{}' does not form a valid header name",
                self.server.header_prefix
            )));
        }

        if !self.server.health_path.starts_with('/') {
            return Err(Error::Config(
                "server.health_path must start with '/'".to_string(),
            ));
        }

        if self.registry.enabled {
            if self.registry.upstream.is_empty() {
                return Err(Error::Config(
                    "registry.upstream is required when the registry gateway is enabled"
                        .to_string(),
                ));
            }
            if self.registry.signing_key.is_empty() || self.registry.verification_key.is_empty() {
                return Err(Error::Config(
                    "registry.signing_key and registry.verification_key are required".to_string(),
                ));
            }
            if self.registry.host.eq_ignore_ascii_case(&self.server.host) {
                return Err(Error::Config(
                    "registry.host must differ from server.host".to_string(),
                ));
            }
        }

        let whitelist_paths = self.policy.whitelist.iter().filter_map(|r| r.path.as_ref());
        let fence_paths = self.policy.fence.iter().filter_map(|r| r.path.as_ref());
        for pattern in whitelist_paths.chain(fence_paths) {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::Config(format!("policy path '{pattern}': {e}")))?;
        }

        Ok(())
    }

    /// Redirect URI registered with the identity provider
    #[must_use]
    pub fn oidc_redirect_url(&self) -> String {
        self.oidc
            .redirect_url
            .clone()
            .unwrap_or_else(|| format!("{}/oidc", self.server.base_url()))
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in upstream URLs
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in self.proxy.upstreams.values_mut() {
            *value = Self::expand_string(&re, value);
        }
        if let Some(ref mut upstream) = self.proxy.default_upstream {
            *upstream = Self::expand_string(&re, upstream);
        }
        self.registry.upstream = Self::expand_string(&re, &self.registry.upstream);
        self.registry.signing_key = Self::expand_string(&re, &self.registry.signing_key);
        self.registry.verification_key = Self::expand_string(&re, &self.registry.verification_key);
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "12h", "7d", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs)
        }
    }

}
