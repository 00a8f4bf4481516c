//! Browser sessions carried in an encrypted cookie.
//!
//! The [`SessionStore`] trait is the seam the login flow and dispatcher use;
//! [`CookieSessionStore`] keeps the whole session client-side as
//! `base64url(nonce || AES-256-GCM(json))`, with the cookie name as
//! associated data. The cipher key is HMAC-SHA256 of a fixed context under
//! the configured secret. A cookie that is missing, malformed, forged or
//! older than `max_age` loads as no session at all.

use std::time::Duration;

use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use axum::http::{HeaderMap, HeaderValue, header};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::config::SessionConfig;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Derivation context for the cookie cipher key
const KEY_CONTEXT: &[u8] = b"beyond session cookie v1";

/// Session fields. Absence is explicit: a fresh session has all three unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// One-time CSRF nonce written by `/launch`, consumed by `/oidc`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Where to send the browser after login. Only ever used as a redirect target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Authenticated principal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Persistence for [`Session`]s.
pub trait SessionStore: Send + Sync + 'static {
    /// Load the session attached to a request. Any decoding failure is `None`.
    fn load(&self, headers: &HeaderMap) -> Option<Session>;

    /// A new, empty session.
    fn create(&self) -> Session {
        Session::default()
    }

    /// Attach the session to a response.
    fn save(&self, session: &Session, headers: &mut HeaderMap) -> Result<()>;
}

/// Wire form of the cookie payload
#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(flatten)]
    session: Session,
    /// Issued-at, seconds since epoch
    iat: i64,
}

/// Encrypted cookie session store
pub struct CookieSessionStore {
    cookie_name: String,
    cookie_domain: Option<String>,
    secret: Vec<u8>,
    max_age: Duration,
    secure: bool,
}

impl CookieSessionStore {
    /// Create from configuration (resolves `env:` and `auto` secrets).
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            cookie_name: config.cookie_name.clone(),
            cookie_domain: config.cookie_domain.clone(),
            secret: config.resolve_secret(),
            max_age: config.max_age,
            secure: config.secure,
        }
    }

    fn cipher(&self) -> Result<LessSafeKey> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Internal(format!("session secret: {e}")))?;
        mac.update(KEY_CONTEXT);
        let key = mac.finalize().into_bytes();
        let key = UnboundKey::new(&AES_256_GCM, key.as_slice())
            .map_err(|e| Error::Internal(format!("session key: {e}")))?;
        Ok(LessSafeKey::new(key))
    }

    fn encode(&self, session: &Session, now: i64) -> Result<String> {
        let mut sealed = serde_json::to_vec(&Envelope {
            session: session.clone(),
            iat: now,
        })?;

        let nonce: [u8; NONCE_LEN] = rand::random();
        self.cipher()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(self.cookie_name.as_bytes()),
                &mut sealed,
            )
            .map_err(|e| Error::Internal(format!("session seal: {e}")))?;

        let mut cookie = nonce.to_vec();
        cookie.append(&mut sealed);
        Ok(URL_SAFE_NO_PAD.encode(cookie))
    }

    fn decode(&self, value: &str, now: i64) -> Option<Session> {
        let mut raw = URL_SAFE_NO_PAD.decode(value).ok()?;
        if raw.len() < NONCE_LEN {
            return None;
        }
        let mut sealed = raw.split_off(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(&raw).ok()?;

        let cipher = self.cipher().ok()?;
        let Ok(json) = cipher.open_in_place(nonce, Aad::from(self.cookie_name.as_bytes()), &mut sealed) else {
            debug!("Session cookie failed authentication");
            return None;
        };
        let envelope: Envelope = serde_json::from_slice(json).ok()?;

        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        if now.saturating_sub(envelope.iat) > max_age {
            debug!("Session cookie expired");
            return None;
        }

        Some(envelope.session)
    }

    fn set_cookie(&self, value: &str) -> String {
        let mut cookie = format!(
            "{}={value}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name,
            self.max_age.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        if let Some(ref domain) = self.cookie_domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        cookie
    }
}

impl SessionStore for CookieSessionStore {
    fn load(&self, headers: &HeaderMap) -> Option<Session> {
        let value = find_cookie(headers, &self.cookie_name)?;
        self.decode(value, chrono::Utc::now().timestamp())
    }

    fn save(&self, session: &Session, headers: &mut HeaderMap) -> Result<()> {
        let value = self.encode(session, chrono::Utc::now().timestamp())?;
        let cookie = HeaderValue::from_str(&self.set_cookie(&value))
            .map_err(|e| Error::Internal(format!("session cookie: {e}")))?;
        headers.append(header::SET_COOKIE, cookie);
        Ok(())
    }
}

/// Find a cookie value by name across every `Cookie` header.
fn find_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}
