//! Registry auth tokens — RS256 JWTs minted by the gateway.
//!
//! Tokens are stateless: validity is the signature plus `exp`/`nbf`/`iss`.
//! Nothing is stored server-side, so verification never needs the identity
//! provider.

use std::path::Path;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RegistryConfig;
use crate::{Error, Result};

/// Marker value for the disabled signing-root extension point
const EXTENSION_DISABLED: &str = "$disabled";

/// One granted scope, in registry token-protocol form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    /// `repository` or `registry`
    #[serde(rename = "type")]
    pub kind: String,
    /// Repository name, or `catalog`
    pub name: String,
    /// `pull`, `push`, `*`
    pub actions: Vec<String>,
}

/// Entity context embedded in every token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenContext {
    /// Always `user` for credentials exchanged on `/v2/auth`
    pub entity_kind: String,
    /// Always `user`
    pub kind: String,
    /// Context schema version
    pub version: u32,
    /// Signing-root extension point, disabled
    #[serde(rename = "com.apostille.root")]
    pub apostille_root: String,
    /// Authenticated user
    pub user: String,
    /// Opaque per-token entity reference
    pub entity_reference: String,
}

/// Claims of a registry auth token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryClaims {
    /// Granted scopes; empty at issuance
    pub access: Vec<AccessEntry>,
    /// Entity context
    pub context: TokenContext,
    /// Audience, unused
    pub aud: Option<String>,
    /// Expiry, seconds since epoch
    pub exp: i64,
    /// Issued at
    pub iat: i64,
    /// Not before
    pub nbf: i64,
    /// Issuer
    pub iss: String,
    /// Principal
    pub sub: String,
}

impl RegistryClaims {
    /// Fresh claims for `subject`, valid from `now` for `ttl`.
    #[must_use]
    pub fn new(subject: &str, issuer: &str, now: i64, ttl: Duration) -> Self {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Self {
            access: Vec::new(),
            context: TokenContext {
                entity_kind: "user".to_string(),
                kind: "user".to_string(),
                version: 2,
                apostille_root: EXTENSION_DISABLED.to_string(),
                user: subject.to_string(),
                entity_reference: uuid::Uuid::new_v4().to_string(),
            },
            aud: None,
            exp: now.saturating_add(ttl),
            iat: now,
            nbf: now,
            iss: issuer.to_string(),
            sub: subject.to_string(),
        }
    }
}

/// Signs and verifies registry tokens with one RSA key pair.
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    key_id: String,
    issuer: String,
    ttl: Duration,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("key_id", &self.key_id)
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Build from PEM-encoded RSA keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Key`] if either key does not parse.
    pub fn from_pem(private_pem: &[u8], public_pem: &[u8], issuer: &str, ttl: Duration) -> Result<Self> {
        let encoding = EncodingKey::from_rsa_pem(private_pem)
            .map_err(|e| Error::Key(format!("signing key: {e}")))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem)
            .map_err(|e| Error::Key(format!("verification key: {e}")))?;

        Ok(Self {
            encoding,
            decoding,
            key_id: key_id(public_pem),
            issuer: issuer.to_string(),
            ttl,
        })
    }

    /// Load the key files named in the registry configuration.
    pub fn load(config: &RegistryConfig) -> Result<Self> {
        let private_pem = read_key(&config.signing_key)?;
        let public_pem = read_key(&config.verification_key)?;
        Self::from_pem(&private_pem, &public_pem, &config.issuer, config.token_ttl)
    }

    /// `kid` advertised in token headers
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Mint a token for `subject`, valid from now.
    pub fn issue(&self, subject: &str) -> Result<String> {
        self.issue_at(subject, chrono::Utc::now().timestamp())
    }

    /// Mint a token for `subject` as if issued at `now`.
    pub fn issue_at(&self, subject: &str, now: i64) -> Result<String> {
        let claims = RegistryClaims::new(subject, &self.issuer, now, self.ttl);
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.clone());
        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding)?)
    }

    /// Check signature, issuer and time bounds.
    pub fn verify(&self, token: &str) -> Result<RegistryClaims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);

        let data = jsonwebtoken::decode::<RegistryClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

fn read_key(path: &str) -> Result<Vec<u8>> {
    std::fs::read(Path::new(path)).map_err(|e| Error::Key(format!("{path}: {e}")))
}

/// Stable key id: hex SHA-256 of the public key PEM.
fn key_id(public_pem: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_pem.trim_ascii());
    hex::encode(hasher.finalize())
}
