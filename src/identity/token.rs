//! Access-token codec.
//!
//! `validate` is the only authoritative path: signature, issuer, audience and
//! lifetime are all enforced with zero clock skew. `introspect` and
//! `is_near_expiry` decode the payload without verifying anything and must
//! never gate access.

use anyhow::{bail, Context};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::{clock::Clock, models::Identity};

pub const DEFAULT_ISSUER: &str = "umbral";
pub const DEFAULT_AUDIENCE: &str = "umbral-clients";
pub const DEFAULT_EXPIRY_HOURS: u32 = 1;
pub const DEFAULT_REFRESH_TOKEN_EXPIRY_DAYS: u32 = 30;
/// HS256 keys shorter than the digest size are rejected at startup.
pub const MIN_KEY_BYTES: usize = 32;

/// Signing configuration. Read-only after startup.
#[derive(Clone, Debug)]
pub struct JwtSettings {
    key: SecretString,
    issuer: String,
    audience: String,
    expiry_hours: u32,
    refresh_token_expiry_days: u32,
    enable_blacklist: bool,
}

impl JwtSettings {
    #[must_use]
    pub fn new(key: SecretString) -> Self {
        Self {
            key,
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            expiry_hours: DEFAULT_EXPIRY_HOURS,
            refresh_token_expiry_days: DEFAULT_REFRESH_TOKEN_EXPIRY_DAYS,
            enable_blacklist: false,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Zero means "unset" and falls back to one hour.
    #[must_use]
    pub fn with_expiry_hours(mut self, hours: u32) -> Self {
        self.expiry_hours = if hours == 0 { DEFAULT_EXPIRY_HOURS } else { hours };
        self
    }

    #[must_use]
    pub fn with_refresh_token_expiry_days(mut self, days: u32) -> Self {
        self.refresh_token_expiry_days = days;
        self
    }

    #[must_use]
    pub fn with_blacklist(mut self, enabled: bool) -> Self {
        self.enable_blacklist = enabled;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    #[must_use]
    pub fn expiry_hours(&self) -> u32 {
        self.expiry_hours
    }

    /// Default refresh lifetime. Session flavors apply their own fixed policy.
    #[must_use]
    pub fn refresh_token_expiry_days(&self) -> u32 {
        self.refresh_token_expiry_days
    }

    #[must_use]
    pub fn blacklist_enabled(&self) -> bool {
        self.enable_blacklist
    }
}

/// Claims carried by every access token.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    pub sub: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub jti: String,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub role: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub permission: Vec<String>,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Single-valued claims may be emitted as a bare string by other issuers.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

/// Verified caller. `user_id` is `None` when the claim is absent or unparsable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub email: String,
    pub jti: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl Principal {
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Advisory view of a token, built without any verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenInfo {
    pub jti: Option<String>,
    pub user_id: Option<Uuid>,
    pub user_name: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}

/// Why a token failed validation. Callers collapse all of these to
/// "unauthenticated"; the variants exist for server-side logging.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token issuer does not match")]
    IssuerMismatch,
    #[error("token audience does not match")]
    AudienceMismatch,
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => Self::BadSignature,
            ErrorKind::InvalidIssuer => Self::IssuerMismatch,
            ErrorKind::InvalidAudience => Self::AudienceMismatch,
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            _ => Self::Malformed,
        }
    }
}

pub struct TokenCodec {
    settings: JwtSettings,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// # Errors
    /// Returns an error if the signing key is shorter than [`MIN_KEY_BYTES`].
    pub fn new(settings: JwtSettings, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let secret = settings.key.expose_secret().as_bytes();
        if secret.len() < MIN_KEY_BYTES {
            bail!("JWT signing key must be at least {MIN_KEY_BYTES} bytes");
        }
        let encoding_key = EncodingKey::from_secret(secret);
        let decoding_key = DecodingKey::from_secret(secret);

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[settings.issuer.as_str()]);
        validation.set_audience(&[settings.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 0;
        // Lifetime is checked against the injected clock in `validate`.
        validation.validate_exp = false;
        validation.validate_nbf = false;

        Ok(Self {
            settings,
            encoding_key,
            decoding_key,
            validation,
            clock,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &JwtSettings {
        &self.settings
    }

    #[must_use]
    pub fn access_token_lifetime(&self) -> Duration {
        Duration::hours(i64::from(self.settings.expiry_hours))
    }

    /// Sign a fresh access token for `identity`.
    ///
    /// # Errors
    /// Returns [`TokenError::Encoding`] if signing fails.
    pub fn issue_access_token(
        &self,
        identity: &Identity,
        roles: &[String],
        permissions: &[String],
    ) -> Result<IssuedToken, TokenError> {
        let now = self.clock.now();
        let expires_at = now + self.access_token_lifetime();
        let jti = Uuid::new_v4().to_string();

        let claims = AccessClaims {
            sub: identity.id.to_string(),
            name: identity.name.clone(),
            email: identity.email.clone(),
            user_id: Some(identity.id.to_string()),
            jti: jti.clone(),
            role: roles.to_vec(),
            permission: permissions.to_vec(),
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| TokenError::Encoding(err.to_string()))?;

        Ok(IssuedToken {
            token,
            jti,
            // Report the expiry the token actually carries (whole seconds).
            expires_at: timestamp(claims.exp).unwrap_or(expires_at),
        })
    }

    /// Authoritative validation.
    ///
    /// # Errors
    /// Returns the specific [`TokenError`]; callers must not expose it.
    pub fn validate(&self, token: &str) -> Result<Principal, TokenError> {
        let data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)?;
        let claims = data.claims;

        let now = self.clock.now().timestamp();
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        if now < claims.nbf {
            return Err(TokenError::NotYetValid);
        }

        let expires_at = timestamp(claims.exp).ok_or(TokenError::Malformed)?;
        let user_id = claims
            .user_id
            .as_deref()
            .and_then(|value| Uuid::parse_str(value).ok());

        Ok(Principal {
            subject: claims.sub,
            user_id,
            name: claims.name,
            email: claims.email,
            jti: claims.jti,
            roles: claims.role,
            permissions: claims.permission,
            expires_at,
        })
    }

    /// Decode claims without verifying signature or lifetime.
    #[must_use]
    pub fn introspect(&self, token: &str) -> Option<TokenInfo> {
        let claims = read_unverified(token).ok()?;
        let expires_at = claims.exp.and_then(timestamp);
        let is_expired = expires_at.map_or(true, |exp| exp <= self.clock.now());

        Some(TokenInfo {
            jti: claims.jti,
            user_id: claims
                .user_id
                .as_deref()
                .and_then(|value| Uuid::parse_str(value).ok()),
            user_name: claims.name,
            issued_at: claims.iat.and_then(timestamp),
            expires_at,
            is_expired,
        })
    }

    /// True if the remaining lifetime is at most `threshold`, or if the token
    /// cannot be read at all.
    #[must_use]
    pub fn is_near_expiry(&self, token: &str, threshold: Duration) -> bool {
        match self.introspect(token).and_then(|info| info.expires_at) {
            Some(expires_at) => expires_at - self.clock.now() <= threshold,
            None => true,
        }
    }
}

#[derive(Deserialize)]
struct UnverifiedClaims {
    jti: Option<String>,
    user_id: Option<String>,
    name: Option<String>,
    iat: Option<i64>,
    exp: Option<i64>,
}

fn read_unverified(token: &str) -> anyhow::Result<UnverifiedClaims> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        bail!("token does not have three segments");
    };
    let bytes = Base64UrlUnpadded::decode_vec(payload)
        .map_err(|err| anyhow::anyhow!("invalid payload encoding: {err}"))?;
    serde_json::from_slice(&bytes).context("invalid payload json")
}

fn timestamp(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}
