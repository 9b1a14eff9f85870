//! Signed bearer tokens.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::AuthConfig;
use crate::error::{Error, Result};
use crate::types::Subject;

/// Minimum signing secret length in bytes (HS256 key strength).
pub const MIN_SECRET_LEN: usize = 32;

/// Reasons a token fails verification.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Token cannot be parsed or carries unusable claims.
    #[error("malformed token")]
    Malformed,
    /// Signature does not verify under the configured key.
    #[error("invalid token signature")]
    InvalidSignature,
    /// `exp` has elapsed.
    #[error("token has expired")]
    Expired,
}

/// Opaque signed bearer credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Returns the token text for the `Authorization: Bearer` header.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Issues and verifies HS256 identity tokens.
///
/// Built once at startup from the process configuration; the key never
/// changes afterwards.
#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Option<Duration>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("key", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenCodec {
    /// Creates a codec, rejecting secrets shorter than [`MIN_SECRET_LEN`].
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::WeakSigningKey {
                min: MIN_SECRET_LEN,
                actual: secret.len(),
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is optional and checked against an explicit clock in `verify_at`.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims::<&str>(&[]);

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl: None,
        })
    }

    /// Creates a codec from loaded configuration.
    ///
    /// A `token_ttl_secs` too large to add to the current time is a
    /// configuration error.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let codec = Self::new(config.jwt_secret.as_bytes())?;
        let Some(secs) = config.token_ttl_secs else {
            return Ok(codec);
        };
        let ttl = i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .filter(|ttl| Utc::now().checked_add_signed(*ttl).is_some())
            .ok_or_else(|| ttl_out_of_range(secs))?;
        Ok(codec.with_ttl(ttl))
    }

    /// Sets the lifetime applied by [`TokenCodec::issue_now`].
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Signs a token bound to `subject` and the given timestamps.
    pub fn issue(
        &self,
        subject: &Subject,
        issued_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Token> {
        let claims = Claims {
            sub: subject.as_str().to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.map(|at| at.timestamp()),
        };
        // HMAC signing only fails on serialisation, which these claims cannot trigger.
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map(Token)
            .map_err(|err| Error::Token(map_jwt_error(err.kind())))
    }

    /// Signs a token issued now, expiring after the configured TTL if any.
    pub fn issue_now(&self, subject: &Subject) -> Result<Token> {
        let now = Utc::now();
        let expires_at = match self.ttl {
            Some(ttl) => Some(
                now.checked_add_signed(ttl)
                    .ok_or_else(|| ttl_out_of_range(ttl.num_seconds()))?,
            ),
            None => None,
        };
        self.issue(subject, now, expires_at)
    }

    /// Verifies a token against the current time.
    pub fn verify(&self, token: &str) -> std::result::Result<Subject, TokenError> {
        self.verify_at(token, Utc::now())
    }

    /// Verifies signature, then expiry relative to `now`.
    pub fn verify_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Subject, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|err| map_jwt_error(err.kind()))?;
        if let Some(exp) = data.claims.exp
            && exp <= now.timestamp()
        {
            return Err(TokenError::Expired);
        }
        Subject::new(&data.claims.sub).map_err(|_| TokenError::Malformed)
    }
}

fn ttl_out_of_range(secs: impl fmt::Display) -> Error {
    Error::Config(::config::ConfigError::Message(format!(
        "token_ttl_secs {secs} is out of range"
    )))
}

fn map_jwt_error(kind: &ErrorKind) -> TokenError {
    match kind {
        ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Malformed,
    }
}
