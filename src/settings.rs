//! Process-wide auth settings, loaded once at startup.

use std::fmt;
use std::path::Path;

use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::Result;

/// Environment variable prefix (`AUTH_JWT_SECRET`, `AUTH_TOKEN_TTL_SECS`).
pub const ENV_PREFIX: &str = "AUTH";

/// Settings consumed by [`TokenCodec::from_config`](crate::TokenCodec::from_config).
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret; at least 32 bytes.
    pub jwt_secret: String,
    /// Token lifetime in seconds. `None` issues non-expiring tokens.
    #[serde(default)]
    pub token_ttl_secs: Option<u64>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

impl AuthConfig {
    /// Loads settings from an optional file, overridden by `AUTH_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parses settings from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, TokenCodec};

    #[test]
    fn toml_settings_build_a_codec() {
        let config = AuthConfig::from_toml_str(
            r#"
            jwt_secret = "0123456789abcdef0123456789abcdef"
            token_ttl_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.token_ttl_secs, Some(3600));
        assert!(TokenCodec::from_config(&config).is_ok());
    }

    #[test]
    fn weak_secret_fails_at_startup() {
        let config = AuthConfig::from_toml_str(r#"jwt_secret = "short""#).unwrap();
        let err = TokenCodec::from_config(&config).expect_err("must reject");
        assert!(matches!(err, Error::WeakSigningKey { .. }));
    }

    #[test]
    fn missing_secret_is_a_config_error() {
        let err = AuthConfig::from_toml_str("token_ttl_secs = 10").expect_err("must fail");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = AuthConfig::from_toml_str(r#"jwt_secret = "super-secret-value""#).unwrap();
        assert!(!format!("{config:?}").contains("super-secret-value"));
    }
}
