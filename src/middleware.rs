//! Per-request identity resolution.
//!
//! Resolution is permissive: a missing, garbage or expired credential yields
//! an anonymous [`Identity`] and the request continues. Whether a route
//! needs a logged-in caller is decided later by the [guard](crate::guard).

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityStore};
use crate::store::UserDirectory;
use crate::token::TokenCodec;

/// Verifies bearer credentials and resolves them to identities.
#[derive(Debug, Clone)]
pub struct IdentityResolver<D> {
    codec: Arc<TokenCodec>,
    identities: IdentityStore<D>,
}

impl<D> IdentityResolver<D>
where
    D: UserDirectory,
{
    /// Creates a resolver verifying with `codec` and reading `directory`.
    pub fn new(codec: Arc<TokenCodec>, directory: D) -> Self {
        Self {
            codec,
            identities: IdentityStore::new(directory),
        }
    }

    /// Returns the token codec.
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Returns the identity store.
    pub fn identities(&self) -> &IdentityStore<D> {
        &self.identities
    }

    /// Resolves the raw `Authorization` header value of one request.
    ///
    /// Only a directory failure is an error; every credential problem
    /// resolves to [`Identity::anonymous`].
    pub async fn resolve_authorization(&self, header: Option<&str>) -> Result<Identity> {
        let Some(token) = header.and_then(bearer_token) else {
            return Ok(Identity::anonymous());
        };
        self.resolve_token(token).await
    }

    /// Resolves a bare token string.
    pub async fn resolve_token(&self, token: &str) -> Result<Identity> {
        let subject = match self.codec.verify(token) {
            Ok(subject) => subject,
            Err(err) => {
                warn!(reason = %err, "bearer token rejected, continuing as anonymous");
                return Ok(Identity::anonymous());
            }
        };

        match self.identities.resolve(&subject).await {
            Ok(identity) => {
                debug!(
                    subject = %subject,
                    roles = ?identity.roles(),
                    "identity resolved"
                );
                Ok(identity)
            }
            Err(Error::SubjectNotFound(_)) => {
                info!(subject = %subject, "token subject no longer exists, continuing as anonymous");
                Ok(Identity::anonymous())
            }
            Err(err) => Err(err),
        }
    }
}

/// Extracts the credential from a `Bearer <token>` header value.
pub(crate) fn bearer_token(value: &str) -> Option<&str> {
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}
