use crate::token::TokenError;
use crate::types::Subject;
use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Store error wrapper.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Role string that is not acceptable where it was supplied.
    #[error("invalid role: {0}")]
    InvalidRole(String),
    /// Signing secret below the minimum length.
    #[error("signing key must be at least {min} bytes, got {actual}")]
    WeakSigningKey { min: usize, actual: usize },
    /// Configuration could not be loaded or deserialised.
    #[error("config error: {0}")]
    Config(#[from] ::config::ConfigError),
    /// Token could not be verified.
    #[error(transparent)]
    Token(#[from] TokenError),
    /// Token verified but its subject is not in the directory.
    #[error("subject not found: {0}")]
    SubjectNotFound(Subject),
    /// Protected action attempted without a valid identity.
    #[error("unauthorized")]
    Unauthorized,
    /// Valid identity lacking the required role or ownership.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Toggle or ownership target does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Login with an unknown subject or a wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Registration for a subject that already has an account.
    #[error("account already exists: {0}")]
    AccountExists(Subject),
    /// Password hashing failed.
    #[error("password hash error: {0}")]
    PasswordHash(String),
    /// Transaction kept colliding with concurrent writers.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

/// Marker a store returns (boxed in [`StoreError`]) when an optimistic
/// transaction loses a race and may be retried.
#[derive(Debug, Default, Clone, Copy, Error)]
#[error("transaction conflict")]
pub struct TxConflict;

/// Returns whether a store error is a [`TxConflict`].
pub fn is_conflict(error: &StoreError) -> bool {
    error.downcast_ref::<TxConflict>().is_some()
}
