// session-core/src/error.rs
use thiserror::Error;

/// Transport-level failures of the backing key-value store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out")]
    Timeout,
}

impl StoreError {
    /// Returned by every call made after `close()`
    pub fn closed() -> Self {
        Self::Unavailable("store closed".to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Failures of the sign/encrypt envelope around a session record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("invalid session signature")]
    InvalidSignature,

    #[error("session token expired")]
    Expired,

    #[error("session envelope could not be decrypted")]
    DecryptionFailed,

    #[error("session encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Copy, Error)]
#[error("key derivation produced an invalid output length")]
pub struct KeyDerivationError;

/// Errors surfaced by the session store to its callers.
///
/// Corrupted or unverifiable stored sessions never show up here: `get`
/// recovers from them locally and reports the session as absent.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("session create conflict after {attempts} attempts")]
    CreateConflict { attempts: u32 },

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),
}

impl From<config::ConfigError> for SessionError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}
