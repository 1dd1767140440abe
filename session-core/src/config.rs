// session-core/src/config.rs
use config::{Config as ConfigFile, Environment};
use serde::Deserialize;
use std::fmt;
use zeroize::Zeroizing;

use crate::error::SessionError;

/// Minimum accepted length of the master secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;
/// Default session lifetime in seconds (one week)
pub const DEFAULT_SESSION_TTL: u64 = 7 * 24 * 60 * 60;
/// Longest accepted session lifetime (ten years); keeps `exp` claims and
/// store expiries well inside `i64` and Redis's expire range
pub const MAX_SESSION_TTL: u64 = 10 * 365 * 24 * 60 * 60;
pub const DEFAULT_MAX_CREATE_ATTEMPTS: u32 = 5;
pub const DEFAULT_CREATE_RETRY_BACKOFF_MS: u64 = 10;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Validated session configuration.
///
/// Construction fails if the secret is too short or the TTL is out of
/// range, so a process holding a `SessionSettings` can always derive keys
/// and stamp expiries.
#[derive(Clone)]
pub struct SessionSettings {
    secret: Zeroizing<Vec<u8>>,
    ttl_secs: u64,
    pub max_create_attempts: u32,
    pub create_retry_backoff_ms: u64,
    pub store_timeout_ms: u64,
}

/// Raw values as read from the environment, before validation
#[derive(Debug, Default, Deserialize)]
struct RawSessionSettings {
    secret: Option<String>,
    ttl: Option<u64>,
    max_create_attempts: Option<u32>,
    create_retry_backoff_ms: Option<u64>,
    store_timeout_ms: Option<u64>,
}

impl SessionSettings {
    pub fn new(secret: impl AsRef<[u8]>, ttl_secs: u64) -> Result<Self, SessionError> {
        let secret = secret.as_ref();
        if secret.len() < MIN_SECRET_LEN {
            return Err(SessionError::Configuration(format!(
                "SESSION_SECRET must be at least {} bytes, got {}",
                MIN_SECRET_LEN,
                secret.len()
            )));
        }
        if ttl_secs == 0 {
            return Err(SessionError::Configuration(
                "SESSION_TTL must be a positive number of seconds".to_string(),
            ));
        }
        if ttl_secs > MAX_SESSION_TTL {
            return Err(SessionError::Configuration(format!(
                "SESSION_TTL must be at most {} seconds, got {}",
                MAX_SESSION_TTL, ttl_secs
            )));
        }

        Ok(Self {
            secret: Zeroizing::new(secret.to_vec()),
            ttl_secs,
            max_create_attempts: DEFAULT_MAX_CREATE_ATTEMPTS,
            create_retry_backoff_ms: DEFAULT_CREATE_RETRY_BACKOFF_MS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        })
    }

    /// Load from `SESSION_*` environment variables.
    ///
    /// `SESSION_SECRET` is required; `SESSION_TTL` falls back to one week.
    pub fn from_env() -> Result<Self, SessionError> {
        let raw: RawSessionSettings = ConfigFile::builder()
            .add_source(Environment::with_prefix("SESSION"))
            .build()?
            .try_deserialize()?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSessionSettings) -> Result<Self, SessionError> {
        let secret = raw
            .secret
            .ok_or_else(|| SessionError::Configuration("SESSION_SECRET is required".to_string()))?;

        let mut settings = Self::new(secret, raw.ttl.unwrap_or(DEFAULT_SESSION_TTL))?;
        if let Some(attempts) = raw.max_create_attempts {
            settings = settings.with_max_create_attempts(attempts)?;
        }
        if let Some(backoff) = raw.create_retry_backoff_ms {
            settings.create_retry_backoff_ms = backoff;
        }
        if let Some(timeout) = raw.store_timeout_ms {
            settings.store_timeout_ms = timeout;
        }

        tracing::info!(
            "Session settings loaded: ttl={}s, max_create_attempts={}",
            settings.ttl_secs(),
            settings.max_create_attempts
        );
        Ok(settings)
    }

    pub fn with_max_create_attempts(mut self, attempts: u32) -> Result<Self, SessionError> {
        if attempts == 0 {
            return Err(SessionError::Configuration(
                "max_create_attempts must be at least 1".to_string(),
            ));
        }
        self.max_create_attempts = attempts;
        Ok(self)
    }

    pub fn with_create_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.create_retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_store_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.store_timeout_ms = timeout_ms;
        self
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }
}

// Keep the secret out of logs
impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("secret", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .field("max_create_attempts", &self.max_create_attempts)
            .field("create_retry_backoff_ms", &self.create_retry_backoff_ms)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .finish()
    }
}
