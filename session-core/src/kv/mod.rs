// session-core/src/kv/mod.rs
//! Minimal key-value surface the session store needs: TTL writes, deletes
//! and watch/conditional-commit transactions.

use async_trait::async_trait;

use crate::error::StoreError;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// A single write inside a conditional commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    SetEx { key: String, value: String, ttl_secs: u64 },
    Del { key: String },
}

impl WriteOp {
    pub fn set_ex(key: impl Into<String>, value: impl Into<String>, ttl_secs: u64) -> Self {
        Self::SetEx {
            key: key.into(),
            value: value.into(),
            ttl_secs,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }
}

/// Result of `WatchedTransaction::exec`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// All writes were applied atomically
    Committed,
    /// A watched key changed since `watch`; nothing was applied
    Aborted,
}

/// An open optimistic transaction over one watched key.
///
/// Dropping it without `exec` or `unwatch` releases the watch as well.
#[async_trait]
pub trait WatchedTransaction: Send {
    /// Read a key while the watch is held
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    /// Apply `ops` all-or-nothing, only if the watched key is unchanged
    async fn exec(self: Box<Self>, ops: Vec<WriteOp>) -> Result<CommitOutcome, StoreError>;

    async fn unwatch(self: Box<Self>) -> Result<(), StoreError>;
}

/// Backing store for session state.
///
/// One instance is created at startup and shared by every request.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Delete a key; deleting an absent key is not an error
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Start watching `key` for concurrent modification
    async fn watch(&self, key: &str) -> Result<Box<dyn WatchedTransaction>, StoreError>;

    /// Teardown hook for graceful shutdown
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
