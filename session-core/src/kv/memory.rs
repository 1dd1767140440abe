// session-core/src/kv/memory.rs
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::{CommitOutcome, KeyValueStore, WatchedTransaction, WriteOp};
use crate::error::StoreError;

/// One key's state. Deleted keys keep a tombstone so their version
/// keeps moving forward.
#[derive(Debug, Clone)]
struct Slot {
    value: Option<String>,
    expires_at: Option<Instant>,
    version: u64,
}

impl Slot {
    fn live_value(&self, now: Instant) -> Option<&String> {
        match self.expires_at {
            Some(at) if at <= now => None,
            _ => self.value.as_ref(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: DashMap<String, Slot>,
    // Serializes writers so a commit's version check and its writes are atomic
    commit_lock: Mutex<()>,
    next_version: AtomicU64,
    // Version reported for keys with no slot; raised whenever slots are purged
    purged_floor: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn version_of(&self, key: &str) -> u64 {
        self.slots
            .get(key)
            .map(|slot| slot.version)
            .unwrap_or_else(|| self.purged_floor.load(Ordering::SeqCst))
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::closed());
        }
        Ok(())
    }

    fn read(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.slots
            .get(key)
            .and_then(|slot| slot.live_value(now).cloned())
    }

    // Caller must hold commit_lock
    fn apply(&self, op: WriteOp) {
        let version = self.bump();
        match op {
            WriteOp::SetEx { key, value, ttl_secs } => {
                self.slots.insert(
                    key,
                    Slot {
                        value: Some(value),
                        // An expiry past Instant's range never arrives
                        expires_at: Instant::now().checked_add(Duration::from_secs(ttl_secs)),
                        version,
                    },
                );
            }
            WriteOp::Del { key } => {
                self.slots.insert(
                    key,
                    Slot {
                        value: None,
                        expires_at: None,
                        version,
                    },
                );
            }
        }
    }
}

/// In-process store with the same watch/commit semantics as Redis.
///
/// Used for development and tests. Expired keys read as absent and are
/// purged by [`purge_expired`](Self::purge_expired) or the reaper task.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys starting with `prefix`, sorted
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .slots
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().live_value(now).is_some())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Overwrite a key's value without touching its TTL; test helper for
    /// simulating corrupted data.
    pub fn overwrite(&self, key: &str, value: &str) {
        let _guard = self.inner.lock();
        let version = self.inner.bump();
        if let Some(mut slot) = self.inner.slots.get_mut(key) {
            slot.value = Some(value.to_string());
            slot.version = version;
        }
    }

    /// Remove expired keys and tombstones, returning how many live-looking
    /// entries had expired
    pub fn purge_expired(&self) -> usize {
        let _guard = self.inner.lock();
        let now = Instant::now();
        let mut expired_count = 0;
        let mut removed = 0;

        self.inner.slots.retain(|_, slot| {
            if slot.value.is_none() {
                removed += 1;
                return false;
            }
            if slot.live_value(now).is_none() {
                expired_count += 1;
                removed += 1;
                return false;
            }
            true
        });
        if removed > 0 {
            self.inner
                .purged_floor
                .store(self.inner.next_version.load(Ordering::SeqCst), Ordering::SeqCst);
        }

        expired_count
    }

    /// Periodically purge expired keys until the store is closed or the
    /// returned task is aborted
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if store.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let expired_count = store.purge_expired();
                if expired_count > 0 {
                    tracing::info!("Purged {} expired keys from memory store", expired_count);
                }
            }
        })
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.ensure_open()?;
        Ok(self.inner.read(key))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.inner.ensure_open()?;
        let _guard = self.inner.lock();
        self.inner.apply(WriteOp::set_ex(key, value, ttl_secs));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.ensure_open()?;
        let _guard = self.inner.lock();
        if self.inner.slots.contains_key(key) {
            self.inner.apply(WriteOp::del(key));
        }
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn WatchedTransaction>, StoreError> {
        self.inner.ensure_open()?;
        let version = {
            let _guard = self.inner.lock();
            self.inner.version_of(key)
        };

        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            key: key.to_string(),
            version,
        }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Closed memory session store");
        }
        Ok(())
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    key: String,
    version: u64,
}

#[async_trait]
impl WatchedTransaction for MemoryTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.ensure_open()?;
        Ok(self.inner.read(key))
    }

    async fn exec(self: Box<Self>, ops: Vec<WriteOp>) -> Result<CommitOutcome, StoreError> {
        self.inner.ensure_open()?;
        let _guard = self.inner.lock();
        if self.inner.version_of(&self.key) != self.version {
            return Ok(CommitOutcome::Aborted);
        }
        for op in ops {
            self.inner.apply(op);
        }
        Ok(CommitOutcome::Committed)
    }

    async fn unwatch(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
