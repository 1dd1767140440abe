// session-core/src/kv/redis_store.rs
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Value};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use super::{CommitOutcome, KeyValueStore, WatchedTransaction, WriteOp};
use crate::error::StoreError;

/// Idle watch connections kept for reuse
const WATCH_POOL_SIZE: usize = 16;

/// Redis-backed store.
///
/// Connect once at startup with [`RedisStore::connect`] and share the
/// handle. Plain commands go through one multiplexed connection. WATCH
/// state is per connection, so each watched transaction takes a
/// connection of its own: an idle one from a small pool when available,
/// otherwise a fresh one (a TCP connect and handshake). Connections go
/// back to the pool only after a clean EXEC or UNWATCH.
///
/// [`close`](KeyValueStore::close) drops every connection; later calls
/// fail with [`StoreError::closed`].
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: Arc<RwLock<Option<MultiplexedConnection>>>,
    watch_pool: Arc<Mutex<Vec<MultiplexedConnection>>>,
    timeout: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = bounded(timeout, client.get_multiplexed_async_connection()).await?;

        tracing::info!("Connected to Redis session store");
        Ok(Self {
            client,
            conn: Arc::new(RwLock::new(Some(conn))),
            watch_pool: Arc::new(Mutex::new(Vec::with_capacity(WATCH_POOL_SIZE))),
            timeout,
        })
    }

    /// Handle on the shared connection, or an error once closed
    fn shared(&self) -> Result<MultiplexedConnection, StoreError> {
        self.conn
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(StoreError::closed)
    }

    fn is_closed(&self) -> bool {
        self.conn
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    async fn watch_connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.is_closed() {
            return Err(StoreError::closed());
        }
        if let Some(conn) = lock_pool(&self.watch_pool).pop() {
            return Ok(conn);
        }
        bounded(self.timeout, self.client.get_multiplexed_async_connection()).await
    }
}

fn lock_pool(pool: &Mutex<Vec<MultiplexedConnection>>) -> MutexGuard<'_, Vec<MultiplexedConnection>> {
    pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run a store call under the configured deadline
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout),
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.shared()?;
        bounded(self.timeout, redis::cmd("GET").arg(key).query_async(&mut conn)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.shared()?;
        bounded(
            self.timeout,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn),
        )
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.shared()?;
        let _removed: i64 = bounded(self.timeout, redis::cmd("DEL").arg(key).query_async(&mut conn)).await?;
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn WatchedTransaction>, StoreError> {
        let mut conn = self.watch_connection().await?;
        let () = bounded(self.timeout, redis::cmd("WATCH").arg(key).query_async(&mut conn)).await?;

        Ok(Box::new(RedisTransaction {
            conn,
            pool: self.watch_pool.clone(),
            shared: self.conn.clone(),
            timeout: self.timeout,
        }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        let shared = self
            .conn
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let pooled = std::mem::take(&mut *lock_pool(&self.watch_pool));

        if shared.is_some() {
            tracing::info!(idle_watch_connections = pooled.len(), "Closed Redis session store");
        }
        Ok(())
    }
}

struct RedisTransaction {
    conn: MultiplexedConnection,
    pool: Arc<Mutex<Vec<MultiplexedConnection>>>,
    shared: Arc<RwLock<Option<MultiplexedConnection>>>,
    timeout: Duration,
}

impl RedisTransaction {
    // Only called after the watch has been cleared
    fn release(self: Box<Self>) {
        let RedisTransaction { conn, pool, shared, .. } = *self;
        // Checked under the pool lock so close() cannot miss this connection
        let mut idle = lock_pool(&pool);
        let open = shared
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some();
        if !open {
            return;
        }
        if idle.len() < WATCH_POOL_SIZE {
            idle.push(conn);
        }
    }
}

#[async_trait]
impl WatchedTransaction for RedisTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        bounded(self.timeout, redis::cmd("GET").arg(key).query_async(&mut self.conn)).await
    }

    async fn exec(mut self: Box<Self>, ops: Vec<WriteOp>) -> Result<CommitOutcome, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                WriteOp::SetEx { key, value, ttl_secs } => {
                    pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(*ttl_secs);
                }
                WriteOp::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
            }
        }

        // EXEC replies nil when a watched key changed; either way the watch is gone
        let reply: Option<Vec<Value>> = bounded(self.timeout, pipe.query_async(&mut self.conn)).await?;
        self.release();
        Ok(match reply {
            Some(_) => CommitOutcome::Committed,
            None => CommitOutcome::Aborted,
        })
    }

    async fn unwatch(mut self: Box<Self>) -> Result<(), StoreError> {
        let () = bounded(self.timeout, redis::cmd("UNWATCH").query_async(&mut self.conn)).await?;
        self.release();
        Ok(())
    }
}
