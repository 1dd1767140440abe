// session-core/src/store.rs
//! Session lifecycle over the key-value store.
//!
//! Key layout:
//! - `session:<sid>` → compact JWE of the signed record, TTL = session TTL
//! - `user:<subject>` → the subject's current sid, TTL = session TTL
//!
//! This is the only writer of both key families.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionSettings;
use crate::envelope::EnvelopeCodec;
use crate::error::SessionError;
use crate::keys::SessionKeys;
use crate::kv::{CommitOutcome, KeyValueStore, WriteOp};
use crate::models::session::SessionRecord;
use crate::utils::{generate_session_id, is_well_formed_session_id, sid_prefix};

const SESSION_PREFIX: &str = "session:";
const USER_PREFIX: &str = "user:";

pub fn session_key(sid: &str) -> String {
    format!("{}{}", SESSION_PREFIX, sid)
}

pub fn user_key(subject: &str) -> String {
    format!("{}{}", USER_PREFIX, subject)
}

/// Creates, reads, rotates and destroys sessions.
///
/// Cheap to clone; clones share the store handle and the derived keys.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    codec: Arc<EnvelopeCodec>,
    ttl_secs: u64,
    max_create_attempts: u32,
    retry_backoff_ms: u64,
}

impl SessionStore {
    /// Derive the session keys once and bind them to `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>, settings: &SessionSettings) -> Result<Self, SessionError> {
        let keys = SessionKeys::from_settings(settings)?;

        Ok(Self {
            kv,
            codec: Arc::new(EnvelopeCodec::new(&keys, settings.ttl_secs())),
            ttl_secs: settings.ttl_secs(),
            max_create_attempts: settings.max_create_attempts,
            retry_backoff_ms: settings.create_retry_backoff_ms,
        })
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Store `record` under a new sid and make it the subject's current
    /// session, deleting the previously current one.
    ///
    /// Fails with [`SessionError::CreateConflict`] if the subject's index
    /// kept changing under us for every attempt.
    pub async fn create(&self, record: &SessionRecord) -> Result<String, SessionError> {
        let sid = generate_session_id();
        let envelope = self.codec.seal(record)?;
        let index_key = user_key(&record.subject);

        for attempt in 1..=self.max_create_attempts {
            let mut txn = self.kv.watch(&index_key).await?;

            let previous = match txn.get(&index_key).await {
                Ok(previous) => previous,
                Err(e) => {
                    if let Err(unwatch_err) = txn.unwatch().await {
                        tracing::debug!("UNWATCH after failed read also failed: {}", unwatch_err);
                    }
                    return Err(e.into());
                }
            };

            let mut ops = vec![
                WriteOp::set_ex(index_key.clone(), sid.clone(), self.ttl_secs),
                WriteOp::set_ex(session_key(&sid), envelope.clone(), self.ttl_secs),
            ];
            if let Some(previous) = previous.as_deref().filter(|prev| *prev != sid) {
                ops.push(WriteOp::del(session_key(previous)));
            }

            match txn.exec(ops).await? {
                CommitOutcome::Committed => {
                    tracing::info!(
                        subject = %record.subject,
                        sid = %sid_prefix(&sid),
                        attempt,
                        replaced = previous.is_some(),
                        "Session created"
                    );
                    return Ok(sid);
                }
                CommitOutcome::Aborted => {
                    tracing::debug!(
                        subject = %record.subject,
                        attempt,
                        "Concurrent session change detected, retrying"
                    );
                    if attempt < self.max_create_attempts {
                        self.backoff(attempt).await;
                    }
                }
            }
        }

        tracing::warn!(
            subject = %record.subject,
            attempts = self.max_create_attempts,
            "Session create gave up after repeated conflicts"
        );
        Err(SessionError::CreateConflict {
            attempts: self.max_create_attempts,
        })
    }

    /// Look up a session. Unknown, expired and corrupted sessions all read
    /// as `None`; corrupted ones are deleted on the way.
    pub async fn get(&self, sid: &str) -> Result<Option<SessionRecord>, SessionError> {
        if !is_well_formed_session_id(sid) {
            return Ok(None);
        }

        let key = session_key(sid);
        let Some(envelope) = self.kv.get(&key).await? else {
            return Ok(None);
        };

        match self.codec.open(&envelope) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(sid = %sid_prefix(sid), error = %e, "Removing corrupted session");
                if let Err(del_err) = self.kv.del(&key).await {
                    tracing::warn!(sid = %sid_prefix(sid), error = %del_err, "Failed to remove corrupted session");
                }
                Ok(None)
            }
        }
    }

    /// Delete a session and, if it is still the subject's current one, the
    /// subject's index entry. Destroying an absent session succeeds.
    pub async fn destroy(&self, sid: &str) -> Result<(), SessionError> {
        self.take(sid).await.map(|_| ())
    }

    /// [`destroy`](Self::destroy), handing back the record the session held
    /// if it could still be read.
    pub async fn take(&self, sid: &str) -> Result<Option<SessionRecord>, SessionError> {
        if !is_well_formed_session_id(sid) {
            return Ok(None);
        }

        // A failed read must not stop the delete
        let record = match self.get(sid).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(sid = %sid_prefix(sid), error = %e, "Could not read session before destroy");
                None
            }
        };

        self.kv.del(&session_key(sid)).await?;

        if let Some(record) = &record {
            self.release_index(&record.subject, sid).await?;
        }

        tracing::info!(sid = %sid_prefix(sid), "Session destroyed");
        Ok(record)
    }

    /// Replace `old_sid` with a new session for `new_record`.
    pub async fn rotate(&self, old_sid: &str, new_record: &SessionRecord) -> Result<String, SessionError> {
        let new_sid = self.create(new_record).await?;

        if old_sid != new_sid && is_well_formed_session_id(old_sid) {
            // Usually already removed by create(); the TTL covers a failure here
            if let Err(e) = self.kv.del(&session_key(old_sid)).await {
                tracing::warn!(sid = %sid_prefix(old_sid), error = %e, "Failed to delete rotated session");
            }
        }

        Ok(new_sid)
    }

    /// Shut down the backing store connection
    pub async fn close(&self) -> Result<(), SessionError> {
        self.kv.close().await?;
        Ok(())
    }

    /// Remove `user:<subject>` only while it still points at `sid`
    async fn release_index(&self, subject: &str, sid: &str) -> Result<(), SessionError> {
        let index_key = user_key(subject);
        let mut txn = self.kv.watch(&index_key).await?;

        let current = match txn.get(&index_key).await {
            Ok(current) => current,
            Err(e) => {
                if let Err(unwatch_err) = txn.unwatch().await {
                    tracing::debug!("UNWATCH after failed read also failed: {}", unwatch_err);
                }
                return Err(e.into());
            }
        };

        if current.as_deref() != Some(sid) {
            txn.unwatch().await?;
            return Ok(());
        }

        if txn.exec(vec![WriteOp::del(index_key)]).await? == CommitOutcome::Aborted {
            tracing::debug!(subject = %subject, "Index changed during destroy, leaving newer session in place");
        }
        Ok(())
    }

    async fn backoff(&self, attempt: u32) {
        if self.retry_backoff_ms == 0 {
            return;
        }
        let base = self.retry_backoff_ms * attempt as u64;
        let jitter = rand::thread_rng().gen_range(0..=base);
        tokio::time::sleep(Duration::from_millis(base / 2 + jitter)).await;
    }
}
