// session-core/tests/session_store_test.rs
use async_trait::async_trait;
use chrono::Utc;
use session_core::error::StoreError;
use session_core::kv::{CommitOutcome, KeyValueStore, MemoryStore, WatchedTransaction, WriteOp};
use session_core::store::{session_key, user_key};
use session_core::{generate_session_id, SessionError, SessionRecord, SessionSettings, SessionStore};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "test-secret-test-secret-test-secret";

fn settings(ttl_secs: u64) -> SessionSettings {
    SessionSettings::new(SECRET, ttl_secs).unwrap()
}

fn setup() -> (MemoryStore, SessionStore) {
    let kv = MemoryStore::new();
    let store = SessionStore::new(Arc::new(kv.clone()), &settings(3600)).unwrap();
    (kv, store)
}

fn record(subject: &str, access_token: &str) -> SessionRecord {
    SessionRecord::new(subject, "alice", access_token, Utc::now().timestamp_millis() + 3_600_000)
}

/// Every watched commit is reported as conflicting.
struct AlwaysConflictStore {
    inner: MemoryStore,
    watches: Arc<AtomicU32>,
}

struct ConflictingTransaction;

#[async_trait]
impl WatchedTransaction for ConflictingTransaction {
    async fn get(&mut self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn exec(self: Box<Self>, _ops: Vec<WriteOp>) -> Result<CommitOutcome, StoreError> {
        Ok(CommitOutcome::Aborted)
    }

    async fn unwatch(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for AlwaysConflictStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.inner.set_ex(key, value, ttl_secs).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.del(key).await
    }

    async fn watch(&self, _key: &str) -> Result<Box<dyn WatchedTransaction>, StoreError> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ConflictingTransaction))
    }
}

/// Every call fails at the transport level.
struct UnavailableStore;

#[async_trait]
impl KeyValueStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn del(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn watch(&self, _key: &str) -> Result<Box<dyn WatchedTransaction>, StoreError> {
        Err(StoreError::Timeout)
    }
}

/// Plain deletes fail; transactions go through.
struct FailingDeleteStore {
    inner: MemoryStore,
}

#[async_trait]
impl KeyValueStore for FailingDeleteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.inner.set_ex(key, value, ttl_secs).await
    }

    async fn del(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Timeout)
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn WatchedTransaction>, StoreError> {
        self.inner.watch(key).await
    }
}

/// Plain reads fail; deletes and transactions go through.
struct FailingReadStore {
    inner: MemoryStore,
}

#[async_trait]
impl KeyValueStore for FailingReadStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("read replica down".into()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.inner.set_ex(key, value, ttl_secs).await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.del(key).await
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn WatchedTransaction>, StoreError> {
        self.inner.watch(key).await
    }
}

#[tokio::test]
async fn create_then_get_returns_record_and_indexes_subject() {
    let (kv, store) = setup();
    let r1 = record("u1", "a");

    let s1 = store.create(&r1).await.unwrap();

    assert_eq!(store.get(&s1).await.unwrap(), Some(r1));
    assert_eq!(kv.get(&user_key("u1")).await.unwrap(), Some(s1));
}

#[tokio::test]
async fn second_create_replaces_previous_session() {
    let (kv, store) = setup();
    let s1 = store.create(&record("u1", "a")).await.unwrap();
    let r2 = record("u1", "b");

    let s2 = store.create(&r2).await.unwrap();

    assert_ne!(s1, s2);
    assert_eq!(store.get(&s1).await.unwrap(), None);
    assert_eq!(store.get(&s2).await.unwrap(), Some(r2));
    assert_eq!(kv.get(&user_key("u1")).await.unwrap(), Some(s2.clone()));
    assert_eq!(kv.keys_with_prefix("session:"), vec![session_key(&s2)]);
}

#[tokio::test]
async fn destroy_removes_session_and_index() {
    let (kv, store) = setup();
    let sid = store.create(&record("u1", "a")).await.unwrap();

    store.destroy(&sid).await.unwrap();

    assert_eq!(store.get(&sid).await.unwrap(), None);
    assert_eq!(kv.get(&user_key("u1")).await.unwrap(), None);
    assert!(kv.keys_with_prefix("").is_empty());
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let (_kv, store) = setup();
    let sid = store.create(&record("u1", "a")).await.unwrap();

    store.destroy(&sid).await.unwrap();
    store.destroy(&sid).await.unwrap();
    store.destroy(&generate_session_id()).await.unwrap();
    store.destroy("not-a-session-id").await.unwrap();
}

#[tokio::test]
async fn destroy_still_deletes_when_read_fails() {
    let inner = MemoryStore::new();
    let store = SessionStore::new(
        Arc::new(FailingReadStore { inner: inner.clone() }),
        &settings(3600),
    )
    .unwrap();
    let sid = store.create(&record("u1", "a")).await.unwrap();
    assert_eq!(inner.keys_with_prefix("session:"), vec![session_key(&sid)]);

    store.destroy(&sid).await.unwrap();

    assert!(inner.keys_with_prefix("session:").is_empty());
    // Subject unknown, so the index is left to its TTL
    assert_eq!(inner.get(&user_key("u1")).await.unwrap(), Some(sid));
}

#[tokio::test]
async fn take_returns_destroyed_record() {
    let (kv, store) = setup();
    let r1 = record("u1", "a").with_id_token(Some("id-a".into()));
    let sid = store.create(&r1).await.unwrap();

    assert_eq!(store.take(&sid).await.unwrap(), Some(r1));
    assert!(kv.keys_with_prefix("").is_empty());
    assert_eq!(store.take(&sid).await.unwrap(), None);
}

#[tokio::test]
async fn close_fails_later_calls() {
    let (_kv, store) = setup();
    let sid = store.create(&record("u1", "a")).await.unwrap();

    store.close().await.unwrap();

    assert!(matches!(store.get(&sid).await, Err(SessionError::StoreUnavailable(_))));
    assert!(matches!(
        store.create(&record("u2", "b")).await,
        Err(SessionError::StoreUnavailable(_))
    ));
}

#[tokio::test]
async fn destroy_keeps_index_owned_by_newer_session() {
    let (kv, store) = setup();
    let sid = store.create(&record("u1", "a")).await.unwrap();
    let newer = generate_session_id();
    kv.set_ex(&user_key("u1"), &newer, 3600).await.unwrap();

    store.destroy(&sid).await.unwrap();

    assert_eq!(kv.get(&session_key(&sid)).await.unwrap(), None);
    assert_eq!(kv.get(&user_key("u1")).await.unwrap(), Some(newer));
}

#[tokio::test]
async fn corrupted_session_reads_as_absent_and_is_removed() {
    let (kv, store) = setup();
    let sid = store.create(&record("u1", "a")).await.unwrap();
    let key = session_key(&sid);
    let envelope = kv.get(&key).await.unwrap().unwrap();

    kv.overwrite(&key, &envelope[..envelope.len() - 10]);

    assert_eq!(store.get(&sid).await.unwrap(), None);
    assert_eq!(kv.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn envelope_under_another_secret_is_treated_as_corrupted() {
    let kv = MemoryStore::new();
    let writer = SessionStore::new(Arc::new(kv.clone()), &settings(3600)).unwrap();
    let other = SessionSettings::new("another-secret-another-secret-1234", 3600).unwrap();
    let reader = SessionStore::new(Arc::new(kv.clone()), &other).unwrap();

    let sid = writer.create(&record("u1", "a")).await.unwrap();

    assert_eq!(reader.get(&sid).await.unwrap(), None);
    assert_eq!(kv.get(&session_key(&sid)).await.unwrap(), None);
}

#[tokio::test]
async fn rotate_issues_new_sid_for_same_subject() {
    let (kv, store) = setup();
    let old_sid = store.create(&record("u1", "a")).await.unwrap();
    let before = store.get(&old_sid).await.unwrap().unwrap();
    let replacement = record("u1", "refreshed").with_refresh_token(Some("r2".into()));

    let new_sid = store.rotate(&old_sid, &replacement).await.unwrap();

    assert_ne!(new_sid, old_sid);
    assert_eq!(store.get(&old_sid).await.unwrap(), None);
    let after = store.get(&new_sid).await.unwrap().unwrap();
    assert_eq!(after, replacement);
    assert_eq!(after.subject, before.subject);
    assert_eq!(kv.get(&user_key("u1")).await.unwrap(), Some(new_sid));
}

#[tokio::test]
async fn rotate_tolerates_failed_cleanup_delete() {
    let kv = MemoryStore::new();
    let store = SessionStore::new(Arc::new(FailingDeleteStore { inner: kv.clone() }), &settings(3600)).unwrap();
    let old_sid = store.create(&record("u1", "a")).await.unwrap();

    let new_sid = store.rotate(&old_sid, &record("u1", "b")).await.unwrap();

    assert_ne!(new_sid, old_sid);
    assert_eq!(store.get(&new_sid).await.unwrap().unwrap().access_token, "b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_leave_exactly_one_session_per_subject() {
    let kv = MemoryStore::new();
    let settings = settings(3600).with_max_create_attempts(64).unwrap();
    let store = SessionStore::new(Arc::new(kv.clone()), &settings).unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.create(&record("u1", &format!("token-{}", i))).await })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;
    for result in results {
        result.unwrap().unwrap();
    }

    let current = kv.get(&user_key("u1")).await.unwrap().unwrap();
    assert_eq!(kv.keys_with_prefix("session:"), vec![session_key(&current)]);
    assert_eq!(store.get(&current).await.unwrap().unwrap().subject, "u1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_for_different_subjects_do_not_interfere() {
    let kv = MemoryStore::new();
    let store = SessionStore::new(Arc::new(kv.clone()), &settings(3600)).unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.create(&record(&format!("user-{}", i), "a")).await })
        })
        .collect();

    let sids: Vec<String> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(kv.keys_with_prefix("session:").len(), 8);
    for (i, sid) in sids.iter().enumerate() {
        assert_eq!(kv.get(&user_key(&format!("user-{}", i))).await.unwrap().as_ref(), Some(sid));
    }
}

#[tokio::test]
async fn exhausted_retries_surface_create_conflict() {
    let watches = Arc::new(AtomicU32::new(0));
    let kv = AlwaysConflictStore {
        inner: MemoryStore::new(),
        watches: watches.clone(),
    };
    let inner = kv.inner.clone();
    let settings = settings(3600)
        .with_max_create_attempts(3)
        .unwrap()
        .with_create_retry_backoff_ms(1);
    let store = SessionStore::new(Arc::new(kv), &settings).unwrap();

    let err = store.create(&record("u1", "a")).await.unwrap_err();

    assert!(matches!(err, SessionError::CreateConflict { attempts: 3 }));
    assert_eq!(watches.load(Ordering::SeqCst), 3);
    assert!(inner.keys_with_prefix("").is_empty());
}

#[tokio::test]
async fn transport_failures_propagate() {
    let store = SessionStore::new(Arc::new(UnavailableStore), &settings(3600)).unwrap();
    let sid = generate_session_id();

    assert!(matches!(
        store.create(&record("u1", "a")).await,
        Err(SessionError::StoreUnavailable(StoreError::Timeout))
    ));
    assert!(matches!(store.get(&sid).await, Err(SessionError::StoreUnavailable(_))));
    assert!(matches!(store.destroy(&sid).await, Err(SessionError::StoreUnavailable(_))));
}

#[tokio::test]
async fn malformed_sid_is_absent_without_store_access() {
    let store = SessionStore::new(Arc::new(UnavailableStore), &settings(3600)).unwrap();
    assert_eq!(store.get("../../etc").await.unwrap(), None);
    assert_eq!(store.get("").await.unwrap(), None);
}

#[tokio::test]
async fn store_ttl_expires_session() {
    let kv = MemoryStore::new();
    let store = SessionStore::new(Arc::new(kv.clone()), &settings(1)).unwrap();
    let sid = store.create(&record("u1", "a")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert_eq!(store.get(&sid).await.unwrap(), None);
    assert_eq!(kv.get(&user_key("u1")).await.unwrap(), None);
}

#[tokio::test]
async fn embedded_expiry_is_enforced_even_if_store_ttl_remains() {
    let kv = MemoryStore::new();
    let store = SessionStore::new(Arc::new(kv.clone()), &settings(1)).unwrap();
    let sid = store.create(&record("u1", "a")).await.unwrap();
    let key = session_key(&sid);

    // Keep the key alive in the store well past the token's own expiry
    let envelope = kv.get(&key).await.unwrap().unwrap();
    kv.set_ex(&key, &envelope, 3600).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert_eq!(store.get(&sid).await.unwrap(), None);
    assert_eq!(kv.get(&key).await.unwrap(), None);
}
