//! Server-side session management: HKDF-derived keys, a signed-then-
//! encrypted session envelope, and a key-value backed session store with
//! optimistic concurrency per user.

pub mod config;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod kv;
pub mod models;
pub mod store;
pub mod utils;

pub use config::SessionSettings;
pub use envelope::EnvelopeCodec;
pub use error::{EnvelopeError, SessionError, StoreError};
pub use keys::SessionKeys;
pub use kv::{KeyValueStore, MemoryStore, RedisStore};
pub use models::session::{SessionInfoResponse, SessionRecord};
pub use store::SessionStore;
pub use utils::*;
