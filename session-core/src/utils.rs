// session-core/src/utils.rs
use rand::{thread_rng, RngCore};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Random bytes behind each session id
const SESSION_ID_BYTES: usize = 32;
/// Length of an encoded session id (32 bytes, base64url without padding)
pub const SESSION_ID_LEN: usize = 43;

/// Setup tracing for consistent logging across services.
///
/// Defaults to INFO; `RUST_LOG` overrides.
pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Tracing subscriber already installed: {}", e);
    }
}

/// Generate a fresh, unpredictable session id
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    thread_rng().fill_bytes(&mut bytes);
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

/// Whether `sid` could have come from [`generate_session_id`]
pub fn is_well_formed_session_id(sid: &str) -> bool {
    sid.len() == SESSION_ID_LEN
        && sid
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Short prefix of a session id, safe to log
pub fn sid_prefix(sid: &str) -> &str {
    sid.get(..8).unwrap_or(sid)
}
