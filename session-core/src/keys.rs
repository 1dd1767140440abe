// session-core/src/keys.rs
//! Splits the configured master secret into independent signing and
//! encryption keys with HKDF-SHA256.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::SessionSettings;
use crate::error::KeyDerivationError;

/// Domain separation labels, (salt, info) per key
const SIGNING_SALT: &[u8] = b"session-core/v1/salt/session-signing";
const SIGNING_INFO: &[u8] = b"session signing key";
const ENCRYPTION_SALT: &[u8] = b"session-core/v1/salt/session-encryption";
const ENCRYPTION_INFO: &[u8] = b"session encryption key";

pub const KEY_LEN: usize = 32;

/// HMAC-SHA256 key for the session JWS
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SigningKey([u8; KEY_LEN]);

impl SigningKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// AES-256-GCM key for the session JWE
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Both derived keys. Derive once per process and share.
pub struct SessionKeys {
    pub signing: SigningKey,
    pub encryption: EncryptionKey,
}

impl SessionKeys {
    pub fn derive(master_secret: &[u8]) -> Result<Self, KeyDerivationError> {
        Ok(Self {
            signing: SigningKey(hkdf32(master_secret, SIGNING_SALT, SIGNING_INFO)?),
            encryption: EncryptionKey(hkdf32(master_secret, ENCRYPTION_SALT, ENCRYPTION_INFO)?),
        })
    }

    pub fn from_settings(settings: &SessionSettings) -> Result<Self, KeyDerivationError> {
        Self::derive(settings.secret())
    }
}

fn hkdf32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], KeyDerivationError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; KEY_LEN];
    hk.expand(info, &mut out).map_err(|_| KeyDerivationError)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn derivation_is_deterministic() {
        let a = SessionKeys::derive(SECRET).unwrap();
        let b = SessionKeys::derive(SECRET).unwrap();

        assert_eq!(a.signing.as_bytes(), b.signing.as_bytes());
        assert_eq!(a.encryption.as_bytes(), b.encryption.as_bytes());
    }

    #[test]
    fn signing_and_encryption_keys_differ() {
        let keys = SessionKeys::derive(SECRET).unwrap();
        assert_ne!(keys.signing.as_bytes(), keys.encryption.as_bytes());
        assert_ne!(keys.signing.as_bytes(), &[0u8; KEY_LEN]);
    }

    #[test]
    fn different_secrets_give_different_keys() {
        let a = SessionKeys::derive(SECRET).unwrap();
        let b = SessionKeys::derive(b"fedcba9876543210fedcba9876543210").unwrap();

        assert_ne!(a.signing.as_bytes(), b.signing.as_bytes());
        assert_ne!(a.encryption.as_bytes(), b.encryption.as_bytes());
    }

    #[test]
    fn keys_are_not_the_raw_secret() {
        let keys = SessionKeys::derive(SECRET).unwrap();
        assert_ne!(&keys.signing.as_bytes()[..], SECRET);
        assert_ne!(&keys.encryption.as_bytes()[..], SECRET);
    }
}
