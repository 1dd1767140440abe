// session-core/src/envelope.rs
//! Signed-then-encrypted serialization of a [`SessionRecord`].
//!
//! The record travels as a compact JWS (HS256) carrying `iat`/`exp`, and
//! the JWS is wrapped in a compact JWE using direct key agreement
//! (`"alg":"dir"`) with AES-256-GCM content encryption:
//!
//! ```text
//! BASE64URL(header) . "" . BASE64URL(iv) . BASE64URL(ciphertext) . BASE64URL(tag)
//! ```
//!
//! Reading always decrypts first and verifies second.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;
use crate::keys::SessionKeys;
use crate::models::session::SessionRecord;

const JWE_ALG: &str = "dir";
const JWE_ENC: &str = "A256GCM";
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// JWS claims: the record plus issue and expiry times (seconds)
#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    #[serde(flatten)]
    record: SessionRecord,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cty: Option<String>,
}

/// Sign/verify and encrypt/decrypt primitives over the derived keys.
pub struct EnvelopeCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    cipher: Aes256Gcm,
    protected_header: String,
    ttl_secs: u64,
}

impl EnvelopeCodec {
    pub fn new(keys: &SessionKeys, ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let header = JweHeader {
            alg: JWE_ALG.to_string(),
            enc: JWE_ENC.to_string(),
            cty: Some("JWT".to_string()),
        };
        // Serializing a struct of plain strings cannot fail
        let header_json = serde_json::to_vec(&header).unwrap_or_default();

        Self {
            encoding_key: EncodingKey::from_secret(keys.signing.as_bytes()),
            decoding_key: DecodingKey::from_secret(keys.signing.as_bytes()),
            validation,
            cipher: Aes256Gcm::new(keys.encryption.as_bytes().into()),
            protected_header: b64_encode(&header_json),
            ttl_secs,
        }
    }

    /// Sign the record as an HS256 JWS expiring one session TTL from now.
    pub fn sign(&self, record: &SessionRecord) -> Result<String, EnvelopeError> {
        self.sign_at(record, Utc::now().timestamp())
    }

    pub(crate) fn sign_at(&self, record: &SessionRecord, issued_at: i64) -> Result<String, EnvelopeError> {
        let exp = i64::try_from(self.ttl_secs)
            .ok()
            .and_then(|ttl| issued_at.checked_add(ttl))
            .ok_or_else(|| EnvelopeError::Encoding(format!("session ttl {}s out of range", self.ttl_secs)))?;
        let claims = SessionClaims {
            record: record.clone(),
            iat: issued_at,
            exp,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| EnvelopeError::Encoding(e.to_string()))
    }

    /// Verify signature and expiry, returning the embedded record.
    pub fn verify(&self, token: &str) -> Result<SessionRecord, EnvelopeError> {
        decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.record)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => EnvelopeError::Expired,
                _ => EnvelopeError::InvalidSignature,
            })
    }

    /// Wrap a signed token in a compact `dir`/`A256GCM` JWE.
    pub fn encrypt(&self, signed_token: &str) -> Result<String, EnvelopeError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: signed_token.as_bytes(),
                    aad: self.protected_header.as_bytes(),
                },
            )
            .map_err(|_| EnvelopeError::Encoding("content encryption failed".to_string()))?;

        // aes-gcm appends the tag to the ciphertext
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}..{}.{}.{}",
            self.protected_header,
            b64_encode(&iv),
            b64_encode(&sealed),
            b64_encode(&tag)
        ))
    }

    /// Reverse [`encrypt`](Self::encrypt). Any malformed segment, wrong key
    /// or tag mismatch yields [`EnvelopeError::DecryptionFailed`].
    pub fn decrypt(&self, envelope: &str) -> Result<String, EnvelopeError> {
        let parts: Vec<&str> = envelope.split('.').collect();
        let [header, encrypted_key, iv, ciphertext, tag] = parts.as_slice() else {
            return Err(EnvelopeError::DecryptionFailed);
        };
        if !encrypted_key.is_empty() {
            return Err(EnvelopeError::DecryptionFailed);
        }

        let header: JweHeader = serde_json::from_slice(&b64_decode(header)?)
            .map_err(|_| EnvelopeError::DecryptionFailed)?;
        if header.alg != JWE_ALG || header.enc != JWE_ENC {
            return Err(EnvelopeError::DecryptionFailed);
        }

        let iv = b64_decode(iv)?;
        let tag = b64_decode(tag)?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(EnvelopeError::DecryptionFailed);
        }
        let mut sealed = b64_decode(ciphertext)?;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &sealed,
                    aad: parts[0].as_bytes(),
                },
            )
            .map_err(|_| EnvelopeError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| EnvelopeError::DecryptionFailed)
    }

    /// `encrypt(sign(record))`, the form persisted in the store
    pub fn seal(&self, record: &SessionRecord) -> Result<String, EnvelopeError> {
        self.encrypt(&self.sign(record)?)
    }

    /// `verify(decrypt(envelope))`
    pub fn open(&self, envelope: &str) -> Result<SessionRecord, EnvelopeError> {
        self.verify(&self.decrypt(envelope)?)
    }
}

fn b64_encode(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

fn b64_decode(segment: &str) -> Result<Vec<u8>, EnvelopeError> {
    let bytes = base64::decode_config(segment, base64::URL_SAFE_NO_PAD)
        .map_err(|_| EnvelopeError::DecryptionFailed)?;
    // Canonical encodings only: every character must map to authenticated bytes
    if b64_encode(&bytes) != segment {
        return Err(EnvelopeError::DecryptionFailed);
    }
    Ok(bytes)
}
