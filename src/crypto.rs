//! Token encryption for OAuth credentials at rest.
//!
//! Tokens are sealed with AES-256-GCM using a 16-byte IV and stored as a
//! colon-delimited triple of hex segments: `iv:tag:ciphertext`. The key is
//! read from configuration lazily, so a missing `ENCRYPTION_KEY` only fails
//! the operations that actually need it.

use std::sync::{Arc, OnceLock};

use aes_gcm::{
    AesGcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, consts::U16},
    aes::Aes256,
};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// AES-256-GCM with a 128-bit IV.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Default grace window applied by [`is_token_expired`].
pub const DEFAULT_EXPIRY_BUFFER_MINUTES: i64 = 5;

/// Crypto error types
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ENCRYPTION_KEY is not configured")]
    MissingKey,
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("invalid encrypted token format")]
    InvalidFormat,
    #[error("invalid IV length: expected {IV_LEN} bytes, got {0}")]
    InvalidIv(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: authentication tag mismatch")]
    Decrypt,
    #[error("decrypted token is not valid UTF-8")]
    Utf8,
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

impl CryptoKey {
    /// Create a new crypto key from raw bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(CryptoKey(bytes))
    }

    /// Parse a hex-encoded 32-byte key
    pub fn from_hex(value: &str) -> Result<Self, CryptoError> {
        let bytes =
            hex::decode(value.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypt `plaintext` into an `iv:tag:ciphertext` hex bundle.
pub fn encrypt_token(key: &CryptoKey, plaintext: &str) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key.as_bytes()));
    let iv = Aes256Gcm16::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&iv, plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    // aes-gcm appends the tag to the ciphertext
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(format!(
        "{}:{}:{}",
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(ciphertext)
    ))
}

/// Decrypt an `iv:tag:ciphertext` hex bundle produced by [`encrypt_token`].
pub fn decrypt_token(key: &CryptoKey, bundle: &str) -> Result<String, CryptoError> {
    let segments: Vec<&str> = bundle.split(':').collect();
    let [iv_hex, tag_hex, ct_hex] = segments.as_slice() else {
        return Err(CryptoError::InvalidFormat);
    };

    let iv = hex::decode(iv_hex).map_err(|_| CryptoError::InvalidFormat)?;
    let tag = hex::decode(tag_hex).map_err(|_| CryptoError::InvalidFormat)?;
    let ciphertext = hex::decode(ct_hex).map_err(|_| CryptoError::InvalidFormat)?;

    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidIv(iv.len()));
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&ciphertext);
    sealed.extend_from_slice(&tag);

    let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::<U16>::from_slice(&iv), sealed.as_slice())
        .map_err(|_| CryptoError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

/// Returns true when `expires_at` falls within `buffer_minutes` of now.
///
/// A missing expiry means the token never expires.
pub fn is_token_expired(expires_at: Option<DateTime<Utc>>, buffer_minutes: i64) -> bool {
    match expires_at {
        None => false,
        Some(expires_at) => Utc::now() >= expires_at - Duration::minutes(buffer_minutes),
    }
}

/// Generate a fresh random key, hex-encoded.
pub fn generate_encryption_key() -> String {
    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut bytes[..]);
    hex::encode(&bytes[..])
}

/// Process-wide token cipher with a lazily resolved key.
#[derive(Clone)]
pub struct TokenCipher {
    inner: Arc<CipherInner>,
}

struct CipherInner {
    key_hex: Option<Zeroizing<String>>,
    key: OnceLock<Result<CryptoKey, CryptoError>>,
}

impl TokenCipher {
    /// Build a cipher from the configured hex key, if any.
    pub fn new(key_hex: Option<String>) -> Self {
        Self {
            inner: Arc::new(CipherInner {
                key_hex: key_hex.map(Zeroizing::new),
                key: OnceLock::new(),
            }),
        }
    }

    /// Build a cipher around an already parsed key.
    pub fn from_key(key: CryptoKey) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(key));
        Self {
            inner: Arc::new(CipherInner {
                key_hex: None,
                key: cell,
            }),
        }
    }

    fn key(&self) -> Result<&CryptoKey, CryptoError> {
        let resolved = self.inner.key.get_or_init(|| match &self.inner.key_hex {
            Some(hex_key) if !hex_key.trim().is_empty() => CryptoKey::from_hex(hex_key),
            _ => Err(CryptoError::MissingKey),
        });
        resolved.as_ref().map_err(Clone::clone)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        encrypt_token(self.key()?, plaintext)
    }

    pub fn decrypt(&self, bundle: &str) -> Result<String, CryptoError> {
        decrypt_token(self.key()?, bundle)
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("configured", &self.inner.key_hex.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![7u8; 32]).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let bundle = encrypt_token(&key, "ya29.access-token").unwrap();

        let segments: Vec<&str> = bundle.split(':').collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), IV_LEN * 2);
        assert_eq!(segments[1].len(), TAG_LEN * 2);

        assert_eq!(decrypt_token(&key, &bundle).unwrap(), "ya29.access-token");
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let key = test_key();
        let bundle = encrypt_token(&key, "").unwrap();
        assert!(bundle.ends_with(':'));
        assert_eq!(decrypt_token(&key, &bundle).unwrap(), "");
    }

    #[test]
    fn test_iv_is_fresh_per_call() {
        let key = test_key();
        let a = encrypt_token(&key, "same").unwrap();
        let b = encrypt_token(&key, "same").unwrap();
        assert_ne!(a.split(':').next(), b.split(':').next());
        assert_ne!(a, b);
    }

    #[test]
    fn test_flipped_tag_bit_fails() {
        let key = test_key();
        let bundle = encrypt_token(&key, "secret").unwrap();
        let segments: Vec<&str> = bundle.split(':').collect();

        let mut tag = hex::decode(segments[1]).unwrap();
        for byte in 0..tag.len() {
            for bit in 0..8 {
                tag[byte] ^= 1 << bit;
                let tampered = format!("{}:{}:{}", segments[0], hex::encode(&tag), segments[2]);
                assert_eq!(decrypt_token(&key, &tampered), Err(CryptoError::Decrypt));
                tag[byte] ^= 1 << bit;
            }
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let bundle = encrypt_token(&test_key(), "secret").unwrap();
        let other = CryptoKey::new(vec![9u8; 32]).unwrap();
        assert_eq!(decrypt_token(&other, &bundle), Err(CryptoError::Decrypt));
    }

    #[test]
    fn test_malformed_bundles() {
        let key = test_key();
        assert_eq!(decrypt_token(&key, "abcd"), Err(CryptoError::InvalidFormat));
        assert_eq!(decrypt_token(&key, "aa:bb:cc:dd"), Err(CryptoError::InvalidFormat));
        assert_eq!(decrypt_token(&key, "zz:bb:cc"), Err(CryptoError::InvalidFormat));
        assert_eq!(
            decrypt_token(&key, &format!("aabb:{}:00", "00".repeat(16))),
            Err(CryptoError::InvalidIv(2))
        );
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(CryptoKey::new(vec![0u8; 16]).is_err());
        assert!(CryptoKey::from_hex("abcd").is_err());
        assert!(CryptoKey::from_hex(&"ab".repeat(32)).is_ok());
    }

    #[test]
    fn test_missing_key_is_lazy() {
        let cipher = TokenCipher::new(None);
        assert_eq!(cipher.encrypt("x"), Err(CryptoError::MissingKey));
        assert_eq!(cipher.decrypt("a:b:c"), Err(CryptoError::MissingKey));
    }

    #[test]
    fn test_cipher_from_hex_config() {
        let cipher = TokenCipher::new(Some(generate_encryption_key()));
        let bundle = cipher.encrypt("refresh").unwrap();
        assert_eq!(cipher.decrypt(&bundle).unwrap(), "refresh");
    }

    #[test]
    fn test_generated_key_shape() {
        let key = generate_encryption_key();
        assert_eq!(key.len(), 64);
        assert!(CryptoKey::from_hex(&key).is_ok());
        assert_ne!(key, generate_encryption_key());
    }

    #[test]
    fn test_is_token_expired() {
        assert!(!is_token_expired(None, DEFAULT_EXPIRY_BUFFER_MINUTES));
        assert!(is_token_expired(
            Some(Utc::now() - Duration::minutes(1)),
            DEFAULT_EXPIRY_BUFFER_MINUTES
        ));
        assert!(is_token_expired(
            Some(Utc::now() + Duration::minutes(3)),
            DEFAULT_EXPIRY_BUFFER_MINUTES
        ));
        assert!(!is_token_expired(
            Some(Utc::now() + Duration::minutes(30)),
            DEFAULT_EXPIRY_BUFFER_MINUTES
        ));
        assert!(!is_token_expired(Some(Utc::now() + Duration::minutes(3)), 0));
    }
}
