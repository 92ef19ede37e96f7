//! OAuth transaction state
//!
//! The state, provider and requested scopes of an in-flight authorization
//! live between the initiate and callback requests. [`TransactionState`] is
//! the seam; cookies carry them in production, a map carries them in tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderValue, header::SET_COOKIE};
use axum_extra::headers::Cookie;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const OAUTH_STATE_KEY: &str = "oauth_state";
pub const OAUTH_PROVIDER_KEY: &str = "oauth_provider";
pub const OAUTH_SCOPES_KEY: &str = "oauth_scopes";

/// Lifetime of an authorization transaction
pub const TRANSACTION_TTL: Duration = Duration::from_secs(600);

/// Short-lived key/value storage scoped to one browser
pub trait TransactionState: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str, ttl: Duration);
    fn delete(&mut self, key: &str);
}

/// In-process transaction state with expiry
#[derive(Debug, Default)]
pub struct MemoryTransactionState {
    entries: HashMap<String, (String, Instant)>,
}

impl MemoryTransactionState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionState for MemoryTransactionState {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|(_, expires)| Instant::now() < *expires)
            .map(|(value, _)| value.clone())
    }

    fn set(&mut self, key: &str, value: &str, ttl: Duration) {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    fn delete(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

/// Transaction state carried in HMAC-signed cookies.
///
/// Cookies whose signature does not verify are ignored. Writes are queued
/// and emitted as `Set-Cookie` headers via [`Self::response_headers`].
pub struct CookieTransactionState {
    secret: Vec<u8>,
    secure: bool,
    values: HashMap<String, String>,
    pending: Vec<String>,
}

impl CookieTransactionState {
    /// Reads and verifies the transaction cookies of a request.
    pub fn from_cookies(cookies: Option<&Cookie>, secret: &[u8], secure: bool) -> Self {
        let mut values = HashMap::new();

        for name in TRANSACTION_KEYS {
            let Some(raw) = cookies.and_then(|c| c.get(name)) else {
                continue;
            };
            if let Some(decoded) = verify_cookie(secret, name, raw) {
                values.insert(name.to_string(), decoded);
            } else {
                tracing::debug!(cookie = name, "Ignoring cookie with invalid signature");
            }
        }

        Self {
            secret: secret.to_vec(),
            secure,
            values,
            pending: Vec::new(),
        }
    }

    /// `Set-Cookie` headers for everything written or deleted.
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for cookie in &self.pending {
            if let Ok(value) = HeaderValue::from_str(cookie) {
                headers.append(SET_COOKIE, value);
            }
        }
        headers
    }

    fn queue(&mut self, name: &str, value: &str, max_age: u64) {
        let mut parts = vec![
            format!("{}={}", name, value),
            "Path=/".to_string(),
            "HttpOnly".to_string(),
            "SameSite=Lax".to_string(),
            format!("Max-Age={}", max_age),
        ];
        if self.secure {
            parts.push("Secure".to_string());
        }
        self.pending.push(parts.join("; "));
    }
}

impl TransactionState for CookieTransactionState {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str, ttl: Duration) {
        let signed = sign_cookie(&self.secret, key, value);
        self.queue(key, &signed, ttl.as_secs());
        self.values.insert(key.to_string(), value.to_string());
    }

    fn delete(&mut self, key: &str) {
        self.queue(key, "", 0);
        self.values.remove(key);
    }
}

const TRANSACTION_KEYS: [&str; 3] = [OAUTH_STATE_KEY, OAUTH_PROVIDER_KEY, OAUTH_SCOPES_KEY];

fn mac_for(secret: &[u8], name: &str, encoded: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(name.as_bytes());
    mac.update(b"=");
    mac.update(encoded.as_bytes());
    Some(mac)
}

/// `base64url(value).hex(hmac(name=base64url(value)))`
fn sign_cookie(secret: &[u8], name: &str, value: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(value.as_bytes());
    match mac_for(secret, name, &encoded) {
        Some(mac) => format!("{}.{}", encoded, hex::encode(mac.finalize().into_bytes())),
        None => encoded,
    }
}

fn verify_cookie(secret: &[u8], name: &str, raw: &str) -> Option<String> {
    let (encoded, signature_hex) = raw.split_once('.')?;
    let signature = hex::decode(signature_hex).ok()?;
    mac_for(secret, name, encoded)?.verify_slice(&signature).ok()?;
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}
