//! Password fetch, decryption, and time-keyed auth token cache
//!
//! Authenticated RPC payloads carry a `{time, psw}` pair where `psw` is the
//! grill password encrypted under a key derived from the grill's current
//! uptime bucket. Tokens are cheap to regenerate but each regeneration
//! costs a round trip for the uptime, so the cache holds the decrypted
//! password and the two most recent tokens (bucket and bucket+1, covering
//! clock drift across the exchange) for a short TTL.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::codec::{self, FILE_DECODE_KEY, RPC_AUTH_KEY_BASE};
use crate::config::AUTH_CACHE_TIMEOUT;
use crate::http::HttpClient;
use crate::{Error, Result};

/// Auth material for one RPC exchange.
#[derive(Debug, Clone)]
pub struct AuthTokens {
    pub time_int: u64,
    pub psw_hex: String,
    pub psw_hex_plus1: String,
}

struct CacheEntry {
    password: Vec<u8>,
    last_uptime: u64,
    psw_hex: String,
    psw_hex_plus1: String,
    cached_at: SystemTime,
}

/// Per-IP auth cache, shareable across controllers targeting the same grill.
pub struct AuthCache {
    http: HttpClient,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// Encrypt `password` for bucket `t` and the following bucket.
fn generate_tokens(password: &[u8], time_int: u64) -> (String, String) {
    let seal = |t: u64| {
        let key = codec::derive_key(&RPC_AUTH_KEY_BASE, t);
        codec::encode_hex(&codec::codec(password, &key, 0, true))
    };
    (seal(time_int), seal(time_int + 1))
}

/// Whether a cached bucket is still close enough to the grill's clock.
fn within_drift(cached: u64, current: u64) -> bool {
    cached.abs_diff(current) < 2
}

impl AuthCache {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Produce `{time, psw}` material for `ip`, refreshing as needed.
    pub async fn tokens(&self, ip: &str) -> Result<AuthTokens> {
        if let Some((password, last_uptime)) = self.fresh_entry(ip) {
            // Cache is warm: only the uptime needs re-checking.
            let uptime = self.fetch_uptime(ip).await?;
            let time_int = codec::time_bucket(uptime);
            if within_drift(last_uptime, time_int) {
                if let Some(entry) = self.entries.lock().get(ip) {
                    return Ok(AuthTokens {
                        time_int: entry.last_uptime,
                        psw_hex: entry.psw_hex.clone(),
                        psw_hex_plus1: entry.psw_hex_plus1.clone(),
                    });
                }
                // Entry was invalidated under us; fall through to a refresh.
            } else {
                debug!(ip, cached = last_uptime, current = time_int, "auth bucket drifted, regenerating");
                let (psw_hex, psw_hex_plus1) = generate_tokens(&password, time_int);
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get_mut(ip) {
                    entry.last_uptime = time_int;
                    entry.psw_hex = psw_hex.clone();
                    entry.psw_hex_plus1 = psw_hex_plus1.clone();
                }
                return Ok(AuthTokens { time_int, psw_hex, psw_hex_plus1 });
            }
        }

        self.refresh(ip).await
    }

    /// Drop any cached material for `ip` (e.g. after an IP change).
    pub fn invalidate(&self, ip: &str) {
        self.entries.lock().remove(ip);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Cached password and bucket, if the entry is inside its TTL.
    fn fresh_entry(&self, ip: &str) -> Option<(Vec<u8>, u64)> {
        let mut entries = self.entries.lock();
        let entry = entries.get(ip)?;
        match SystemTime::now().duration_since(entry.cached_at) {
            Ok(age) if age < AUTH_CACHE_TIMEOUT => Some((entry.password.clone(), entry.last_uptime)),
            Ok(_) => None,
            Err(_) => {
                // Wall clock went backwards; the entry's age is meaningless.
                warn!(ip, "clock moved backwards, invalidating auth cache");
                entries.remove(ip);
                None
            }
        }
    }

    /// Full refresh: pull and decrypt the password, then mint both tokens.
    async fn refresh(&self, ip: &str) -> Result<AuthTokens> {
        let config = self
            .http
            .get(&format!("http://{}/extconfig.json", ip))
            .await?
            .json()?;
        let psw_hex_blob = config
            .get("psw")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::ProtocolDecode("extconfig.json missing psw".into()))?;
        let password = codec::codec(&codec::decode_hex(psw_hex_blob), &FILE_DECODE_KEY, 0, false);
        if password.is_empty() {
            return Err(Error::ProtocolDecode("decrypted password is empty".into()));
        }

        let uptime = self.fetch_uptime(ip).await?;
        let time_int = codec::time_bucket(uptime);
        let (psw_hex, psw_hex_plus1) = generate_tokens(&password, time_int);

        debug!(ip, time_int, "auth cache refreshed");
        self.entries.lock().insert(
            ip.to_string(),
            CacheEntry {
                password,
                last_uptime: time_int,
                psw_hex: psw_hex.clone(),
                psw_hex_plus1: psw_hex_plus1.clone(),
                cached_at: SystemTime::now(),
            },
        );
        Ok(AuthTokens { time_int, psw_hex, psw_hex_plus1 })
    }

    async fn fetch_uptime(&self, ip: &str) -> Result<u64> {
        let resp = self
            .http
            .post_json(&format!("http://{}/rpc/PB.GetTime", ip), &json!({}))
            .await?;
        if !resp.is_success() {
            return Err(Error::Send(format!("PB.GetTime returned {}", resp.status)));
        }
        resp.json()?
            .get("time")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::ProtocolDecode("PB.GetTime missing time".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_differ_per_bucket() {
        let (a0, a1) = generate_tokens(b"test", 3757);
        let (b0, _) = generate_tokens(b"test", 3758);
        assert_ne!(a0, a1);
        // Adjacent buckets share one token, covering drift mid-exchange.
        assert_eq!(a1, b0);
    }

    #[test]
    fn tokens_are_password_length() {
        let (t0, t1) = generate_tokens(b"test", 42);
        assert_eq!(t0.len(), 8); // 4 bytes, hex encoded
        assert_eq!(t1.len(), 8);
    }

    #[test]
    fn drift_window_is_under_two_buckets() {
        assert!(within_drift(100, 100));
        assert!(within_drift(100, 101));
        assert!(within_drift(101, 100));
        assert!(!within_drift(100, 102));
        assert!(!within_drift(102, 100));
    }
}
