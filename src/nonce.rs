use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;

/// Width of a generated nonce in hex characters; also the maximum accepted
/// width on inbound requests
pub const NONCE_LEN: usize = 32;

/// Fresh random nonce, `NONCE_LEN` hex characters
pub fn generate() -> String {
    let mut bytes = [0u8; NONCE_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// In-memory replay cache for request nonces.
///
/// A nonce is accepted once within the time-to-live window; seen entries are
/// pruned lazily on insert.
pub struct NonceCache {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl NonceCache {
    pub fn new(ttl: Duration) -> Self {
        NonceCache {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false when the nonce was already used within the window
    pub fn check_and_store(&self, nonce: &str) -> bool {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_string(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_nonces() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), NONCE_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_replay_within_window() {
        let cache = NonceCache::new(Duration::from_secs(60));
        assert!(cache.check_and_store("abc"));
        assert!(!cache.check_and_store("abc"));
        assert!(cache.check_and_store("def"));
    }

    #[test]
    fn accepts_reuse_after_expiry() {
        let cache = NonceCache::new(Duration::from_millis(0));
        assert!(cache.check_and_store("abc"));
        assert!(cache.check_and_store("abc"));
    }
}
