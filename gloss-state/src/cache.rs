//! Content-addressed response cache with a fixed TTL from insertion.
//! Entries are pure functions of their key, so expiry is the only
//! invalidation path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::generator::Explanation;

/// Derive the cache key for a request: SHA-256 over the symbol and the
/// FULL context. Hashing the whole context means two requests share an
/// entry only when they are actually the same request.
pub fn cache_key(symbol: &str, context: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update([0u8]);
    if let Some(context) = context {
        hasher.update(context.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheSlot {
    value: Explanation,
    inserted_at: Instant,
}

/// In-memory TTL cache shared across request handlers.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, CacheSlot>>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Fetch a live entry. Expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<Explanation> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(slot) if slot.inserted_at.elapsed() <= self.ttl => Some(slot.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite; the TTL restarts from now.
    pub fn insert(&self, key: String, value: Explanation) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            CacheSlot {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries (call periodically to bound memory growth).
    pub fn purge_expired(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, slot| slot.inserted_at.elapsed() <= self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(symbol: &str) -> Explanation {
        Explanation {
            symbol: symbol.to_string(),
            explanation: format!("{} explained", symbol),
            category: "Mathematics".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn get_after_set_before_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let key = cache_key("∇", Some("divergence of a field"));
        cache.insert(key.clone(), sample("∇"));

        let hit = cache.get(&key).expect("entry should still be live");
        assert_eq!(hit.symbol, "∇");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(Duration::from_millis(20));
        let key = cache_key("∂", None);
        cache.insert(key.clone(), sample("∂"));

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn purge_expired_drops_only_dead_entries() {
        let cache = ResponseCache::new(Duration::from_millis(30));
        cache.insert(cache_key("α", None), sample("α"));
        std::thread::sleep(Duration::from_millis(50));
        cache.insert(cache_key("β", None), sample("β"));

        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&cache_key("β", None)).is_some());
    }

    #[test]
    fn shared_context_prefix_does_not_collide() {
        let prefix = "x".repeat(100);
        let a = cache_key("∑", Some(&format!("{prefix} in a series")));
        let b = cache_key("∑", Some(&format!("{prefix} in an integral")));
        assert_ne!(a, b);

        let with_context = cache_key("∑", Some("anything"));
        let without = cache_key("∑", None);
        assert_ne!(with_context, without);
    }
}
