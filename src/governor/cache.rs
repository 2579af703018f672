use crate::governor::ResponsePayload;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

struct CacheEntry {
    payload: ResponsePayload,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now - self.stored_at <= self.ttl
    }

    fn expires_at(&self) -> DateTime<Utc> {
        self.stored_at + self.ttl
    }
}

/// Keyed response cache with per-entry TTL.
///
/// Expiry is lazy: a stale entry is treated as a miss (and dropped) on the
/// read that observes it. At capacity, the entry closest to expiry is evicted
/// to make room.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<ResponsePayload> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<ResponsePayload> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_fresh_at(now) => Some(entry.payload.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, payload: ResponsePayload, ttl_secs: u64) {
        self.put_at(key, payload, ttl_secs, Utc::now());
    }

    pub fn put_at(&self, key: &str, payload: ResponsePayload, ttl_secs: u64, now: DateTime<Utc>) {
        let mut entries = self.entries.lock();

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            if let Some(evict) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at())
                .map(|(k, _)| k.clone())
            {
                entries.remove(&evict);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                stored_at: now,
                ttl: Duration::seconds(ttl_secs as i64),
            },
        );
    }

    /// Remove one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove all entries. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(content: &str) -> ResponsePayload {
        ResponsePayload {
            content: content.to_string(),
            model: "sonar".to_string(),
            tokens: 100,
        }
    }

    #[test]
    fn test_put_then_get_returns_payload() {
        let cache = ResponseCache::new(16);
        cache.put("k1", payload("markets are up"), 60);

        let hit = cache.get("k1").expect("fresh entry should hit");
        assert_eq!(hit.content, "markets are up");
    }

    #[test]
    fn test_get_misses_after_ttl() {
        let cache = ResponseCache::new(16);
        let now = Utc::now();
        cache.put_at("k1", payload("stale soon"), 30, now);

        assert!(cache.get_at("k1", now + Duration::seconds(30)).is_some());
        assert!(cache.get_at("k1", now + Duration::seconds(31)).is_none());
        assert_eq!(cache.len(), 0, "stale entry dropped on read");
    }

    #[test]
    fn test_put_overwrites_and_refreshes() {
        let cache = ResponseCache::new(16);
        let now = Utc::now();
        cache.put_at("k1", payload("old"), 10, now);
        cache.put_at("k1", payload("new"), 10, now + Duration::seconds(8));

        let hit = cache
            .get_at("k1", now + Duration::seconds(15))
            .expect("overwrite should refresh stored_at");
        assert_eq!(hit.content, "new");
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = ResponseCache::new(16);
        cache.put("k1", payload("a"), 60);
        cache.put("k2", payload("b"), 60);

        assert!(cache.invalidate("k1"));
        assert!(!cache.invalidate("k1"));
        assert!(cache.get("k1").is_none());

        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_closest_to_expiry() {
        let cache = ResponseCache::new(2);
        let now = Utc::now();
        cache.put_at("short", payload("a"), 10, now);
        cache.put_at("long", payload("b"), 600, now);
        cache.put_at("new", payload("c"), 300, now);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("short", now).is_none(), "soonest expiry evicted");
        assert!(cache.get_at("long", now).is_some());
        assert!(cache.get_at("new", now).is_some());
    }

    #[test]
    fn test_distinct_keys_do_not_collide() {
        let cache = ResponseCache::new(16);
        cache.put("k1", payload("one"), 60);
        cache.put("k2", payload("two"), 60);

        assert_eq!(cache.get("k1").unwrap().content, "one");
        assert_eq!(cache.get("k2").unwrap().content, "two");
    }
}
