use crate::validate::types::ClusterValidationResult;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct CachedEntry {
    result: ClusterValidationResult,
    stored_at: Instant,
}

/// Per-cluster validation result cache with a strict TTL. Reads take the
/// read lock and copy the value out; writes replace the entry atomically
/// under the write lock.
pub struct ValidationCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedEntry>>,
}

impl ValidationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached result iff `now - stored_at < ttl`. An entry at or
    /// past the TTL is never returned.
    pub fn get(&self, cluster: &str) -> Option<ClusterValidationResult> {
        let entries = self.entries.read().unwrap();
        entries.get(cluster).and_then(|entry| {
            if entry.stored_at.elapsed() < self.ttl {
                Some(entry.result.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, result: ClusterValidationResult) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            result.cluster_name.clone(),
            CachedEntry {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop entries past their TTL. The getter already refuses stale
    /// entries; this just bounds memory between validation passes.
    pub fn evict_expired(&self) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str) -> ClusterValidationResult {
        ClusterValidationResult::new(name)
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ValidationCache::new(Duration::from_secs(60));
        cache.put(result("c1"));
        let hit = cache.get("c1").unwrap();
        assert_eq!(hit.cluster_name, "c1");
    }

    #[test]
    fn test_miss_for_unknown_cluster() {
        let cache = ValidationCache::new(Duration::from_secs(60));
        assert!(cache.get("ghost").is_none());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = ValidationCache::new(Duration::from_millis(10));
        cache.put(result("c1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("c1").is_none());
        // the entry is still stored until eviction, but never returned
        assert_eq!(cache.len(), 1);
        cache.evict_expired();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_put_replaces_atomically() {
        let cache = ValidationCache::new(Duration::from_secs(60));
        cache.put(result("c1"));
        let mut updated = result("c1");
        updated.error("now invalid");
        cache.put(updated);
        assert_eq!(cache.len(), 1);
        assert!(!cache.get("c1").unwrap().valid);
    }

    #[test]
    fn test_reads_return_copies() {
        let cache = ValidationCache::new(Duration::from_secs(60));
        cache.put(result("c1"));
        let mut copy = cache.get("c1").unwrap();
        copy.error("mutating the copy");
        // the cached entry is untouched
        assert!(cache.get("c1").unwrap().valid);
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = ValidationCache::new(Duration::ZERO);
        cache.put(result("c1"));
        assert!(cache.get("c1").is_none());
    }
}
