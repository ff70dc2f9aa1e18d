//! LRU+TTL cache over `BizQueryConfig`, keyed by group name, spec.md §4.5.

use super::models::BizQueryConfig;
use moka::sync::Cache;
use std::time::Duration;

/// Bounded, TTL-expiring cache. Writers call [`ConfigCache::invalidate`]
/// before their store write returns success; the next read simply misses
/// and reloads, which is lazy-safe per spec.md §4.5.
#[derive(Clone)]
pub struct ConfigCache {
    inner: Cache<String, BizQueryConfig>,
}

impl ConfigCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub fn get(&self, group: &str) -> Option<BizQueryConfig> {
        self.inner.get(group)
    }

    pub fn put(&self, group: &str, config: BizQueryConfig) {
        self.inner.insert(group.to_string(), config);
    }

    pub fn invalidate(&self, group: &str) {
        self.inner.invalidate(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::models::GroupSettings;
    use std::collections::HashMap;

    fn config() -> BizQueryConfig {
        BizQueryConfig {
            group: GroupSettings {
                is_publicly_searchable: true,
                default_query_table: None,
            },
            tables: HashMap::new(),
            views: Vec::new(),
            rate_limit: None,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = ConfigCache::new(10, Duration::from_secs(60));
        cache.put("bizA", config());
        assert!(cache.get("bizA").is_some());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = ConfigCache::new(10, Duration::from_secs(60));
        cache.put("bizA", config());
        cache.invalidate("bizA");
        assert!(cache.get("bizA").is_none());
    }
}
