//! ETag cache for conditional requests against the starred listing
//!
//! The key space is one entry per listing page (`stars:page:N`), so there is
//! no eviction. Entries are overwritten on a changed response and only get a
//! fresher `fetched_at` on a 304.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// A cached response for one paginated resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub etag: String,
    pub payload: String,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, etag: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            etag: etag.into(),
            payload: payload.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// Resource key for a page of the starred listing
pub fn page_key(page: u32) -> String {
    format!("stars:page:{}", page)
}

/// Key/value store of validators and payloads, safe to share between tasks
#[derive(Debug, Default)]
pub struct EtagCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl EtagCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the cache from persisted entries
    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let map = entries
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Self {
            entries: Mutex::new(map),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validator and payload for `key`, if cached
    pub fn get(&self, key: &str) -> Option<(String, String)> {
        self.lock()
            .get(key)
            .map(|entry| (entry.etag.clone(), entry.payload.clone()))
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.lock().get(key).cloned()
    }

    pub fn put(&self, key: &str, etag: &str, payload: &str) {
        self.insert(CacheEntry::new(key, etag, payload));
    }

    pub fn insert(&self, entry: CacheEntry) {
        self.lock().insert(entry.key.clone(), entry);
    }

    /// Mark `key` as confirmed unchanged at `at`
    pub fn touch(&self, key: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.fetched_at = at;
        }
    }

    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<_> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_get_and_put() {
        let cache = EtagCache::new();
        assert!(cache.get("stars:page:1").is_none());

        cache.put("stars:page:1", "\"v1\"", "[1]");
        assert_eq!(
            cache.get("stars:page:1"),
            Some(("\"v1\"".to_string(), "[1]".to_string()))
        );

        cache.put("stars:page:1", "\"v2\"", "[1,2]");
        assert_eq!(cache.get("stars:page:1").unwrap().0, "\"v2\"");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_touch_only_refreshes_timestamp() {
        let cache = EtagCache::new();
        cache.put(&page_key(2), "\"v1\"", "[]");
        let before = cache.entry(&page_key(2)).unwrap();

        let later = before.fetched_at + Duration::minutes(5);
        cache.touch(&page_key(2), later);
        cache.touch("stars:page:99", later);

        let after = cache.entry(&page_key(2)).unwrap();
        assert_eq!(after.etag, before.etag);
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.fetched_at, later);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_from_entries_and_snapshot() {
        let cache = EtagCache::from_entries(vec![
            CacheEntry::new(page_key(2), "b", "[]"),
            CacheEntry::new(page_key(1), "a", "[]"),
        ]);
        let keys: Vec<_> = cache.snapshot().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["stars:page:1", "stars:page:2"]);
    }
}
