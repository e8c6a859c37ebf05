//! Server-state query cache.
//!
//! Caches query results keyed by hierarchical string keys. Org-scoped keys
//! take the form `["org", <slug>, <resource>, ...]` so every entry is
//! partitioned by tenant; lookups are exact-key, which makes cross-tenant
//! reads structurally impossible. Invalidation marks entries stale rather
//! than dropping them — a stale entry can still back a
//! stale-while-revalidate render if its tenant is selected again.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;

/// Key namespace marker for org-scoped queries.
pub const ORG_SCOPE: &str = "org";

/// Hierarchical query key, e.g. `["org", "acme", "buildings"]`.
pub type QueryKey = Vec<String>;

/// Builds an org-scoped key: `["org", slug, rest...]`.
pub fn org_key(slug: &str, rest: &[&str]) -> QueryKey {
    let mut key = Vec::with_capacity(rest.len() + 2);
    key.push(ORG_SCOPE.to_string());
    key.push(slug.to_string());
    key.extend(rest.iter().map(|s| (*s).to_string()));
    key
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    stale: bool,
}

/// A cached value together with its staleness flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub value: Value,
    pub is_stale: bool,
}

/// In-process query cache with tenant-aware invalidation.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<QueryKey, Entry>>,
}

impl QueryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a key. Returns the value and whether it has been invalidated
    /// since insertion.
    pub fn get(&self, key: &QueryKey) -> Option<CacheHit> {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.get(key).map(|e| CacheHit {
            value: e.value.clone(),
            is_stale: e.stale,
        })
    }

    /// Looks up a key, ignoring stale entries.
    pub fn get_fresh(&self, key: &QueryKey) -> Option<Value> {
        self.get(key).and_then(|hit| (!hit.is_stale).then_some(hit.value))
    }

    /// Inserts or replaces a value, resetting its staleness.
    pub fn insert(&self, key: QueryKey, value: Value) {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.insert(key, Entry { value, stale: false });
    }

    /// Marks stale every entry whose key matches the predicate.
    /// Returns the number of entries touched.
    pub fn invalidate_where(&self, pred: impl Fn(&QueryKey) -> bool) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut touched = 0;
        for (key, entry) in entries.iter_mut() {
            if !entry.stale && pred(key) {
                entry.stale = true;
                touched += 1;
            }
        }
        touched
    }

    /// Marks stale every org-scoped entry — any key whose first two
    /// components are the org marker and some slug. Covers the prior tenant's
    /// namespace and any globally-keyed org data alike.
    pub fn invalidate_org_scoped(&self) -> usize {
        let touched = self.invalidate_where(|key| key.len() >= 2 && key[0] == ORG_SCOPE);
        if touched > 0 {
            debug!(entries = touched, "invalidated org-scoped cache entries");
        }
        touched
    }

    /// Drops everything. Used on logout, where even stale reads are unsafe.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.clear();
    }

    /// Number of cached entries, stale included.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Test: exact-key lookups cannot cross tenants.
    #[test]
    fn test_keys_partition_by_org() {
        let cache = QueryCache::new();
        cache.insert(org_key("acme", &["buildings"]), json!(["b1"]));

        assert!(cache.get(&org_key("acme", &["buildings"])).is_some());
        assert!(cache.get(&org_key("globex", &["buildings"])).is_none());
    }

    /// Test: org-scoped invalidation marks entries stale but keeps them.
    #[test]
    fn test_invalidate_org_scoped_marks_stale() {
        let cache = QueryCache::new();
        cache.insert(org_key("acme", &["buildings"]), json!(["b1"]));
        cache.insert(vec!["profile".to_string()], json!({"id": 1}));

        let touched = cache.invalidate_org_scoped();
        assert_eq!(touched, 1);

        let hit = cache.get(&org_key("acme", &["buildings"])).unwrap();
        assert!(hit.is_stale);
        assert!(cache.get_fresh(&org_key("acme", &["buildings"])).is_none());

        // Non-org keys untouched
        let profile = cache.get(&vec!["profile".to_string()]).unwrap();
        assert!(!profile.is_stale);
    }

    /// Test: re-inserting after invalidation resets staleness.
    #[test]
    fn test_insert_resets_staleness() {
        let cache = QueryCache::new();
        let key = org_key("acme", &["units"]);
        cache.insert(key.clone(), json!(["u1"]));
        cache.invalidate_org_scoped();
        cache.insert(key.clone(), json!(["u1", "u2"]));

        assert_eq!(cache.get_fresh(&key), Some(json!(["u1", "u2"])));
    }

    /// Test: clear drops entries entirely.
    #[test]
    fn test_clear() {
        let cache = QueryCache::new();
        cache.insert(org_key("acme", &["leases"]), json!([]));
        cache.clear();
        assert!(cache.is_empty());
    }
}
