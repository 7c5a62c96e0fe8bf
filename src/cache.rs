use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/* ============================= KEY ============================= */

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl CacheKey {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        CacheKey {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/* ============================= CACHE ============================= */

struct CacheEntry {
    inserted: Instant,
    value: serde_json::Value,
}

/// Process-local TTL memoization of enrichment lookups.
///
/// Values are stored as JSON snapshots so one cache serves every fetched
/// kind. Entries past the TTL read as misses; insertions are idempotent so
/// concurrent writers may race freely. Not-found results are never cached.
pub struct TtlCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        TtlCache {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let entry = self.entries.get(key)?;
        if entry.inserted.elapsed() > self.ttl {
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    pub fn insert<T: Serialize>(&self, key: CacheKey, value: &T) {
        let Ok(value) = serde_json::to_value(value) else {
            return;
        };
        self.entries.insert(
            key,
            CacheEntry {
                inserted: Instant::now(),
                value,
            },
        );
    }

    /// Drop expired entries. Called periodically to bound memory.
    pub fn sweep(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted.elapsed() <= self.ttl);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "cache_swept");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/* ============================= TESTS ============================= */
