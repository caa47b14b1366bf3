//! Last-known-good results per step.
//!
//! Every genuine success overwrites the entry for its step name; fallback
//! values are never written here. Entries are not expired: the key space is
//! the configured step names.

use moka::future::Cache;
use serde_json::Value;

/// A cached step result and the cycle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub value: Value,
    pub cycle: u64,
}

/// Result cache using moka.
///
/// Safe for concurrent reads and overwrites across cycles; last writer wins
/// per step name.
pub struct ResultCache {
    cache: Cache<String, CachedResult>,
}

impl ResultCache {
    /// Create a cache holding up to `max_entries` step names.
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_entries).build();
        Self { cache }
    }

    /// Get the last successful result of a step.
    pub async fn get(&self, step: &str) -> Option<CachedResult> {
        self.cache.get(step).await
    }

    /// Store a successful result.
    pub async fn put(&self, step: &str, value: Value, cycle: u64) {
        self.cache
            .insert(step.to_string(), CachedResult { value, cycle })
            .await;
    }

    /// Approximate number of entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(1024)
    }
}
