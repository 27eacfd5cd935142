//! Response store trait and statistics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depcache_core::{DepcacheResult, Response};

use super::request_key::RequestKey;

/// A response as it sits in a store, with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    pub response: Response,
    pub stored_at: DateTime<Utc>,
}

/// Persistent store for request cache entries.
///
/// Stores are dumb key-value tables: validation against the manifest happens
/// in the engine, which keeps the serialized tag list in a response header.
/// Implementations must be safe to share between tasks.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Look up the entry for `key`.
    async fn get(&self, key: &RequestKey) -> DepcacheResult<Option<StoredResponse>>;

    /// Write `response` under `key`, replacing any previous entry.
    async fn put(
        &self,
        key: &RequestKey,
        response: &Response,
        stored_at: DateTime<Utc>,
    ) -> DepcacheResult<()>;

    /// Remove the entry for `key`. Returns whether one existed.
    async fn delete(&self, key: &RequestKey) -> DepcacheResult<bool>;

    /// Remove every entry. Returns how many were removed.
    async fn clear(&self) -> DepcacheResult<u64>;

    async fn stats(&self) -> DepcacheResult<StoreStats>;
}

/// Statistics about store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Number of entries currently stored.
    pub entry_count: u64,
    /// Approximate size of stored values in bytes.
    pub size_bytes: u64,
}

impl StoreStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
