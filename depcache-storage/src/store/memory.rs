//! In-memory response store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depcache_core::{DepcacheResult, Response};
use tokio::sync::RwLock;

use super::request_key::RequestKey;
use super::traits::{ResponseStore, StoreStats, StoredResponse};

/// Response store backed by a `HashMap`. Entries do not survive the process.
#[derive(Debug, Default)]
pub struct InMemoryResponseStore {
    entries: RwLock<HashMap<RequestKey, StoredResponse>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn approximate_size(response: &Response) -> u64 {
    let headers: usize = response
        .headers
        .iter()
        .map(|(name, value)| name.len() + value.len())
        .sum();
    (response.url.len() + headers + response.body.len()) as u64
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    async fn get(&self, key: &RequestKey) -> DepcacheResult<Option<StoredResponse>> {
        let found = self.entries.read().await.get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(found)
    }

    async fn put(
        &self,
        key: &RequestKey,
        response: &Response,
        stored_at: DateTime<Utc>,
    ) -> DepcacheResult<()> {
        self.entries.write().await.insert(
            key.clone(),
            StoredResponse {
                response: response.clone(),
                stored_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &RequestKey) -> DepcacheResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn clear(&self) -> DepcacheResult<u64> {
        let mut entries = self.entries.write().await;
        let removed = entries.len() as u64;
        entries.clear();
        Ok(removed)
    }

    async fn stats(&self) -> DepcacheResult<StoreStats> {
        let entries = self.entries.read().await;
        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: entries.len() as u64,
            size_bytes: entries
                .values()
                .map(|stored| approximate_size(&stored.response))
                .sum(),
        })
    }
}
