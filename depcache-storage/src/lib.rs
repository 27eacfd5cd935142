//! depcache Storage - Response and Work Stores
//!
//! Storage for the two cache kinds the engine manages: HTTP-like responses
//! keyed by request, and typed work results keyed by string. Neither store
//! knows about manifests; the engine validates entries before using them.

pub mod store;
pub mod work;

pub use store::{
    InMemoryResponseStore, LmdbResponseStore, LmdbStoreError, RequestKey, ResponseStore,
    StoreStats, StoredResponse,
};
pub use work::{WorkEntry, WorkStore, WorkValue};

use std::sync::Arc;

use depcache_core::{DepcacheResult, StoreConfig};

/// Open the response store described by `config`: an LMDB environment when a
/// path is set, otherwise an in-memory map.
pub fn open_store(config: &StoreConfig) -> DepcacheResult<Arc<dyn ResponseStore>> {
    match &config.path {
        Some(path) => {
            let store = LmdbResponseStore::new(path, config.max_size_mb)?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryResponseStore::new())),
    }
}
