//! depcache Engine - Dependency-Tracking Cache
//!
//! Caches the results of expensive computations (transpiled modules, rendered
//! documents, fetched resources) and keeps them valid for exactly as long as
//! the resources they read are unchanged.
//!
//! Every computation gets a [`DependencyTracker`]. Manifest queries and
//! fetched resources are recorded on it as tags. A stored result is reused
//! only while each of its tags still holds against the latest manifest
//! snapshot, which the [`ManifestLoader`] loads lazily and drops on
//! invalidation. Concurrent misses for one key share a single computation.

pub mod coalesce;
pub mod engine;
pub mod fetch;
pub mod loader;
pub mod source;
pub mod telemetry;
pub mod tracker;

pub use coalesce::{CacheKey, Flight, FlightGuard, FlightWaiter, InFlight, Outcome};
pub use engine::{stored_tags, CacheEngine, CacheStats, NOCACHE_PARAM};
pub use fetch::{Fetcher, HttpFetcher, MockFetcher};
pub use loader::ManifestLoader;
pub use source::{
    DirectoryManifestSource, HttpManifestSource, ManifestSource, StaticManifestSource,
};
pub use telemetry::{init_tracing, TelemetryConfig, DEFAULT_LOG_FILTER};
pub use tracker::{DependencyTracker, TrackerPolicy};

use std::sync::Arc;

use depcache_core::{DepcacheResult, EngineConfig};
use depcache_storage::ResponseStore;

/// Build an engine from configuration alone: the manifest is fetched over
/// HTTP, responses are fetched with [`HttpFetcher`] and stored in the backend
/// chosen by [`depcache_storage::open_store`].
pub fn engine_from_config(config: EngineConfig) -> DepcacheResult<CacheEngine<dyn ResponseStore>> {
    let store = depcache_storage::open_store(&config.store)?;
    let source = Arc::new(HttpManifestSource::from_config(&config));
    CacheEngine::new(config, source, store, Arc::new(HttpFetcher::new()))
}
