//! The cache engine.
//!
//! [`CacheEngine`] ties the manifest loader, the response store, the work
//! store and the in-flight map together. It offers two caches with the same
//! protocol:
//!
//! - a request cache ([`CacheEngine::through`], [`CacheEngine::request_cached`])
//!   persisting responses in a [`ResponseStore`] with their tag list in a
//!   synthetic header;
//! - a work cache ([`CacheEngine::work`]) holding typed values in memory.
//!
//! On read, every stored tag is recomputed against the current manifest. A
//! stale entry is deleted and recomputed; a volatile computation is returned
//! but never stored.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use depcache_core::{
    decode_tags, encode_tags, tags_are_current, CacheRequest, DepcacheError, DepcacheResult,
    EngineConfig, Manifest, Response, StoreError, Tag,
};
use depcache_storage::{RequestKey, ResponseStore, StoreStats, WorkEntry, WorkStore};

use crate::coalesce::{downcast, CacheKey, Flight, InFlight, Outcome};
use crate::fetch::Fetcher;
use crate::loader::ManifestLoader;
use crate::source::ManifestSource;
use crate::tracker::{DependencyTracker, TrackerPolicy};

/// Query parameter that disables caching for one request in
/// [`CacheEngine::handle`].
pub const NOCACHE_PARAM: &str = "nocache";

// ============================================================================
// STATISTICS
// ============================================================================

/// Engine-level cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a valid stored entry.
    pub hits: u64,
    /// Lookups that had to compute, including evictions.
    pub misses: u64,
    /// Stored entries deleted because a tag no longer held.
    pub evictions: u64,
    /// Calls that skipped the cache entirely.
    pub bypasses: u64,
    /// Fresh results written to a store.
    pub stores: u64,
    /// Fresh results not written because their tracker was volatile.
    pub skipped_stores: u64,
    /// Calls that waited on another caller's computation.
    pub coalesced: u64,
}

impl CacheStats {
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

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bypasses: AtomicU64,
    stores: AtomicU64,
    skipped_stores: AtomicU64,
    coalesced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            skipped_stores: self.skipped_stores.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Dependency-tracking cache engine for one process.
///
/// # Type Parameters
///
/// - `S`: the response store backing the request cache. `dyn ResponseStore`
///   works for stores chosen at runtime.
///
/// # Example
///
/// ```ignore
/// let engine = CacheEngine::new(config, source, store, fetcher)?;
///
/// let response = engine
///     .through(&CacheRequest::get(url), true, None, |depend| async move {
///         let paths = depend.query_manifest("/app/templates/**/*.hbs")?;
///         Ok(render(paths))
///     })
///     .await?;
/// ```
pub struct CacheEngine<S: ResponseStore + ?Sized> {
    config: EngineConfig,
    policy: Arc<TrackerPolicy>,
    loader: ManifestLoader,
    store: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    work: WorkStore,
    in_flight: InFlight,
    counters: Counters,
}

impl<S: ResponseStore + ?Sized> CacheEngine<S> {
    /// Create an engine. The configuration is validated first.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn ManifestSource>,
        store: Arc<S>,
        fetcher: Arc<dyn Fetcher>,
    ) -> DepcacheResult<Self> {
        config.validate()?;
        Ok(Self {
            policy: Arc::new(TrackerPolicy::from_config(&config)),
            config,
            loader: ManifestLoader::new(source),
            store,
            fetcher,
            work: WorkStore::new(),
            in_flight: InFlight::new(),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get a reference to the response store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The current manifest snapshot, loading it if necessary.
    pub async fn manifest(&self) -> DepcacheResult<Arc<Manifest>> {
        Ok(self.loader.snapshot().await?)
    }

    /// A root tracker bound to the current manifest snapshot.
    pub async fn tracker(&self) -> DepcacheResult<DependencyTracker> {
        let manifest = self.manifest().await?;
        Ok(DependencyTracker::new(manifest, Arc::clone(&self.policy)))
    }

    /// Discard the manifest snapshot; the next lookup reloads it.
    pub fn invalidate_manifest(&self) {
        self.loader.invalidate();
    }

    /// Drop every stored response and work result.
    pub async fn clear(&self) -> DepcacheResult<u64> {
        let responses = self.store.clear().await?;
        let work = self.work.clear();
        tracing::info!(responses, work, "cache cleared");
        Ok(responses + work)
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Statistics reported by the response store backend.
    pub async fn store_stats(&self) -> DepcacheResult<StoreStats> {
        self.store.stats().await
    }

    /// Number of computations currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Nested computations validate against their caller's snapshot so that a
    /// whole request sees one manifest.
    async fn snapshot_for(
        &self,
        parent: Option<&DependencyTracker>,
    ) -> DepcacheResult<Arc<Manifest>> {
        match parent {
            Some(parent) => Ok(Arc::clone(parent.manifest())),
            None => self.manifest().await,
        }
    }

    fn new_tracker(&self, manifest: Arc<Manifest>) -> DependencyTracker {
        DependencyTracker::new(manifest, Arc::clone(&self.policy))
    }

    // ------------------------------------------------------------------------
    // Request cache
    // ------------------------------------------------------------------------

    /// Answer `request` from the request cache, or compute it with `handler`.
    ///
    /// With `enabled` false, or for a non-`GET` request, the store is neither
    /// read nor written and `handler` always runs. The handler's tracker is
    /// merged into `parent` in every case.
    pub async fn through<F, Fut>(
        &self,
        request: &CacheRequest,
        enabled: bool,
        parent: Option<&DependencyTracker>,
        handler: F,
    ) -> DepcacheResult<Response>
    where
        F: FnOnce(DependencyTracker) -> Fut,
        Fut: Future<Output = DepcacheResult<Response>>,
    {
        let manifest = self.snapshot_for(parent).await?;

        if !enabled || !request.is_cacheable() {
            Counters::bump(&self.counters.bypasses);
            tracing::debug!(method = %request.method, url = %request.url, "cache bypass");
            let tracker = self.new_tracker(manifest);
            let response = handler(tracker.clone()).await?;
            if let Some(parent) = parent {
                tracker.merge_into(parent);
            }
            return Ok(response);
        }

        let key = RequestKey::for_request(request);
        if let Some(response) = self.lookup_response(&key, &manifest, parent).await? {
            return Ok(response);
        }

        let cache_key = CacheKey::Request(key.clone());
        let guard = match self.in_flight.join(cache_key.clone()) {
            Flight::Follower(waiter) => {
                let value = self.follow(&cache_key, parent, waiter.wait()).await?;
                return downcast::<Response>(&cache_key, &value);
            }
            Flight::Leader(guard) => guard,
        };

        let tracker = self.new_tracker(manifest);
        let response = match handler(tracker.clone()).await {
            Ok(response) => response,
            Err(e) => {
                guard.complete(Err(e.clone()));
                return Err(e);
            }
        };

        self.store_response(&key, &response, &tracker).await;
        if let Some(parent) = parent {
            tracker.merge_into(parent);
        }
        guard.complete(Ok(Arc::new(response.clone())));
        Ok(response)
    }

    /// Fetch `url` through the request cache as a nested computation of
    /// `parent`. The fetched response is recorded on the nested tracker.
    pub async fn request_cached(
        &self,
        url: &str,
        parent: Option<&DependencyTracker>,
    ) -> DepcacheResult<Response> {
        let request = CacheRequest::get(url);
        let fetcher = Arc::clone(&self.fetcher);
        let upstream = request.clone();
        self.through(&request, true, parent, |depend| async move {
            let response = fetcher.fetch(&upstream).await?;
            depend.record_resource(&response);
            Ok(response)
        })
        .await
    }

    /// Top-level entry point for a request arriving from a client.
    ///
    /// A request accepting `text/html` is a page load and invalidates the
    /// manifest first, so one page sees one fresh snapshot. A `nocache` query
    /// parameter disables the cache for this request.
    pub async fn handle(&self, request: &CacheRequest) -> DepcacheResult<Response> {
        if request.accepts("text/html") {
            self.invalidate_manifest();
        }
        let enabled = !has_query_param(&request.url, NOCACHE_PARAM);
        let fetcher = Arc::clone(&self.fetcher);
        let upstream = request.clone();
        self.through(request, enabled, None, |depend| async move {
            let response = fetcher.fetch(&upstream).await?;
            depend.record_resource(&response);
            Ok(response)
        })
        .await
    }

    async fn lookup_response(
        &self,
        key: &RequestKey,
        manifest: &Manifest,
        parent: Option<&DependencyTracker>,
    ) -> DepcacheResult<Option<Response>> {
        let stored = match self.store.get(key).await {
            Ok(stored) => stored,
            Err(DepcacheError::Store(StoreError::Corrupt { reason, .. })) => {
                tracing::warn!(key = %key, reason = %reason, "discarding corrupt cache entry");
                self.store.delete(key).await?;
                Counters::bump(&self.counters.evictions);
                Counters::bump(&self.counters.misses);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(stored) = stored else {
            Counters::bump(&self.counters.misses);
            tracing::debug!(key = %key, "cache miss");
            return Ok(None);
        };

        let mut response = stored.response;
        let tags = response
            .headers
            .remove(&self.config.tags_header)
            .and_then(|header| decode_tags(&header).ok());
        match tags {
            Some(tags) if tags_are_current(manifest, &tags) => {
                Counters::bump(&self.counters.hits);
                tracing::debug!(key = %key, tags = tags.len(), "cache hit");
                if let Some(parent) = parent {
                    parent.add_tags(tags);
                }
                Ok(Some(response))
            }
            _ => {
                self.store.delete(key).await?;
                Counters::bump(&self.counters.evictions);
                Counters::bump(&self.counters.misses);
                tracing::debug!(key = %key, "cache evict");
                Ok(None)
            }
        }
    }

    async fn store_response(
        &self,
        key: &RequestKey,
        response: &Response,
        tracker: &DependencyTracker,
    ) {
        let Some(tags) = tracker.serialize() else {
            Counters::bump(&self.counters.skipped_stores);
            tracing::debug!(key = %key, "skip store: tracker is volatile");
            return;
        };
        let header = match encode_tags(&tags) {
            Ok(header) => header,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "skip store: tags did not encode");
                Counters::bump(&self.counters.skipped_stores);
                return;
            }
        };

        let stored = response
            .clone()
            .with_header(self.config.tags_header.clone(), header);
        match self.store.put(key, &stored, Utc::now()).await {
            Ok(()) => {
                Counters::bump(&self.counters.stores);
                tracing::debug!(key = %key, tags = tags.len(), "cache store");
            }
            Err(e) => {
                Counters::bump(&self.counters.skipped_stores);
                tracing::warn!(key = %key, error = %e, "cache store failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Work cache
    // ------------------------------------------------------------------------

    /// Answer `key` from the work cache, or compute it with `compute`.
    ///
    /// Values are kept in memory and cloned out. Asking for a key with a
    /// different type than it was stored with is a
    /// [`depcache_core::ComputeError::TypeMismatch`].
    pub async fn work<V, F, Fut>(
        &self,
        key: &str,
        parent: Option<&DependencyTracker>,
        compute: F,
    ) -> DepcacheResult<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(DependencyTracker) -> Fut,
        Fut: Future<Output = DepcacheResult<V>>,
    {
        let manifest = self.snapshot_for(parent).await?;
        let cache_key = CacheKey::Work(key.to_string());

        if let Some(entry) = self.work.get(key) {
            if tags_are_current(&manifest, &entry.tags) {
                Counters::bump(&self.counters.hits);
                tracing::debug!(key, tags = entry.tags.len(), "work hit");
                let value = downcast::<V>(&cache_key, &entry.value)?;
                if let Some(parent) = parent {
                    parent.add_tags(entry.tags);
                }
                return Ok(value);
            }
            self.work.remove(key);
            Counters::bump(&self.counters.evictions);
            Counters::bump(&self.counters.misses);
            tracing::debug!(key, "work evict");
        } else {
            Counters::bump(&self.counters.misses);
            tracing::debug!(key, "work miss");
        }

        let guard = match self.in_flight.join(cache_key.clone()) {
            Flight::Follower(waiter) => {
                let value = self.follow(&cache_key, parent, waiter.wait()).await?;
                return downcast::<V>(&cache_key, &value);
            }
            Flight::Leader(guard) => guard,
        };

        let tracker = self.new_tracker(manifest);
        let value = match compute(tracker.clone()).await {
            Ok(value) => value,
            Err(e) => {
                guard.complete(Err(e.clone()));
                return Err(e);
            }
        };

        let shared: Arc<dyn Any + Send + Sync> = Arc::new(value.clone());
        match tracker.serialize() {
            Some(tags) => {
                Counters::bump(&self.counters.stores);
                tracing::debug!(key, tags = tags.len(), "work store");
                self.work.insert(
                    key,
                    WorkEntry {
                        value: Arc::clone(&shared),
                        tags,
                    },
                );
            }
            None => {
                Counters::bump(&self.counters.skipped_stores);
                tracing::debug!(key, "skip work store: tracker is volatile");
            }
        }
        if let Some(parent) = parent {
            tracker.merge_into(parent);
        }
        guard.complete(Ok(shared));
        Ok(value)
    }

    /// Wait on another caller's computation. The waiting caller cannot claim
    /// the leader's tags, so its own tracker becomes volatile.
    async fn follow<W>(
        &self,
        key: &CacheKey,
        parent: Option<&DependencyTracker>,
        wait: W,
    ) -> DepcacheResult<Arc<dyn Any + Send + Sync>>
    where
        W: Future<Output = Outcome>,
    {
        Counters::bump(&self.counters.coalesced);
        tracing::debug!(key = %key, "coalesced with in-flight computation");
        if let Some(parent) = parent {
            parent.volatile_because("coalesced computation", "waited on another caller");
        }
        wait.await
    }
}

impl<S: ResponseStore + ?Sized> std::fmt::Debug for CacheEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("config", &self.config)
            .field("loader", &self.loader)
            .field("in_flight", &self.in_flight)
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

fn has_query_param(raw: &str, name: &str) -> bool {
    url::Url::parse(raw)
        .map(|parsed| parsed.query_pairs().any(|(key, _)| key == name))
        .unwrap_or(false)
}

/// Tags currently attached to a stored response, if any.
pub fn stored_tags(response: &Response, tags_header: &str) -> Option<Vec<Tag>> {
    response
        .headers
        .get(tags_header)
        .and_then(|header| decode_tags(header).ok())
}
