//! Manifest snapshot loader.
//!
//! Holds the current manifest snapshot. Callers arriving while a load is in
//! progress await the same shared future, so one invalidation causes exactly
//! one fetch. A failed load is handed to every waiter and then forgotten; the
//! next call starts a new load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use depcache_core::{Manifest, ManifestError};
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::source::ManifestSource;

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<Manifest>, ManifestError>>>;

enum LoaderState {
    Empty,
    Loading { generation: u64, future: LoadFuture },
    Ready(Arc<Manifest>),
}

/// Lazily loaded, explicitly invalidated manifest snapshot.
pub struct ManifestLoader {
    source: Arc<dyn ManifestSource>,
    state: Mutex<LoaderState>,
    generation: AtomicU64,
}

impl ManifestLoader {
    pub fn new(source: Arc<dyn ManifestSource>) -> Self {
        Self {
            source,
            state: Mutex::new(LoaderState::Empty),
            generation: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoaderState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The current snapshot, loading it if there is none.
    pub async fn snapshot(&self) -> Result<Arc<Manifest>, ManifestError> {
        let future = {
            let mut state = self.state();
            match &*state {
                LoaderState::Ready(manifest) => return Ok(Arc::clone(manifest)),
                LoaderState::Loading { future, .. } => future.clone(),
                LoaderState::Empty => {
                    let generation = self.generation.load(Ordering::SeqCst);
                    let future = self.start_load(generation);
                    *state = LoaderState::Loading {
                        generation,
                        future: future.clone(),
                    };
                    future
                }
            }
        };

        let result = future.clone().await;

        // Only the load currently registered may settle the state.
        let mut state = self.state();
        let settles_current = matches!(
            &*state,
            LoaderState::Loading { future: current, .. } if current.ptr_eq(&future)
        );
        if settles_current {
            *state = match &result {
                Ok(manifest) => LoaderState::Ready(Arc::clone(manifest)),
                Err(_) => LoaderState::Empty,
            };
        }
        result
    }

    fn start_load(&self, generation: u64) -> LoadFuture {
        let source = Arc::clone(&self.source);
        async move {
            tracing::debug!(generation, "loading manifest");
            match source.load().await {
                Ok(manifest) => {
                    tracing::info!(
                        generation,
                        entries = manifest.len(),
                        excluded = manifest.excluded().len(),
                        "manifest loaded"
                    );
                    Ok(Arc::new(manifest))
                }
                Err(e) => {
                    tracing::warn!(generation, error = %e, "manifest load failed");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Discard the current snapshot. The next [`ManifestLoader::snapshot`]
    /// reloads. A load already in flight still completes for its waiters but
    /// is not installed.
    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state() = LoaderState::Empty;
        tracing::debug!(generation, "manifest invalidated");
    }

    /// The snapshot currently held, without loading.
    pub fn current(&self) -> Option<Arc<Manifest>> {
        match &*self.state() {
            LoaderState::Ready(manifest) => Some(Arc::clone(manifest)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ManifestLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, loading_generation) = match &*self.state() {
            LoaderState::Empty => ("empty", None),
            LoaderState::Loading { generation, .. } => ("loading", Some(*generation)),
            LoaderState::Ready(_) => ("ready", None),
        };
        f.debug_struct("ManifestLoader")
            .field("state", &state)
            .field("loading_generation", &loading_generation)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}
