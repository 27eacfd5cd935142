//! depcache Test Utilities
//!
//! Shared test infrastructure for the depcache workspace:
//! - Proptest generators for manifests and queries
//! - Fixtures for a small web project and its engine
//! - Custom assertions for depcache error variants

pub use depcache_core::{
    CacheRequest, ComputeError, DepcacheError, DepcacheResult, EngineConfig, Manifest,
    ManifestError, Response, Tag,
};
pub use depcache_engine::{CacheEngine, DependencyTracker, MockFetcher, StaticManifestSource};
pub use depcache_storage::InMemoryResponseStore;

use std::sync::Arc;

/// Base URL used by every fixture.
pub const TEST_BASE_URL: &str = "http://app.test";

/// Absolute URL for a path under [`TEST_BASE_URL`].
pub fn test_url(path: &str) -> String {
    format!("{TEST_BASE_URL}{path}")
}

// ============================================================================
// TEST ENGINE
// ============================================================================

/// An engine wired to an in-memory store, a static manifest source and a
/// scripted fetcher, with handles to all three.
pub struct TestEngine {
    pub engine: Arc<CacheEngine<InMemoryResponseStore>>,
    pub source: Arc<StaticManifestSource>,
    pub fetcher: Arc<MockFetcher>,
    pub store: Arc<InMemoryResponseStore>,
}

impl TestEngine {
    pub fn new(manifest: Manifest) -> Self {
        Self::with_config(manifest, EngineConfig::new(TEST_BASE_URL))
    }

    /// Build with a custom configuration. Panics if the configuration is
    /// invalid.
    pub fn with_config(manifest: Manifest, config: EngineConfig) -> Self {
        let source = Arc::new(StaticManifestSource::new(manifest));
        let fetcher = Arc::new(MockFetcher::new());
        let store = Arc::new(InMemoryResponseStore::new());
        let engine = CacheEngine::new(config, source.clone(), store.clone(), fetcher.clone())
            .expect("test engine configuration should be valid");
        Self {
            engine: Arc::new(engine),
            source,
            fetcher,
            store,
        }
    }

    /// Publish a new manifest and drop the engine's snapshot, as a page load
    /// would.
    pub fn publish(&self, manifest: Manifest) {
        self.source.set(manifest);
        self.engine.invalidate_manifest();
    }

    /// Script the fetcher to serve `path` with an `etag` of `version`.
    pub fn serve(&self, path: &str, version: &str, body: &str) {
        self.fetcher.set_response(
            test_url(path),
            fixtures::versioned_response(path, version, body),
        );
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for manifests and queries.

    use super::*;
    use proptest::prelude::*;

    /// One path segment: lowercase name with an optional extension.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        ("[a-z]{1,6}", prop::option::of(prop_oneof![Just("js"), Just("ts"), Just("hbs")]))
            .prop_map(|(name, ext)| match ext {
                Some(ext) => format!("{name}.{ext}"),
                None => name,
            })
    }

    /// An absolute manifest path, one to four segments deep.
    pub fn arb_path() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_segment(), 1..=4)
            .prop_map(|segments| format!("/{}", segments.join("/")))
    }

    /// A version identifier as a web server would report it.
    pub fn arb_version() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u64..2_000_000_000).prop_map(|secs| secs.to_string()),
            "[0-9a-f]{8}",
        ]
    }

    /// A manifest with distinct paths in generated order and no exclusions.
    pub fn arb_manifest() -> impl Strategy<Value = Manifest> {
        prop::collection::btree_map(arb_path(), arb_version(), 0..24)
            .prop_map(|files| Manifest::from_entries(files, Vec::<String>::new()))
    }

    /// A manifest together with one of its paths.
    pub fn arb_manifest_with_path() -> impl Strategy<Value = (Manifest, String)> {
        prop::collection::btree_map(arb_path(), arb_version(), 1..24).prop_flat_map(|files| {
            let paths: Vec<String> = files.keys().cloned().collect();
            let manifest = Manifest::from_entries(files, Vec::<String>::new());
            (Just(manifest), prop::sample::select(paths))
        })
    }

    /// A glob query over the directory of a generated path.
    pub fn arb_glob_query() -> impl Strategy<Value = String> {
        (arb_path(), prop_oneof![Just("*"), Just("**/*"), Just("*.js")]).prop_map(
            |(path, tail)| {
                let dir = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
                format!("{dir}/{tail}")
            },
        )
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built manifests and responses.

    use super::*;

    /// A small web project: templates, components, a package file and a
    /// vendored dependency directory that is excluded.
    pub fn app_manifest() -> Manifest {
        app_manifest_with(&[])
    }

    /// [`app_manifest`] with some versions overridden or paths added.
    pub fn app_manifest_with(overrides: &[(&str, &str)]) -> Manifest {
        let base = [
            ("/index.html", "100"),
            ("/package.json", "100"),
            ("/app/templates/application.hbs", "100"),
            ("/app/templates/index.hbs", "100"),
            ("/app/components/nav-bar.js", "100"),
            ("/app/components/nav-bar.hbs", "100"),
        ];
        Manifest::from_entries(
            base.into_iter().chain(overrides.iter().copied()),
            ["/deps/", "/service-worker.js"],
        )
    }

    /// A `200` response for `path` carrying `etag: "<version>"`.
    pub fn versioned_response(path: &str, version: &str, body: &str) -> Response {
        Response::new(test_url(path), 200)
            .with_header("etag", format!("\"{version}\""))
            .with_body(body.as_bytes().to_vec())
    }

    /// A `GET` request for a page load.
    pub fn page_request(path: &str) -> CacheRequest {
        CacheRequest::get(test_url(path)).with_header("accept", "text/html,*/*;q=0.8")
    }

    /// A `GET` request for a module.
    pub fn module_request(path: &str) -> CacheRequest {
        CacheRequest::get(test_url(path)).with_header("accept", "*/*")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for depcache-specific validation.

    use super::*;

    /// Assert that a DepcacheResult is a Manifest error.
    #[track_caller]
    pub fn assert_manifest_error<T: std::fmt::Debug>(result: &DepcacheResult<T>) {
        match result {
            Err(DepcacheError::Manifest(_)) => {}
            other => panic!("Expected Manifest error, got: {:?}", other),
        }
    }

    /// Assert that a DepcacheResult is a Query error.
    #[track_caller]
    pub fn assert_query_error<T: std::fmt::Debug>(result: &DepcacheResult<T>) {
        match result {
            Err(DepcacheError::Query(_)) => {}
            other => panic!("Expected Query error, got: {:?}", other),
        }
    }

    /// Assert that a DepcacheResult is a failed computation for `key`.
    #[track_caller]
    pub fn assert_compute_failed<T: std::fmt::Debug>(result: &DepcacheResult<T>, key: &str) {
        match result {
            Err(DepcacheError::Compute(ComputeError::Failed { key: k, .. })) => {
                assert_eq!(k, key, "Wrong key in Failed error");
            }
            other => panic!("Expected Failed error for {key}, got: {:?}", other),
        }
    }

    /// Assert that every tag holds against `manifest`.
    #[track_caller]
    pub fn assert_tags_current(manifest: &Manifest, tags: &[Tag]) {
        for tag in tags {
            assert!(tag.is_current(manifest), "Expected tag to hold: {:?}", tag);
        }
    }

    /// Assert that at least one tag no longer holds against `manifest`.
    #[track_caller]
    pub fn assert_tags_stale(manifest: &Manifest, tags: &[Tag]) {
        assert!(
            !depcache_core::tags_are_current(manifest, tags),
            "Expected a stale tag among: {:?}",
            tags
        );
    }
}
