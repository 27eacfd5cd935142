//! Dependency tracking for one cached computation.
//!
//! A [`DependencyTracker`] records every manifest query a computation performs
//! as a [`Tag`], and can be downgraded to volatile when the computation reads
//! something the manifest cannot describe. Nested computations get their own
//! tracker and merge into their caller's tracker when they finish.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use depcache_core::{
    exact_query, Digest, EngineConfig, Manifest, QueryError, Response, Tag, TagQuery,
};

/// How [`DependencyTracker::record_resource`] classifies fetched resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerPolicy {
    /// Addressable root, without a trailing slash.
    pub base_url: String,
    pub immutable_min_age: Duration,
    pub excluded_is_volatile: bool,
}

impl TrackerPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            immutable_min_age: config.immutable_min_age,
            excluded_is_volatile: config.excluded_is_volatile,
        }
    }

    /// Manifest path for `url`, or `None` if it lies outside the root.
    ///
    /// The query string and fragment are dropped.
    pub fn local_path<'u>(&self, url: &'u str) -> Option<&'u str> {
        let rest = url.strip_prefix(self.base_url.as_str())?;
        if !rest.starts_with('/') {
            return None;
        }
        let end = rest.find(['?', '#']).unwrap_or(rest.len());
        Some(&rest[..end])
    }
}

#[derive(Debug)]
struct TrackerState {
    cacheable: bool,
    tags: Vec<Tag>,
}

#[derive(Debug)]
struct TrackerInner {
    manifest: Arc<Manifest>,
    policy: Arc<TrackerPolicy>,
    state: Mutex<TrackerState>,
}

/// Records the manifest dependencies of one computation.
///
/// Cloning yields another handle to the same tracker.
#[derive(Debug, Clone)]
pub struct DependencyTracker {
    inner: Arc<TrackerInner>,
}

impl DependencyTracker {
    pub fn new(manifest: Arc<Manifest>, policy: Arc<TrackerPolicy>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                manifest,
                policy,
                state: Mutex::new(TrackerState {
                    cacheable: true,
                    tags: Vec::new(),
                }),
            }),
        }
    }

    /// A fresh tracker for a nested computation, bound to the same snapshot.
    pub fn child(&self) -> Self {
        Self::new(
            Arc::clone(&self.inner.manifest),
            Arc::clone(&self.inner.policy),
        )
    }

    /// The manifest snapshot this tracker validates against.
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.inner.manifest
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a tag for `query` and return the matching paths in manifest
    /// order.
    pub fn query_manifest(&self, query: &str) -> Result<Vec<String>, QueryError> {
        let parsed = TagQuery::parse(query)?;
        let matching: Vec<String> = parsed
            .matching(&self.inner.manifest)
            .into_iter()
            .map(|entry| entry.path.clone())
            .collect();
        let digest = parsed.digest(&self.inner.manifest);
        self.state().tags.push(Tag::new(query, digest));
        Ok(matching)
    }

    /// Record a fetched resource as a dependency.
    ///
    /// Long-lived resources are ignored. Resources the manifest cannot
    /// describe make the tracker volatile. A `404` is recorded as an absent
    /// tag so that the resource appearing later invalidates the result.
    pub fn record_resource(&self, response: &Response) {
        if self.is_volatile() {
            return;
        }

        let policy = &self.inner.policy;
        if response
            .cache_control()
            .is_long_lived(policy.immutable_min_age)
        {
            tracing::trace!(url = %response.url, "ignoring long-lived resource");
            return;
        }

        let local = match policy.local_path(&response.url) {
            Some(local) => local,
            None => {
                self.volatile_because(&response.url, "outside the addressable root");
                return;
            }
        };

        if self.inner.manifest.is_excluded(local) {
            if policy.excluded_is_volatile {
                self.volatile_because(&response.url, "excluded from the manifest");
            }
            return;
        }

        if response.is_not_found() {
            self.state()
                .tags
                .push(Tag::new(exact_query(local), Digest::absent()));
            return;
        }

        match response.version() {
            Some(version) => {
                let digest = Digest::of_resource(local, &version);
                self.state().tags.push(Tag::new(exact_query(local), digest));
            }
            None => self.volatile_because(&response.url, "no version identifier"),
        }
    }

    /// Make this tracker permanently uncacheable.
    pub fn mark_volatile(&self) {
        let mut state = self.state();
        if state.cacheable {
            tracing::debug!("tracker marked volatile");
            state.cacheable = false;
        }
    }

    pub(crate) fn volatile_because(&self, subject: &str, reason: &'static str) {
        let mut state = self.state();
        if state.cacheable {
            tracing::debug!(subject, reason, "tracker became volatile");
            state.cacheable = false;
        }
    }

    pub fn is_volatile(&self) -> bool {
        !self.state().cacheable
    }

    /// Append tags recorded elsewhere, e.g. by a nested computation or a
    /// cache hit.
    pub fn add_tags<I: IntoIterator<Item = Tag>>(&self, tags: I) {
        self.state().tags.extend(tags);
    }

    /// Tags recorded so far, in recording order.
    pub fn tags(&self) -> Vec<Tag> {
        self.state().tags.clone()
    }

    /// The tag list to persist with a result, or `None` if the result must
    /// not be stored.
    pub fn serialize(&self) -> Option<Vec<Tag>> {
        let state = self.state();
        if state.cacheable {
            Some(state.tags.clone())
        } else {
            None
        }
    }

    /// Merge this tracker into `parent`: tags are appended and volatility
    /// carries over.
    pub fn merge_into(&self, parent: &DependencyTracker) {
        if Arc::ptr_eq(&self.inner, &parent.inner) {
            return;
        }
        let (cacheable, tags) = {
            let state = self.state();
            (state.cacheable, state.tags.clone())
        };
        parent.add_tags(tags);
        if !cacheable {
            parent.volatile_because("nested computation", "nested tracker is volatile");
        }
    }
}
