//! Manifest sources.
//!
//! A source produces one fresh manifest per call. Snapshot sharing and
//! invalidation live in [`crate::loader::ManifestLoader`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use depcache_core::{EngineConfig, Manifest, ManifestError};
use walkdir::{DirEntry, WalkDir};

/// Produces manifest documents.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn load(&self) -> Result<Manifest, ManifestError>;
}

#[async_trait]
impl<M: ManifestSource + ?Sized> ManifestSource for Arc<M> {
    async fn load(&self) -> Result<Manifest, ManifestError> {
        (**self).load().await
    }
}

// ============================================================================
// HTTP SOURCE
// ============================================================================

/// Loads the manifest from the well-known endpoint under the base URL.
#[derive(Debug, Clone)]
pub struct HttpManifestSource {
    client: reqwest::Client,
    url: String,
}

impl HttpManifestSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.manifest_url())
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn load(&self) -> Result<Manifest, ManifestError> {
        let transport = |e: reqwest::Error| ManifestError::Transport {
            url: self.url.clone(),
            reason: e.to_string(),
        };

        let response = self.client.get(&self.url).send().await.map_err(transport)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(ManifestError::Status { status });
        }
        let body = response.bytes().await.map_err(transport)?;
        Manifest::from_json(&body)
    }
}

// ============================================================================
// DIRECTORY SOURCE
// ============================================================================

/// Builds a manifest by scanning a project directory.
///
/// Every regular file becomes `/relative/path -> mtime seconds`. Hidden
/// entries and `node_modules` are skipped. Paths are emitted sorted.
#[derive(Debug, Clone)]
pub struct DirectoryManifestSource {
    root: PathBuf,
    excluded: Vec<String>,
}

impl DirectoryManifestSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excluded: Vec::new(),
        }
    }

    /// Add an exclusion rule (`/prefix/` or `/exact/path`) to every manifest
    /// this source produces.
    pub fn with_excluded(mut self, rule: impl Into<String>) -> Self {
        self.excluded.push(rule.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.') || name == "node_modules")
        .unwrap_or(false)
}

fn summarize(entry: &DirEntry, root: &Path) -> Option<(String, String)> {
    let relative = entry.path().strip_prefix(root).ok()?;
    let mut path = String::new();
    for component in relative.components() {
        path.push('/');
        path.push_str(component.as_os_str().to_str()?);
    }
    let modified = entry.metadata().ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some((path, secs.to_string()))
}

fn scan(root: &Path, excluded: &[String]) -> Result<Manifest, ManifestError> {
    if !root.is_dir() {
        return Err(ManifestError::Scan {
            root: root.display().to_string(),
            reason: "not a directory".to_string(),
        });
    }

    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
        .filter_map(|e| e.ok());
    for entry in walker {
        if entry.file_type().is_file() {
            if let Some((path, version)) = summarize(&entry, root) {
                files.insert(path, version);
            }
        }
    }
    Ok(Manifest::from_entries(files, excluded))
}

#[async_trait]
impl ManifestSource for DirectoryManifestSource {
    async fn load(&self) -> Result<Manifest, ManifestError> {
        let root = self.root.clone();
        let excluded = self.excluded.clone();
        tokio::task::spawn_blocking(move || scan(&root, &excluded))
            .await
            .map_err(|e| ManifestError::Scan {
                root: self.root.display().to_string(),
                reason: e.to_string(),
            })?
    }
}

// ============================================================================
// STATIC SOURCE
// ============================================================================

/// In-memory manifest source that can be swapped or made to fail.
#[derive(Debug, Default)]
pub struct StaticManifestSource {
    manifest: Mutex<Manifest>,
    failure: Mutex<Option<ManifestError>>,
    loads: AtomicU64,
}

impl StaticManifestSource {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest: Mutex::new(manifest),
            ..Self::default()
        }
    }

    /// Replace the manifest returned by subsequent loads.
    pub fn set(&self, manifest: Manifest) {
        if let Ok(mut current) = self.manifest.lock() {
            *current = manifest;
        }
    }

    /// Make subsequent loads fail with `error`, or succeed again with `None`.
    pub fn set_failure(&self, error: Option<ManifestError>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = error;
        }
    }

    /// Number of times `load` has been called.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for StaticManifestSource {
    async fn load(&self) -> Result<Manifest, ManifestError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(error) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(error);
        }
        Ok(self
            .manifest
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_source_skips_hidden_and_node_modules() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("app/components")).expect("mkdir");
        std::fs::create_dir_all(root.join("node_modules/lodash")).expect("mkdir");
        std::fs::create_dir_all(root.join(".git")).expect("mkdir");
        std::fs::write(root.join("index.html"), "<html>").expect("write");
        std::fs::write(root.join("app/components/foo.js"), "x").expect("write");
        std::fs::write(root.join("node_modules/lodash/index.js"), "x").expect("write");
        std::fs::write(root.join(".git/HEAD"), "x").expect("write");
        std::fs::write(root.join(".env"), "x").expect("write");

        let source = DirectoryManifestSource::new(root).with_excluded("/deps/");
        let manifest = source.load().await.expect("scan should succeed");

        let paths: Vec<&str> = manifest.entries().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/app/components/foo.js", "/index.html"]);
        assert!(manifest.is_excluded("/deps/anything.js"));
        let version = manifest
            .version_of("/index.html")
            .expect("index.html should be listed");
        assert!(version.parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_directory_source_missing_root() {
        let source = DirectoryManifestSource::new("/definitely/not/here/depcache");
        let err = source.load().await.unwrap_err();
        assert!(matches!(err, ManifestError::Scan { .. }));
    }

    #[tokio::test]
    async fn test_static_source_set_and_fail() {
        let source = StaticManifestSource::new(Manifest::from_entries(
            [("/a", "1")],
            Vec::<String>::new(),
        ));
        assert_eq!(source.load().await.expect("load").version_of("/a"), Some("1"));

        source.set(Manifest::from_entries([("/a", "2")], Vec::<String>::new()));
        assert_eq!(source.load().await.expect("load").version_of("/a"), Some("2"));

        source.set_failure(Some(ManifestError::Status { status: 500 }));
        assert_eq!(
            source.load().await.unwrap_err(),
            ManifestError::Status { status: 500 }
        );
        assert_eq!(source.loads(), 3);
    }

    #[test]
    fn test_http_source_url_from_config() {
        let source = HttpManifestSource::from_config(&EngineConfig::new("http://app.test/"));
        assert_eq!(source.url(), "http://app.test/manifest");
    }
}
