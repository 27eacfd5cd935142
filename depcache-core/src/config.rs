//! Engine configuration.
//!
//! Loaded from environment variables with development defaults, or built
//! explicitly with the `with_*` methods.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default name of the synthetic header carrying a stored entry's tag list.
pub const DEFAULT_TAGS_HEADER: &str = "x-manifest-deps";

/// One week: the age at which `cache-control: max-age` marks a resource as
/// long-lived.
pub const DEFAULT_IMMUTABLE_MIN_AGE: Duration = Duration::from_secs(604_800);

// ============================================================================
// STORE CONFIGURATION
// ============================================================================

/// Where stored responses live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory for the LMDB environment. `None` keeps entries in memory.
    pub path: Option<PathBuf>,
    /// LMDB map size in megabytes.
    pub max_size_mb: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_size_mb: 256,
        }
    }
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

/// Configuration for a cache engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Addressable root of the cache. Resources outside it cannot be tracked.
    /// Stored without a trailing slash.
    pub base_url: String,

    /// Path of the manifest endpoint under `base_url`.
    pub manifest_path: String,

    /// `max-age` at or above which a resource is considered immutable.
    pub immutable_min_age: Duration,

    /// Whether resources under an exclusion rule make a tracker volatile
    /// instead of being ignored.
    pub excluded_is_volatile: bool,

    /// Name of the synthetic header holding the serialized tag list.
    pub tags_header: String,

    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            manifest_path: "/manifest".to_string(),
            immutable_min_age: DEFAULT_IMMUTABLE_MIN_AGE,
            excluded_is_volatile: false,
            tags_header: DEFAULT_TAGS_HEADER.to_string(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config rooted at `base_url` with default values elsewhere.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::default().with_base_url(base_url)
    }

    /// Create EngineConfig from environment variables.
    ///
    /// Environment variables:
    /// - `DEPCACHE_BASE_URL`: addressable root (default: http://localhost:8000)
    /// - `DEPCACHE_MANIFEST_PATH`: manifest endpoint path (default: /manifest)
    /// - `DEPCACHE_IMMUTABLE_MIN_AGE_SECS`: long-lived threshold (default: 604800)
    /// - `DEPCACHE_EXCLUDED_IS_VOLATILE`: "true" or "false" (default: false)
    /// - `DEPCACHE_TAGS_HEADER`: synthetic header name (default: x-manifest-deps)
    /// - `DEPCACHE_STORE_PATH`: LMDB directory (default: in-memory store)
    /// - `DEPCACHE_STORE_MAX_MB`: LMDB map size (default: 256)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_url = std::env::var("DEPCACHE_BASE_URL").unwrap_or(defaults.base_url);

        let manifest_path =
            std::env::var("DEPCACHE_MANIFEST_PATH").unwrap_or(defaults.manifest_path);

        let immutable_min_age = std::env::var("DEPCACHE_IMMUTABLE_MIN_AGE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.immutable_min_age);

        let excluded_is_volatile = std::env::var("DEPCACHE_EXCLUDED_IS_VOLATILE")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        let tags_header = std::env::var("DEPCACHE_TAGS_HEADER").unwrap_or(defaults.tags_header);

        let store = StoreConfig {
            path: std::env::var("DEPCACHE_STORE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            max_size_mb: std::env::var("DEPCACHE_STORE_MAX_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.store.max_size_mb),
        };

        Self {
            manifest_path,
            immutable_min_age,
            excluded_is_volatile,
            tags_header,
            store,
            ..Self::default()
        }
        .with_base_url(base_url)
    }

    /// Set the addressable root. A trailing slash is dropped.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_manifest_path(mut self, path: impl Into<String>) -> Self {
        self.manifest_path = path.into();
        self
    }

    pub fn with_immutable_min_age(mut self, age: Duration) -> Self {
        self.immutable_min_age = age;
        self
    }

    pub fn with_excluded_is_volatile(mut self, volatile: bool) -> Self {
        self.excluded_is_volatile = volatile;
        self
    }

    pub fn with_tags_header(mut self, name: impl Into<String>) -> Self {
        self.tags_header = name.into();
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = Some(path.into());
        self
    }

    pub fn with_store_max_size_mb(mut self, max_size_mb: usize) -> Self {
        self.store.max_size_mb = max_size_mb;
        self
    }

    /// Absolute URL of the manifest endpoint.
    pub fn manifest_url(&self) -> String {
        format!("{}{}", self.base_url, self.manifest_path)
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "base_url".to_string(),
            });
        }
        match url::Url::parse(&self.base_url) {
            Ok(parsed) if !parsed.cannot_be_a_base() => {}
            Ok(_) => {
                return Err(ConfigError::InvalidValue {
                    field: "base_url".to_string(),
                    value: self.base_url.clone(),
                    reason: "cannot be used as a base URL".to_string(),
                })
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    field: "base_url".to_string(),
                    value: self.base_url.clone(),
                    reason: e.to_string(),
                })
            }
        }
        if !self.manifest_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "manifest_path".to_string(),
                value: self.manifest_path.clone(),
                reason: "must start with '/'".to_string(),
            });
        }
        if self.tags_header.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "tags_header".to_string(),
            });
        }
        if self.store.path.is_some() && self.store.max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.max_size_mb".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.manifest_url(), "http://localhost:8000/manifest");
        assert_eq!(config.immutable_min_age, Duration::from_secs(604_800));
        assert!(!config.excluded_is_volatile);
        assert!(config.store.path.is_none());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new("https://app.example/")
            .with_manifest_path("/_manifest")
            .with_immutable_min_age(Duration::from_secs(3600))
            .with_excluded_is_volatile(true)
            .with_tags_header("x-deps")
            .with_store_path("/tmp/depcache")
            .with_store_max_size_mb(64);

        assert_eq!(config.base_url, "https://app.example");
        assert_eq!(config.manifest_url(), "https://app.example/_manifest");
        assert_eq!(config.immutable_min_age, Duration::from_secs(3600));
        assert!(config.excluded_is_volatile);
        assert_eq!(config.tags_header, "x-deps");
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/depcache")));
        assert_eq!(config.store.max_size_mb, 64);
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let err = EngineConfig::new("not a url").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "base_url"));

        let err = EngineConfig::new("").validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn test_validate_rejects_relative_manifest_path() {
        let err = EngineConfig::default()
            .with_manifest_path("manifest")
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "manifest_path"));
    }

    #[test]
    fn test_validate_rejects_zero_sized_store() {
        let err = EngineConfig::default()
            .with_store_path("/tmp/x")
            .with_store_max_size_mb(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
