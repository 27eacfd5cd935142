//! Error types for depcache operations

use thiserror::Error;

/// Manifest load errors.
///
/// A load failure is transient: it is never cached as a snapshot and the next
/// access retries from scratch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("error while updating manifest (status {status})")]
    Status { status: u16 },

    #[error("Manifest request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("Manifest document is malformed: {reason}")]
    Decode { reason: String },

    #[error("Failed to scan manifest root {root}: {reason}")]
    Scan { root: String, reason: String },
}

/// Manifest query errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid glob pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Result store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to open store: {reason}")]
    Open { reason: String },

    #[error("Store transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Stored entry for {key} could not be decoded: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Entry for {key} could not be encoded: {reason}")]
    Encode { key: String, reason: String },
}

/// Errors produced by, or on behalf of, a cached computation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ComputeError {
    #[error("Computation for {key} failed: {reason}")]
    Failed { key: String, reason: String },

    #[error("Computation for {key} was abandoned before producing a result")]
    Abandoned { key: String },

    #[error("Cached value for {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Fetch of {url} failed: {reason}")]
    Fetch { url: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all depcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DepcacheError {
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl DepcacheError {
    /// Shorthand for a failed caller computation.
    pub fn compute_failed(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Compute(ComputeError::Failed {
            key: key.into(),
            reason: reason.to_string(),
        })
    }
}

/// Result type alias for depcache operations.
pub type DepcacheResult<T> = Result<T, DepcacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_error_display_status() {
        let err = ManifestError::Status { status: 503 };
        let msg = format!("{}", err);
        assert!(msg.contains("error while updating manifest"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn test_query_error_display_invalid_pattern() {
        let err = QueryError::InvalidPattern {
            pattern: "/app/[".to_string(),
            reason: "unclosed character class".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("/app/["));
        assert!(msg.contains("unclosed"));
    }

    #[test]
    fn test_compute_error_display_type_mismatch() {
        let err = ComputeError::TypeMismatch {
            key: "import-map".to_string(),
            expected: "alloc::string::String",
        };
        let msg = format!("{}", err);
        assert!(msg.contains("import-map"));
        assert!(msg.contains("String"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "base_url".to_string(),
            value: "nope".to_string(),
            reason: "must be an absolute URL".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("base_url"));
        assert!(msg.contains("nope"));
        assert!(msg.contains("absolute URL"));
    }

    #[test]
    fn test_depcache_error_from_variants() {
        let manifest = DepcacheError::from(ManifestError::Status { status: 404 });
        assert!(matches!(manifest, DepcacheError::Manifest(_)));

        let query = DepcacheError::from(QueryError::InvalidPattern {
            pattern: "{".to_string(),
            reason: "unclosed alternation".to_string(),
        });
        assert!(matches!(query, DepcacheError::Query(_)));

        let store = DepcacheError::from(StoreError::TransactionFailed {
            reason: "map full".to_string(),
        });
        assert!(matches!(store, DepcacheError::Store(_)));

        let compute = DepcacheError::from(ComputeError::Abandoned {
            key: "k".to_string(),
        });
        assert!(matches!(compute, DepcacheError::Compute(_)));

        let config = DepcacheError::from(ConfigError::MissingRequired {
            field: "base_url".to_string(),
        });
        assert!(matches!(config, DepcacheError::Config(_)));
    }

    #[test]
    fn test_compute_failed_shorthand() {
        let err = DepcacheError::compute_failed("GET /app.js", "transpile error");
        assert_eq!(
            err,
            DepcacheError::Compute(ComputeError::Failed {
                key: "GET /app.js".to_string(),
                reason: "transpile error".to_string(),
            })
        );
    }
}
