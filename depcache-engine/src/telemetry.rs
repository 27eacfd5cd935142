//! Tracing subscriber setup.

use depcache_core::{ConfigError, DepcacheResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `DEPCACHE_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "depcache_engine=info,depcache_storage=info";

/// Logging configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `depcache_engine=debug,info`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("DEPCACHE_LOG")
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
            json: std::env::var("DEPCACHE_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Fails with a [`ConfigError`] when the filter does not parse or a global
/// subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> DepcacheResult<()> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: "DEPCACHE_LOG".to_string(),
        value: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| ConfigError::InvalidValue {
        field: "subscriber".to_string(),
        value: "global".to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(filter = %config.filter, json = config.json, "tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_telemetry_config_from_env() {
        let _log = EnvVarGuard::set("DEPCACHE_LOG", None);
        let _json = EnvVarGuard::set("DEPCACHE_LOG_JSON", None);
        assert_eq!(TelemetryConfig::from_env(), TelemetryConfig::default());

        let _log = EnvVarGuard::set("DEPCACHE_LOG", Some("depcache_engine=debug"));
        let _json = EnvVarGuard::set("DEPCACHE_LOG_JSON", Some("1"));
        let config = TelemetryConfig::from_env();
        assert_eq!(config.filter, "depcache_engine=debug");
        assert!(config.json);
    }

    #[test]
    fn test_default_filter_names_each_crate() {
        let filter = EnvFilter::try_new(DEFAULT_LOG_FILTER).expect("default filter should parse");
        let rendered = filter.to_string();
        assert!(rendered.contains("depcache_engine=info"));
        assert!(rendered.contains("depcache_storage=info"));
    }

    #[test]
    fn test_init_tracing_rejects_bad_filter() {
        let config = TelemetryConfig {
            filter: "depcache=loudest".to_string(),
            json: false,
        };
        assert!(init_tracing(&config).is_err());
    }
}
