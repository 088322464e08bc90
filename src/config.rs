//! Configuration management for Ratekeeper.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatekeeperError, Result};
use crate::mesh::ClusterConfig;
use crate::ratelimit::Strategy;

/// Name of the cache used when none is configured.
pub const DEFAULT_CACHE: &str = "default";

/// Prefix of environment variables overriding file configuration,
/// e.g. `RATEKEEPER__DEFAULT_STRATEGY=moving-window`.
const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Cache whose store backs limiters that do not name one
    #[serde(default)]
    pub default_cache: Option<String>,

    /// Strategy used when a limit does not choose one
    #[serde(default)]
    pub default_strategy: Strategy,

    /// Named counter store backends
    #[serde(default)]
    pub caches: HashMap<String, CacheConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend of a named cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Process-local counters
    Memory {
        /// Purge expired counters this often (seconds); lazy expiry only if unset
        #[serde(default)]
        sweep_interval_secs: Option<u64>,
    },
    /// A single Redis node
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1:6379`
        url: String,
    },
    /// Counters gossiped across a chitchat mesh
    Cluster(ClusterConfig),
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memory {
            sweep_interval_secs: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then apply
    /// `RATEKEEPER__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let config: RatekeeperConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the default cache, if set, names a known cache.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.default_cache {
            self.cache(name)?;
        }
        Ok(())
    }

    /// Name of the cache backing limiters that do not choose one.
    pub fn default_cache_name(&self) -> &str {
        self.default_cache.as_deref().unwrap_or(DEFAULT_CACHE)
    }

    /// Look up a cache by name. The `default` cache is an in-memory store
    /// unless configured otherwise.
    pub fn cache(&self, name: &str) -> Result<CacheConfig> {
        match self.caches.get(name) {
            Some(cache) => Ok(cache.clone()),
            None if name == DEFAULT_CACHE => Ok(CacheConfig::default()),
            None => Err(RatekeeperError::Config(format!("Unknown cache: {}", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = RatekeeperConfig::default();
        assert_eq!(config.default_strategy, Strategy::FixedWindow);
        assert_eq!(config.default_cache_name(), DEFAULT_CACHE);
        assert_eq!(config.cache(DEFAULT_CACHE).unwrap(), CacheConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
default_cache: shared
default_strategy: moving-window
caches:
  local:
    backend: memory
    sweep_interval_secs: 30
  shared:
    backend: redis
    url: redis://cache.internal:6379
  mesh:
    backend: cluster
    node_id: node-a
    listen_addr: 0.0.0.0:7946
    advertise_addr: 10.0.0.5:7946
    seed_nodes: ["10.0.0.6:7946"]
    gossip_interval: 200
logging:
  level: debug
  json: true
"#;
        let config = RatekeeperConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.default_cache_name(), "shared");
        assert_eq!(config.default_strategy, Strategy::MovingWindow);
        assert_eq!(
            config.cache("local").unwrap(),
            CacheConfig::Memory {
                sweep_interval_secs: Some(30)
            }
        );
        assert_eq!(
            config.cache("shared").unwrap(),
            CacheConfig::Redis {
                url: "redis://cache.internal:6379".to_string()
            }
        );
        match config.cache("mesh").unwrap() {
            CacheConfig::Cluster(cluster) => {
                assert_eq!(cluster.node_id, "node-a");
                assert_eq!(cluster.seed_nodes, vec!["10.0.0.6:7946".to_string()]);
                assert_eq!(cluster.gossip_interval, Duration::from_millis(200));
            }
            other => panic!("expected cluster cache, got {:?}", other),
        }
        assert!(config.logging.json);
    }

    #[test]
    fn test_unknown_default_cache_rejected() {
        let err = RatekeeperConfig::from_yaml("default_cache: nowhere\n").unwrap_err();
        assert!(matches!(err, RatekeeperError::Config(_)));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(RatekeeperConfig::from_yaml("default_strategy: leaky-bucket\n").is_err());
    }

    #[test]
    fn test_unknown_cache_lookup() {
        let config = RatekeeperConfig::default();
        assert!(config.cache("missing").is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("ratekeeper-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "default_strategy: fixed-window-elastic-expiry\n").unwrap();

        let config = RatekeeperConfig::from_file(&path).unwrap();
        assert_eq!(config.default_strategy, Strategy::FixedWindowElasticExpiry);

        let layered = RatekeeperConfig::load(Some(&path)).unwrap();
        assert_eq!(layered.default_strategy, Strategy::FixedWindowElasticExpiry);

        std::fs::remove_file(&path).unwrap();
    }
}
