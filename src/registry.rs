//! Process-wide counter store registry.
//!
//! Stores are built from [`RatekeeperConfig`] on first use and memoized per
//! cache name, so every limiter naming the same cache shares one store (and
//! one Redis connection or cluster node). There is no teardown beyond
//! process exit; tests call [`StoreRegistry::reset`] to start over.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::{CacheConfig, RatekeeperConfig};
use crate::error::{RatekeeperError, Result};
use crate::mesh::Cluster;
use crate::ratelimit::{RateLimiter, Strategy};
use crate::store::{ClusterStore, CounterStore, MemoryStore, RedisStore};

type StoreCell = Arc<OnceCell<Arc<dyn CounterStore>>>;

/// Memoizing factory for counter stores.
pub struct StoreRegistry {
    config: RwLock<RatekeeperConfig>,
    explicit_store: RwLock<Option<Arc<dyn CounterStore>>>,
    stores: DashMap<String, StoreCell>,
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("config", &*self.config.read())
            .field("explicit_store", &self.explicit_store.read().as_ref().map(|s| s.name()))
            .field("stores", &self.stores.len())
            .finish()
    }
}

static GLOBAL: OnceLock<StoreRegistry> = OnceLock::new();

/// The process-wide registry, created empty (default configuration) on first access.
pub fn global() -> &'static StoreRegistry {
    GLOBAL.get_or_init(|| StoreRegistry::new(RatekeeperConfig::default()))
}

impl StoreRegistry {
    /// Create a registry for `config`.
    pub fn new(config: RatekeeperConfig) -> Self {
        Self {
            config: RwLock::new(config),
            explicit_store: RwLock::new(None),
            stores: DashMap::new(),
        }
    }

    /// Replace the configuration.
    ///
    /// `explicit_store`, when given, backs every limiter that does not name
    /// a cache, bypassing name-based selection. It cannot be combined with a
    /// configured `default_cache`.
    pub fn configure(
        &self,
        config: RatekeeperConfig,
        explicit_store: Option<Arc<dyn CounterStore>>,
    ) -> Result<()> {
        if config.default_cache.is_some() && explicit_store.is_some() {
            return Err(RatekeeperError::ConfigConflict(
                "default_cache and an explicit store can't be used together".to_string(),
            ));
        }
        config.validate()?;

        info!(
            default_cache = %config.default_cache_name(),
            default_strategy = %config.default_strategy,
            explicit_store = explicit_store.is_some(),
            "Configuring store registry"
        );

        *self.config.write() = config;
        *self.explicit_store.write() = explicit_store;
        self.stores.clear();
        Ok(())
    }

    /// Forget the configuration and every memoized store.
    pub fn reset(&self) {
        *self.config.write() = RatekeeperConfig::default();
        *self.explicit_store.write() = None;
        self.stores.clear();
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> RatekeeperConfig {
        self.config.read().clone()
    }

    /// The strategy limiters use unless told otherwise.
    pub fn default_strategy(&self) -> Strategy {
        self.config.read().default_strategy
    }

    /// The store backing limiters that do not name a cache.
    pub async fn default_store(&self) -> Result<Arc<dyn CounterStore>> {
        let explicit = self.explicit_store.read().clone();
        if let Some(store) = explicit {
            return Ok(store);
        }
        let name = self.config.read().default_cache_name().to_string();
        self.store(&name).await
    }

    /// The store for a named cache, built on first use.
    pub async fn store(&self, name: &str) -> Result<Arc<dyn CounterStore>> {
        let cache = self.config.read().cache(name)?;
        let cell: StoreCell = self.stores.entry(name.to_string()).or_default().clone();

        let store = cell
            .get_or_try_init(|| async {
                debug!(cache = %name, "Building counter store");
                build_store(&cache).await
            })
            .await?;
        Ok(store.clone())
    }

    /// Select a store from either a cache name or an explicit store.
    /// Supplying both is a [`RatekeeperError::ConfigConflict`]; supplying
    /// neither yields the default store.
    pub async fn resolve(
        &self,
        cache: Option<&str>,
        store: Option<Arc<dyn CounterStore>>,
    ) -> Result<Arc<dyn CounterStore>> {
        match (cache, store) {
            (Some(_), Some(_)) => Err(RatekeeperError::ConfigConflict(
                "can't use both cache and store".to_string(),
            )),
            (None, Some(store)) => Ok(store),
            (Some(cache), None) => self.store(cache).await,
            (None, None) => self.default_store().await,
        }
    }

    /// A limiter over the default store, using `strategy` or the configured default.
    pub async fn limiter(&self, strategy: Option<Strategy>) -> Result<RateLimiter> {
        let strategy = strategy.unwrap_or_else(|| self.default_strategy());
        Ok(RateLimiter::new(strategy, self.default_store().await?))
    }
}

/// Construct the store a cache configuration describes.
pub async fn build_store(cache: &CacheConfig) -> Result<Arc<dyn CounterStore>> {
    match cache {
        CacheConfig::Memory {
            sweep_interval_secs,
        } => {
            let store = Arc::new(MemoryStore::new());
            if let Some(secs) = sweep_interval_secs.filter(|secs| *secs > 0) {
                store.spawn_sweeper(Duration::from_secs(secs));
            }
            Ok(store)
        }
        CacheConfig::Redis { url } => Ok(Arc::new(RedisStore::connect(url).await?)),
        CacheConfig::Cluster(config) => {
            let cluster = Cluster::start(config.clone()).await?;
            Ok(Arc::new(ClusterStore::new(Arc::new(cluster))))
        }
    }
}
