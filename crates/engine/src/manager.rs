//! Process-wide access to the two logical stores
//!
//! [`StoreManager`] owns one lazily built [`ConnPool`] per [`StoreKind`].
//! Construct it once at startup and share it; pools are built on the first
//! [`StoreManager::get_connection`] for their kind. Pools are connected
//! outside the registry lock, so a slow Sentinel for one store never holds
//! up the other.

use crate::conn_pool::ConnPool;
use fleetstore_core::{DbConf, PoolConfig, RetryConfig, StoreConfig, StoreError, StoreKind, StoreResult};
use fleetstore_storage::{Dialer, RedisDialer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registry of connection pools, one per store kind
pub struct StoreManager {
    configs: HashMap<StoreKind, StoreConfig>,
    dialers: HashMap<StoreKind, Arc<dyn Dialer>>,
    pool_config: PoolConfig,
    retry: RetryConfig,
    pools: Mutex<HashMap<StoreKind, Arc<ConnPool>>>,
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("configs", &self.configs)
            .field("pool_config", &self.pool_config)
            .field("retry", &self.retry)
            .field("connected", &self.pools.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StoreManager {
    /// Manager for real Redis deployments described by `conf`.
    ///
    /// Each store gets its own dialer carrying that store's password, which
    /// is also used against its Sentinel.
    pub fn from_conf(conf: &DbConf) -> Self {
        let pool_config = conf.pool_config();
        let mut configs = HashMap::new();
        let mut dialers: HashMap<StoreKind, Arc<dyn Dialer>> = HashMap::new();
        for kind in StoreKind::ALL {
            let config = conf.store_config(kind);
            let dialer = RedisDialer::new(pool_config.dial_timeout).with_password(config.password.clone());
            dialers.insert(kind, Arc::new(dialer));
            configs.insert(kind, config);
        }
        Self {
            configs,
            dialers,
            pool_config,
            retry: RetryConfig::default(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Manager that reaches both stores through `dialer`
    pub fn with_dialer(conf: &DbConf, dialer: Arc<dyn Dialer>) -> Self {
        let configs = StoreKind::ALL
            .iter()
            .map(|kind| (*kind, conf.store_config(*kind)))
            .collect();
        let dialers = StoreKind::ALL
            .iter()
            .map(|kind| (*kind, dialer.clone()))
            .collect();
        Self {
            configs,
            dialers,
            pool_config: conf.pool_config(),
            retry: RetryConfig::default(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Override the configuration of one store. Takes effect for pools not
    /// yet built.
    pub fn with_store(mut self, kind: StoreKind, config: StoreConfig) -> Self {
        self.configs.insert(kind, config);
        self
    }

    /// Override the master discovery retry bound
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the pool settings
    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Configuration used for `kind`
    pub fn store_config(&self, kind: StoreKind) -> Option<&StoreConfig> {
        self.configs.get(&kind)
    }

    /// Pools for `kind`, built on first use.
    ///
    /// If the write pool is empty it is rebuilt here. A failed rebuild is
    /// logged and the pool still returned: reads keep working and writes
    /// fail with `ConnectionFailed` until a master is found.
    pub fn get_connection(&self, kind: StoreKind) -> StoreResult<Arc<ConnPool>> {
        let existing = self.pools.lock().get(&kind).cloned();
        let pool = match existing {
            Some(pool) => pool,
            None => {
                let built = Arc::new(self.connect(kind)?);
                let mut pools = self.pools.lock();
                let pool = pools.entry(kind).or_insert_with(|| built.clone()).clone();
                if Arc::ptr_eq(&pool, &built) {
                    info!(target: "fleetstore::manager", store = %kind, "store connected");
                }
                pool
            }
        };

        if !pool.has_write_pool() {
            if let Err(e) = pool.rebuild_write_pool() {
                warn!(
                    target: "fleetstore::manager",
                    store = %kind,
                    error = %e,
                    "write pool unavailable"
                );
            }
        }
        Ok(pool)
    }

    /// Drop every write pool so the next write re-resolves the master
    pub fn reset_write_pools(&self) {
        let pools: Vec<Arc<ConnPool>> = self.pools.lock().values().cloned().collect();
        for pool in pools {
            pool.invalidate_write_pool();
        }
    }

    /// Discovery retry bound in use
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub(crate) fn dialer(&self, kind: StoreKind) -> StoreResult<Arc<dyn Dialer>> {
        self.dialers
            .get(&kind)
            .cloned()
            .ok_or_else(|| StoreError::undefined(format!("no dialer for {} store", kind)))
    }

    fn connect(&self, kind: StoreKind) -> StoreResult<ConnPool> {
        let config = self
            .configs
            .get(&kind)
            .cloned()
            .ok_or_else(|| StoreError::undefined(format!("no configuration for {} store", kind)))?;
        let dialer = self.dialer(kind)?;
        ConnPool::connect(kind, config, dialer, self.pool_config.clone(), self.retry.clone())
    }
}
