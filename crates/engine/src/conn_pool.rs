//! Per-store connection pools with a hot-swappable write pool
//!
//! A [`ConnPool`] pairs an immutable read pool (always the static
//! host:port) with a write pool that points at the current master. When HA
//! is enabled the master is resolved through Sentinel.
//!
//! Any write-path error classified as a connection failure clears the write
//! pool handle. The next write (or [`crate::StoreManager::get_connection`])
//! that observes it empty rebuilds it under `rebuild_lock`, re-checking
//! emptiness after taking the lock so concurrent rebuilders do the work once.
//!
//! Invalidation only unlinks the handle. Callers already holding the old
//! pool keep using it until they let go, and a checkout failure on such a
//! stale pool never unlinks its replacement.

use chrono::{DateTime, Utc};
use fleetstore_core::{
    DriverError, PoolConfig, RetryConfig, ServerAddr, StoreConfig, StoreError, StoreKind,
    StoreResult,
};
use fleetstore_storage::{
    resolve_master, retry_resolve_master, ConnectionPool, Dialer, PooledConnection,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{info, warn};

/// Prefix for failed reads
pub(crate) const READ_ERR: &str = "error while trying to collect data: ";
/// Prefix for failed writes
pub(crate) const WRITE_ERR: &str = "write to DB failed: ";
/// Prefix for failed index reads
pub(crate) const DATA_RETRIEVAL_ERR: &str = "error while trying to get data: ";
/// Prefix for failed deletes
pub(crate) const DELETE_ERR: &str = "error while trying to delete data: ";

#[derive(Debug, Default)]
struct MasterState {
    ip: String,
    updated_at: Option<DateTime<Utc>>,
}

/// Read pool and write pool for one store kind
pub struct ConnPool {
    kind: StoreKind,
    config: StoreConfig,
    dialer: Arc<dyn Dialer>,
    pool_config: PoolConfig,
    retry: RetryConfig,
    read_pool: ConnectionPool,
    write_pool: RwLock<Option<ConnectionPool>>,
    master: RwLock<MasterState>,
    rebuild_lock: Mutex<()>,
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnPool")
            .field("kind", &self.kind)
            .field("read_pool", &self.read_pool)
            .field("write_pool", &*self.write_pool.read())
            .field("master", &*self.master.read())
            .finish()
    }
}

impl ConnPool {
    /// Build the pools for one store.
    ///
    /// The read pool always targets the static address. With HA enabled the
    /// write pool targets the master named by Sentinel; if Sentinel names
    /// none, the write pool is left empty for a later rebuild. A failed
    /// Sentinel query is an error.
    pub fn connect(
        kind: StoreKind,
        config: StoreConfig,
        dialer: Arc<dyn Dialer>,
        pool_config: PoolConfig,
        retry: RetryConfig,
    ) -> StoreResult<Self> {
        let read_pool = ConnectionPool::new(config.static_addr(), dialer.clone(), pool_config.clone());

        let write_addr = if config.ha_enabled() {
            resolve_master(dialer.as_ref(), &config)?
        } else {
            Some(config.static_addr())
        };

        let pool = Self {
            kind,
            config,
            dialer,
            pool_config,
            retry,
            read_pool,
            write_pool: RwLock::new(None),
            master: RwLock::new(MasterState::default()),
            rebuild_lock: Mutex::new(()),
        };

        match write_addr {
            Some(addr) => pool.install_write_pool(addr),
            None => warn!(
                target: "fleetstore::pool",
                store = %kind,
                master_set = %pool.config.master_set,
                "no master known at startup, write pool left empty"
            ),
        }
        Ok(pool)
    }

    /// Store kind this pool serves
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Configuration this pool was built from
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Host of the master the write pool currently targets
    pub fn master_ip(&self) -> String {
        self.master.read().ip.clone()
    }

    /// When the write pool was last (re)built
    pub fn pool_updated_at(&self) -> Option<DateTime<Utc>> {
        self.master.read().updated_at
    }

    /// Whether a write pool is installed
    pub fn has_write_pool(&self) -> bool {
        self.write_pool.read().is_some()
    }

    /// Read pool handle
    pub fn read_pool(&self) -> &ConnectionPool {
        &self.read_pool
    }

    /// Current write pool handle, or `ConnectionFailed` while it is empty
    pub fn write_pool(&self) -> StoreResult<ConnectionPool> {
        self.write_pool
            .read()
            .clone()
            .ok_or_else(|| StoreError::ConnectionFailed("write pool is not available".to_string()))
    }

    /// Unlink the write pool so the next write rebuilds it
    pub fn invalidate_write_pool(&self) {
        let taken = self.write_pool.write().take();
        if let Some(pool) = taken {
            warn!(
                target: "fleetstore::pool",
                store = %self.kind,
                master = %pool.addr(),
                "write pool invalidated"
            );
        }
    }

    /// Unlink the write pool only if it is still `stale`
    fn invalidate_if_current(&self, stale: &ConnectionPool) {
        let taken = {
            let mut slot = self.write_pool.write();
            match slot.as_ref() {
                Some(current) if current.same_pool(stale) => slot.take(),
                _ => None,
            }
        };
        if let Some(pool) = taken {
            warn!(
                target: "fleetstore::pool",
                store = %self.kind,
                master = %pool.addr(),
                "write pool invalidated"
            );
        }
    }

    /// Re-resolve the master and install a fresh write pool.
    ///
    /// No-op if another caller already rebuilt it. Fails with
    /// `ConnectionFailed` when no master turns up within the retry bound.
    pub fn rebuild_write_pool(&self) -> StoreResult<()> {
        let _guard = self.rebuild_lock.lock();
        if self.has_write_pool() {
            return Ok(());
        }

        let addr = if self.config.ha_enabled() {
            let last_known = self.master_ip();
            retry_resolve_master(&last_known, self.dialer.as_ref(), &self.config, &self.retry)
                .ok_or_else(|| {
                    StoreError::ConnectionFailed(format!(
                        "unable to retrieve master ip from sentinel for {} store",
                        self.kind
                    ))
                })?
        } else {
            self.config.static_addr()
        };

        self.install_write_pool(addr);
        Ok(())
    }

    /// Ping the master
    pub fn ping(&self) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.ping())
            .map_err(|e| self.write_error(e, "error while pinging DB: "))
    }

    fn install_write_pool(&self, addr: ServerAddr) {
        let pool = ConnectionPool::new(addr.clone(), self.dialer.clone(), self.pool_config.clone());
        *self.write_pool.write() = Some(pool);
        let mut master = self.master.write();
        master.ip = addr.host.clone();
        master.updated_at = Some(Utc::now());
        info!(
            target: "fleetstore::pool",
            store = %self.kind,
            master = %addr,
            "write pool ready"
        );
    }

    /// Check out a read connection
    pub(crate) fn read_conn(&self) -> StoreResult<PooledConnection> {
        self.read_pool.get()
    }

    /// Check out a write connection, rebuilding the write pool if it is empty
    pub(crate) fn write_conn(&self) -> StoreResult<PooledConnection> {
        let pool = match self.write_pool() {
            Ok(pool) => pool,
            Err(_) => {
                self.rebuild_write_pool()?;
                self.write_pool()?
            }
        };
        pool.get().map_err(|e| {
            if e.is_connection_failed() {
                self.invalidate_if_current(&pool);
            }
            e
        })
    }

    /// Classify a write-path error, invalidating the write pool on
    /// connection failures
    pub(crate) fn write_error(&self, err: DriverError, context: &str) -> StoreError {
        let err = StoreError::from_driver(err, context);
        if err.is_connection_failed() {
            self.invalidate_write_pool();
        }
        err
    }
}

/// Whether a failed store call is worth retrying.
///
/// True for dropped connections, timeouts, "max number of clients reached"
/// and the `LOADING`, `READONLY`, `MOVED` and `TRYAGAIN` replies.
pub fn is_retriable(err: &DriverError) -> bool {
    const PREFIXES: [&str; 4] = ["LOADING ", "READONLY ", "MOVED ", "TRYAGAIN "];

    if err.is_timeout() {
        return true;
    }
    let text = err.to_string();
    if text == "EOF" || text == "unexpected EOF" || text == "ERR max number of clients reached" {
        return true;
    }
    PREFIXES.iter().any(|p| text.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetstore_storage::MemoryCluster;
    use std::io;
    use std::time::Duration;

    fn quick_retry() -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(3)
            .with_interval(Duration::from_millis(1))
    }

    #[test]
    fn standalone_write_pool_targets_static_address() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node(&ServerAddr::new("127.0.0.1", 6379));
        let pool = ConnPool::connect(
            StoreKind::InMemory,
            StoreConfig::standalone("127.0.0.1", 6379),
            cluster,
            PoolConfig::default(),
            quick_retry(),
        )
        .unwrap();
        assert!(pool.has_write_pool());
        assert_eq!(pool.master_ip(), "127.0.0.1");
        assert!(pool.pool_updated_at().is_some());
        pool.ping().unwrap();
    }

    #[test]
    fn invalidate_then_rebuild() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node(&ServerAddr::new("127.0.0.1", 6379));
        let pool = ConnPool::connect(
            StoreKind::OnDisk,
            StoreConfig::standalone("127.0.0.1", 6379),
            cluster,
            PoolConfig::default(),
            quick_retry(),
        )
        .unwrap();
        pool.invalidate_write_pool();
        assert!(!pool.has_write_pool());
        assert!(pool.write_pool().unwrap_err().is_connection_failed());
        pool.rebuild_write_pool().unwrap();
        assert!(pool.has_write_pool());
    }

    #[test]
    fn stale_write_pool_stays_usable_after_rebuild() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node(&ServerAddr::new("127.0.0.1", 6379));
        let pool = ConnPool::connect(
            StoreKind::InMemory,
            StoreConfig::standalone("127.0.0.1", 6379),
            cluster,
            PoolConfig::default(),
            quick_retry(),
        )
        .unwrap();

        let stale = pool.write_pool().unwrap();
        pool.invalidate_write_pool();
        pool.rebuild_write_pool().unwrap();

        let mut conn = stale.get().unwrap();
        conn.ping().unwrap();
        let fresh = pool.write_pool().unwrap();
        assert!(!fresh.same_pool(&stale));
    }

    #[test]
    fn failed_checkout_on_stale_pool_keeps_replacement() {
        let cluster = Arc::new(MemoryCluster::new());
        let old_master = ServerAddr::new("10.0.0.1", 6379);
        let new_master = ServerAddr::new("10.0.0.2", 6379);
        let sentinel = ServerAddr::new("sentinel", 26379);
        cluster.add_node(&old_master);
        cluster.add_replica(&new_master, &old_master);
        cluster.set_sentinel_master(&sentinel, "mymaster", Some(old_master.clone()));
        let pool = ConnPool::connect(
            StoreKind::InMemory,
            StoreConfig::standalone("10.0.0.1", 6379).with_sentinel("sentinel", 26379, "mymaster"),
            cluster.clone(),
            PoolConfig::default(),
            quick_retry(),
        )
        .unwrap();

        let stale = pool.write_pool().unwrap();
        cluster.set_node_up(&old_master, false);
        cluster.set_sentinel_master(&sentinel, "mymaster", Some(new_master));
        pool.invalidate_write_pool();
        pool.rebuild_write_pool().unwrap();
        assert_eq!(pool.master_ip(), "10.0.0.2");

        assert!(stale.get().err().unwrap().is_connection_failed());
        pool.invalidate_if_current(&stale);
        assert!(pool.has_write_pool());
        pool.ping().unwrap();
    }

    #[test]
    fn retriable_errors() {
        assert!(is_retriable(&DriverError::eof()));
        assert!(is_retriable(&DriverError::Response("LOADING Redis is loading".into())));
        assert!(is_retriable(&DriverError::Response("READONLY You can't write".into())));
        assert!(is_retriable(&DriverError::Response(
            "ERR max number of clients reached".into()
        )));
        assert!(is_retriable(&DriverError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "i/o timeout"
        ))));
        assert!(!is_retriable(&DriverError::Response("ERR syntax error".into())));
        assert!(!is_retriable(&DriverError::refused("127.0.0.1:6379")));
    }
}
