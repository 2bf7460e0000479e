//! Shared setup for engine integration tests
//!
//! Everything runs against `MemoryCluster`, wired through the same `Dialer`
//! seam the Redis backend uses.

#![allow(dead_code)]

use fleetstore_core::{DbConf, DriverResult, RetryConfig, ServerAddr, StoreKind};
use fleetstore_engine::{ConnPool, StoreManager};
use fleetstore_storage::{Dialer, MasterSwitch, MemoryCluster, StoreConnection, WriteOp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const READ_HOST: &str = "redis";
pub const MASTER_A: &str = "10.0.0.1";
pub const MASTER_B: &str = "10.0.0.2";
pub const STORE_PORT: u16 = 6379;
pub const SENTINEL_HOST: &str = "sentinel";
pub const SENTINEL_PORT: u16 = 26379;
pub const MASTER_SET: &str = "mymaster";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn quick_retry() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(3)
        .with_interval(Duration::from_millis(5))
}

pub fn addr(host: &str, port: u16) -> ServerAddr {
    ServerAddr::new(host, port)
}

/// Spin until `cond` holds, failing the test after five seconds
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Test deployment plus the manager that talks to it
pub struct Harness {
    pub cluster: Arc<MemoryCluster>,
    pub manager: StoreManager,
}

impl Harness {
    pub fn pool(&self) -> Arc<ConnPool> {
        self.manager.get_connection(StoreKind::InMemory).unwrap()
    }
}

fn standalone_conf() -> DbConf {
    DbConf {
        in_memory_host: READ_HOST.to_string(),
        in_memory_port: STORE_PORT,
        on_disk_host: READ_HOST.to_string(),
        on_disk_port: STORE_PORT + 1,
        ..DbConf::default()
    }
}

/// Both stores on single nodes, no Sentinel
pub fn standalone() -> Harness {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    cluster.add_node(&addr(READ_HOST, STORE_PORT));
    cluster.add_node(&addr(READ_HOST, STORE_PORT + 1));
    let manager = StoreManager::with_dialer(&standalone_conf(), cluster.clone()).with_retry(quick_retry());
    Harness { cluster, manager }
}

/// HA configuration tracking `master_set` through the test Sentinel
pub fn ha_conf(master_set: &str) -> DbConf {
    DbConf {
        redis_ha_enabled: true,
        in_memory_sentinel_host: SENTINEL_HOST.to_string(),
        in_memory_sentinel_port: SENTINEL_PORT,
        in_memory_primary_set: master_set.to_string(),
        on_disk_sentinel_host: SENTINEL_HOST.to_string(),
        on_disk_sentinel_port: SENTINEL_PORT,
        on_disk_primary_set: master_set.to_string(),
        ..standalone_conf()
    }
}

/// Master A with replica B, reads through a third replica at the static
/// address, and a Sentinel naming A as master of `MASTER_SET`
pub fn replicated(master_set: &str) -> Harness {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    let master = addr(MASTER_A, STORE_PORT);
    cluster.add_node(&master);
    cluster.add_replica(&addr(MASTER_B, STORE_PORT), &master);
    cluster.add_replica(&addr(READ_HOST, STORE_PORT), &master);
    cluster.set_sentinel_master(&addr(SENTINEL_HOST, SENTINEL_PORT), MASTER_SET, Some(master));
    let manager = StoreManager::with_dialer(&ha_conf(master_set), cluster.clone()).with_retry(quick_retry());
    Harness { cluster, manager }
}

// ============================================================================
// Interference injection
// ============================================================================

/// Writes queued here are applied by another client just before the next
/// `exec` on any connection
pub type Interference = Arc<Mutex<Vec<WriteOp>>>;

struct InterferingDialer {
    cluster: Arc<MemoryCluster>,
    pending: Interference,
    gets: Arc<AtomicUsize>,
}

impl Dialer for InterferingDialer {
    fn dial(&self, addr: &ServerAddr) -> DriverResult<Box<dyn StoreConnection>> {
        Ok(Box::new(InterferingConnection {
            inner: self.cluster.dial(addr)?,
            cluster: self.cluster.clone(),
            addr: addr.clone(),
            pending: self.pending.clone(),
            gets: self.gets.clone(),
        }))
    }
}

struct InterferingConnection {
    inner: Box<dyn StoreConnection>,
    cluster: Arc<MemoryCluster>,
    addr: ServerAddr,
    pending: Interference,
    gets: Arc<AtomicUsize>,
}

impl StoreConnection for InterferingConnection {
    fn ping(&mut self) -> DriverResult<()> {
        self.inner.ping()
    }
    fn get(&mut self, key: &str) -> DriverResult<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }
    fn mget(&mut self, keys: &[String]) -> DriverResult<Vec<Option<String>>> {
        self.inner.mget(keys)
    }
    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<()> {
        self.inner.set(key, value, ttl)
    }
    fn del(&mut self, keys: &[String]) -> DriverResult<u64> {
        self.inner.del(keys)
    }
    fn keys(&mut self, pattern: &str) -> DriverResult<Vec<String>> {
        self.inner.keys(pattern)
    }
    fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> DriverResult<(u64, Vec<String>)> {
        self.inner.scan(cursor, pattern, count)
    }
    fn incr_by(&mut self, key: &str, delta: i64) -> DriverResult<i64> {
        self.inner.incr_by(key, delta)
    }
    fn ttl(&mut self, key: &str) -> DriverResult<i64> {
        self.inner.ttl(key)
    }
    fn zadd(&mut self, index: &str, score: f64, member: &str) -> DriverResult<u64> {
        self.inner.zadd(index, score, member)
    }
    fn zscan(
        &mut self,
        index: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> DriverResult<(u64, Vec<(String, f64)>)> {
        self.inner.zscan(index, cursor, pattern, count)
    }
    fn zrange(&mut self, index: &str, start: i64, stop: i64) -> DriverResult<Vec<String>> {
        self.inner.zrange(index, start, stop)
    }
    fn zrangebyscore(&mut self, index: &str, min: f64, max: f64) -> DriverResult<Vec<String>> {
        self.inner.zrangebyscore(index, min, max)
    }
    fn zrem(&mut self, index: &str, members: &[String]) -> DriverResult<u64> {
        self.inner.zrem(index, members)
    }
    fn zcount(&mut self, index: &str, min: f64, max: f64) -> DriverResult<u64> {
        self.inner.zcount(index, min, max)
    }
    fn sadd(&mut self, key: &str, member: &str) -> DriverResult<u64> {
        self.inner.sadd(key, member)
    }
    fn srem(&mut self, key: &str, member: &str) -> DriverResult<u64> {
        self.inner.srem(key, member)
    }
    fn smembers(&mut self, key: &str) -> DriverResult<Vec<String>> {
        self.inner.smembers(key)
    }
    fn watch(&mut self, keys: &[String]) -> DriverResult<()> {
        self.inner.watch(keys)
    }
    fn unwatch(&mut self) -> DriverResult<()> {
        self.inner.unwatch()
    }
    fn exec(&mut self, ops: &[WriteOp]) -> DriverResult<bool> {
        let injected: Vec<WriteOp> = std::mem::take(&mut *self.pending.lock());
        if !injected.is_empty() {
            self.cluster.dial(&self.addr)?.exec(&injected)?;
        }
        self.inner.exec(ops)
    }
    fn flushall(&mut self) -> DriverResult<()> {
        self.inner.flushall()
    }
    fn config_set(&mut self, parameter: &str, value: &str) -> DriverResult<()> {
        self.inner.config_set(parameter, value)
    }
    fn sentinel_master_addr(&mut self, master_set: &str) -> DriverResult<Option<(String, String)>> {
        self.inner.sentinel_master_addr(master_set)
    }
    fn follow_switch_master(
        &mut self,
        poll: Duration,
        on_event: &mut dyn FnMut(Option<MasterSwitch>) -> bool,
    ) -> DriverResult<()> {
        self.inner.follow_switch_master(poll, on_event)
    }
}

/// Standalone deployment whose connections apply the returned
/// [`Interference`] right before committing
pub fn interfering() -> (Harness, Interference) {
    let (h, pending, _) = instrumented();
    (h, pending)
}

/// Like [`interfering`], also counting every `GET` sent to any node
pub fn instrumented() -> (Harness, Interference, Arc<AtomicUsize>) {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    cluster.add_node(&addr(READ_HOST, STORE_PORT));
    cluster.add_node(&addr(READ_HOST, STORE_PORT + 1));
    let pending: Interference = Arc::new(Mutex::new(Vec::new()));
    let gets = Arc::new(AtomicUsize::new(0));
    let dialer = Arc::new(InterferingDialer {
        cluster: cluster.clone(),
        pending: pending.clone(),
        gets: gets.clone(),
    });
    let manager = StoreManager::with_dialer(&standalone_conf(), dialer).with_retry(quick_retry());
    (Harness { cluster, manager }, pending, gets)
}
