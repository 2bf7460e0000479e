//! Master discovery, write-pool invalidation and rebuild

mod common;

use common::*;
use fleetstore_core::{DbConf, DriverResult, ErrorCode, ServerAddr, StoreConfig, StoreKind};
use fleetstore_engine::StoreManager;
use fleetstore_storage::{Dialer, MemoryCluster, StoreConnection};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_ha_write_pool_targets_sentinel_master() {
    let h = replicated(MASTER_SET);
    let pool = h.pool();
    assert!(pool.has_write_pool());
    assert_eq!(pool.master_ip(), MASTER_A);
    assert_eq!(pool.read_pool().addr(), &addr(READ_HOST, STORE_PORT));

    pool.create("System", "s1", &json!({"v": 1})).unwrap();
    assert!(pool.read("System", "s1").is_ok());
    assert!(h.cluster.dial_count(&addr(MASTER_A, STORE_PORT)) >= 1);
    assert_eq!(h.cluster.dial_count(&addr(MASTER_B, STORE_PORT)), 0);
}

#[test]
fn test_failover_invalidates_then_rebuilds_write_pool() {
    let h = replicated(MASTER_SET);
    let pool = h.pool();
    pool.create("System", "s1", &json!({"v": 1})).unwrap();
    let first_update = pool.pool_updated_at().unwrap();

    // master A dies, Sentinel promotes B
    h.cluster.set_node_up(&addr(MASTER_A, STORE_PORT), false);
    h.cluster
        .set_sentinel_master(&addr(SENTINEL_HOST, SENTINEL_PORT), MASTER_SET, Some(addr(MASTER_B, STORE_PORT)));

    let err = pool.upsert("System", "s2", &json!({"v": 2})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    assert!(!pool.has_write_pool());

    // reads keep working on the static address
    assert!(pool.read("System", "s1").is_ok());

    // the next write rebuilds against the new master
    pool.upsert("System", "s2", &json!({"v": 2})).unwrap();
    assert!(pool.has_write_pool());
    assert_eq!(pool.master_ip(), MASTER_B);
    assert!(pool.pool_updated_at().unwrap() >= first_update);
    assert!(pool.read("System", "s2").is_ok());
}

#[test]
fn test_get_connection_rebuilds_empty_write_pool() {
    let h = replicated(MASTER_SET);
    let pool = h.pool();
    pool.invalidate_write_pool();
    assert!(!pool.has_write_pool());

    let again = h.manager.get_connection(StoreKind::InMemory).unwrap();
    assert!(Arc::ptr_eq(&pool, &again));
    assert!(again.has_write_pool());
}

#[test]
fn test_reset_write_pools_forces_rediscovery() {
    let h = replicated(MASTER_SET);
    let pool = h.pool();
    h.cluster
        .set_sentinel_master(&addr(SENTINEL_HOST, SENTINEL_PORT), MASTER_SET, Some(addr(MASTER_B, STORE_PORT)));
    h.manager.reset_write_pools();
    assert!(!pool.has_write_pool());

    pool.ping().unwrap();
    assert_eq!(pool.master_ip(), MASTER_B);
}

#[test]
fn test_master_set_mismatch_leaves_write_pool_empty() {
    let h = replicated("unknown-set");
    let pool = h.pool();
    assert!(!pool.has_write_pool());
    assert!(pool.master_ip().is_empty());

    // reads still work, writes fail cleanly
    assert!(pool.read("System", "absent").unwrap_err().is_not_found());
    let err = pool.upsert("System", "s1", &json!({})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConnectionFailed);
}

#[test]
fn test_unreachable_sentinel_fails_connect() {
    init_tracing();
    let cluster = Arc::new(fleetstore_storage::MemoryCluster::new());
    cluster.add_node(&addr(READ_HOST, STORE_PORT));
    let manager = StoreManager::with_dialer(&ha_conf(MASTER_SET), cluster).with_retry(quick_retry());
    let err = manager.get_connection(StoreKind::InMemory).unwrap_err();
    assert_eq!(err.code(), ErrorCode::UndefinedErrorType);
}

#[test]
fn test_manager_reuses_pools_per_kind() {
    let h = standalone();
    let a = h.manager.get_connection(StoreKind::InMemory).unwrap();
    let b = h.manager.get_connection(StoreKind::InMemory).unwrap();
    let c = h.manager.get_connection(StoreKind::OnDisk).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(c.kind(), StoreKind::OnDisk);

    // the two stores are separate keyspaces
    a.upsert("T", "k", &json!(1)).unwrap();
    assert!(c.find_or_null("T", "k").unwrap().is_none());
}

#[test]
fn test_with_store_overrides_config() {
    init_tracing();
    let cluster = Arc::new(fleetstore_storage::MemoryCluster::new());
    cluster.add_node(&addr("elsewhere", 7000));
    let manager = StoreManager::with_dialer(&DbConf::default(), cluster)
        .with_store(StoreKind::OnDisk, StoreConfig::standalone("elsewhere", 7000))
        .with_retry(quick_retry());
    let pool = manager.get_connection(StoreKind::OnDisk).unwrap();
    assert_eq!(pool.master_ip(), "elsewhere");
    pool.ping().unwrap();
}

// ============================================================================
// Concurrent rebuild
// ============================================================================

#[test]
fn test_concurrent_rebuilders_query_sentinel_once() {
    let h = replicated(MASTER_SET);
    let pool = h.pool();
    let sentinel = addr(SENTINEL_HOST, SENTINEL_PORT);
    pool.invalidate_write_pool();
    let before = h.cluster.dial_count(&sentinel);

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                pool.rebuild_write_pool()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert!(pool.has_write_pool());
    assert_eq!(h.cluster.dial_count(&sentinel) - before, 1);
}

/// Holds dials to one address until the gate is released
struct GatedDialer {
    cluster: Arc<MemoryCluster>,
    gated: ServerAddr,
    gate: Arc<Mutex<()>>,
    waiting: Arc<AtomicBool>,
}

impl Dialer for GatedDialer {
    fn dial(&self, addr: &ServerAddr) -> DriverResult<Box<dyn StoreConnection>> {
        if *addr == self.gated {
            self.waiting.store(true, Ordering::SeqCst);
            drop(self.gate.lock());
        }
        self.cluster.dial(addr)
    }
}

#[test]
fn test_slow_sentinel_does_not_block_other_store() {
    init_tracing();
    let cluster = Arc::new(MemoryCluster::new());
    let sentinel = addr("slow-sentinel", SENTINEL_PORT);
    cluster.add_node(&addr(READ_HOST, STORE_PORT));
    cluster.add_node(&addr(READ_HOST, STORE_PORT + 1));
    cluster.add_node(&addr(MASTER_A, STORE_PORT));
    cluster.set_sentinel_master(&sentinel, MASTER_SET, Some(addr(MASTER_A, STORE_PORT)));

    let gate = Arc::new(Mutex::new(()));
    let waiting = Arc::new(AtomicBool::new(false));
    let dialer = Arc::new(GatedDialer {
        cluster: cluster.clone(),
        gated: sentinel.clone(),
        gate: gate.clone(),
        waiting: waiting.clone(),
    });
    let manager = Arc::new(
        StoreManager::with_dialer(&DbConf::default(), dialer)
            .with_store(
                StoreKind::InMemory,
                StoreConfig::standalone(READ_HOST, STORE_PORT).with_sentinel("slow-sentinel", SENTINEL_PORT, MASTER_SET),
            )
            .with_store(StoreKind::OnDisk, StoreConfig::standalone(READ_HOST, STORE_PORT + 1))
            .with_retry(quick_retry()),
    );

    let held = gate.lock();
    let slow = {
        let manager = manager.clone();
        thread::spawn(move || manager.get_connection(StoreKind::InMemory).map(|_| ()))
    };
    wait_until(|| waiting.load(Ordering::SeqCst));

    let (tx, rx) = mpsc::channel();
    {
        let manager = manager.clone();
        thread::spawn(move || {
            let _ = tx.send(manager.get_connection(StoreKind::OnDisk).map(|p| p.kind()));
        });
    }
    let on_disk = rx.recv_timeout(Duration::from_secs(2));

    drop(held);
    slow.join().unwrap().unwrap();
    assert_eq!(on_disk.unwrap().unwrap(), StoreKind::OnDisk);
}

// ============================================================================
// Failover monitor
// ============================================================================

#[test]
fn test_switch_master_announcement_resets_write_pools() {
    let Harness { cluster, manager } = replicated(MASTER_SET);
    let manager = Arc::new(manager);
    let sentinel = addr(SENTINEL_HOST, SENTINEL_PORT);
    let memory = manager.get_connection(StoreKind::InMemory).unwrap();
    let disk = manager.get_connection(StoreKind::OnDisk).unwrap();
    assert_eq!(memory.master_ip(), MASTER_A);

    let monitor = manager.monitor_failover().unwrap();
    // both stores share the Sentinel and master set
    assert_eq!(monitor.watched(), 1);
    wait_until(|| cluster.switch_subscribers(&sentinel) == 1);

    assert_eq!(cluster.switch_master(&sentinel, MASTER_SET, addr(MASTER_B, STORE_PORT)), 1);
    wait_until(|| !memory.has_write_pool() && !disk.has_write_pool());

    memory.upsert("System", "s1", &json!({"v": 1})).unwrap();
    assert_eq!(memory.master_ip(), MASTER_B);

    monitor.stop();
    assert_eq!(cluster.switch_subscribers(&sentinel), 0);
}

#[test]
fn test_switch_for_other_master_set_is_ignored() {
    let Harness { cluster, manager } = replicated(MASTER_SET);
    let manager = Arc::new(manager);
    let sentinel = addr(SENTINEL_HOST, SENTINEL_PORT);
    let memory = manager.get_connection(StoreKind::InMemory).unwrap();

    let monitor = manager.monitor_failover().unwrap();
    wait_until(|| cluster.switch_subscribers(&sentinel) == 1);
    cluster.switch_master(&sentinel, "other-set", addr(MASTER_B, STORE_PORT));
    thread::sleep(Duration::from_millis(50));
    assert!(memory.has_write_pool());
    drop(monitor);
}

#[test]
fn test_failover_monitor_resubscribes_after_sentinel_restart() {
    let Harness { cluster, manager } = replicated(MASTER_SET);
    let manager = Arc::new(manager);
    let sentinel = addr(SENTINEL_HOST, SENTINEL_PORT);
    let memory = manager.get_connection(StoreKind::InMemory).unwrap();

    let _monitor = manager.monitor_failover().unwrap();
    wait_until(|| cluster.switch_subscribers(&sentinel) == 1);

    cluster.set_node_up(&sentinel, false);
    wait_until(|| cluster.switch_subscribers(&sentinel) == 0);
    cluster.set_node_up(&sentinel, true);
    wait_until(|| cluster.switch_subscribers(&sentinel) == 1);

    cluster.switch_master(&sentinel, MASTER_SET, addr(MASTER_B, STORE_PORT));
    wait_until(|| !memory.has_write_pool());
}

#[test]
fn test_failover_monitor_is_inert_without_ha() {
    let h = standalone();
    let manager = Arc::new(h.manager);
    let monitor = manager.monitor_failover().unwrap();
    assert_eq!(monitor.watched(), 0);
    monitor.stop();
}
