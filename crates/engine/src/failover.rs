//! Sentinel-driven write pool reset
//!
//! [`StoreManager::monitor_failover`] starts one thread per distinct
//! Sentinel and master-set pair. Each thread subscribes to `+switch-master`
//! and, when its master set fails over, drops every write pool so the next
//! write re-resolves the master. A lost subscription is re-established after
//! the manager's retry interval.
//!
//! The threads stop when the returned [`FailoverMonitor`] is stopped or
//! dropped, or once the manager itself is gone.

use crate::manager::StoreManager;
use fleetstore_core::{ServerAddr, StoreError, StoreKind, StoreResult};
use fleetstore_storage::{Dialer, MasterSwitch};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often a subscribed thread wakes up to check for shutdown
pub const SWITCH_MASTER_POLL: Duration = Duration::from_millis(200);

/// Handle to the running failover watchers
///
/// Dropping it stops the watchers and waits for them to exit.
#[derive(Debug)]
pub struct FailoverMonitor {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl FailoverMonitor {
    /// Number of Sentinel subscriptions being maintained
    pub fn watched(&self) -> usize {
        self.threads.len()
    }

    /// Stop the watchers and wait for them to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!(target: "fleetstore::discovery", "failover watcher panicked");
            }
        }
    }
}

impl Drop for FailoverMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SwitchWatcher {
    manager: Weak<StoreManager>,
    dialer: Arc<dyn Dialer>,
    sentinel: ServerAddr,
    master_set: String,
    reconnect: Duration,
    stop: Arc<AtomicBool>,
}

impl SwitchWatcher {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.manager.strong_count() == 0
    }

    fn run(self) {
        info!(
            target: "fleetstore::discovery",
            sentinel = %self.sentinel,
            master_set = %self.master_set,
            "watching for master switch"
        );
        while !self.stopped() {
            match self.dialer.dial(&self.sentinel) {
                Ok(mut conn) => {
                    let result = conn.follow_switch_master(SWITCH_MASTER_POLL, &mut |event| self.on_event(event));
                    if let Err(e) = result {
                        if !self.stopped() {
                            warn!(
                                target: "fleetstore::discovery",
                                sentinel = %self.sentinel,
                                error = %e,
                                "switch-master subscription lost"
                            );
                        }
                    }
                }
                Err(e) => warn!(
                    target: "fleetstore::discovery",
                    sentinel = %self.sentinel,
                    error = %e,
                    "unable to subscribe to sentinel"
                ),
            }
            self.pause();
        }
    }

    /// Returns whether to keep listening
    fn on_event(&self, event: Option<MasterSwitch>) -> bool {
        if let Some(event) = event.filter(|e| e.master_set == self.master_set) {
            let Some(manager) = self.manager.upgrade() else {
                return false;
            };
            info!(
                target: "fleetstore::discovery",
                master_set = %event.master_set,
                old_master = %event.old_master,
                new_master = %event.new_master,
                "master switched, resetting write pools"
            );
            manager.reset_write_pools();
        }
        !self.stopped()
    }

    fn pause(&self) {
        let deadline = Instant::now() + self.reconnect;
        while !self.stopped() && Instant::now() < deadline {
            thread::sleep(SWITCH_MASTER_POLL.min(self.reconnect));
        }
    }
}

impl StoreManager {
    /// Watch every configured Sentinel for `+switch-master`.
    ///
    /// Stores sharing a Sentinel and master set share one subscription. With
    /// HA disabled nothing is watched and the monitor is inert.
    pub fn monitor_failover(self: &Arc<Self>) -> StoreResult<FailoverMonitor> {
        let mut monitor = FailoverMonitor {
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        };
        let mut seen = HashSet::new();
        for kind in StoreKind::ALL {
            let Some(config) = self.store_config(kind) else {
                continue;
            };
            let Some(sentinel) = config.sentinel_addr() else {
                continue;
            };
            if !seen.insert((sentinel.clone(), config.master_set.clone())) {
                continue;
            }
            let watcher = SwitchWatcher {
                manager: Arc::downgrade(self),
                dialer: self.dialer(kind)?,
                sentinel,
                master_set: config.master_set.clone(),
                reconnect: self.retry().interval,
                stop: monitor.stop.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("fleetstore-failover-{}", kind))
                .spawn(move || watcher.run())
                .map_err(|e| StoreError::undefined(format!("failed to start failover monitor: {}", e)))?;
            monitor.threads.push(handle);
        }
        Ok(monitor)
    }
}
