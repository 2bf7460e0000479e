//! Bounded connection pool with an idle health check
//!
//! A [`ConnectionPool`] dials lazily, keeps at most `max_idle` idle
//! connections and never has more than `max_active` connections open
//! (idle + checked out). Callers that hit the active cap wait up to
//! `wait_timeout` for a connection to be returned.
//!
//! A connection that sat idle longer than `idle_check_after` is pinged on
//! checkout; if the ping fails it is discarded and a fresh one is dialed.
//!
//! Checked-out connections come back through [`PooledConnection`]'s `Drop`,
//! so every exit path returns them. A guard marked broken discards its
//! connection instead.
//!
//! A pool lives as long as its last handle or checked-out connection; there
//! is no explicit shutdown.

use crate::connection::{Dialer, StoreConnection};
use fleetstore_core::{DriverResult, PoolConfig, ServerAddr, StoreError, StoreResult};
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

struct IdleConn {
    conn: Box<dyn StoreConnection>,
    returned_at: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConn>,
    /// Open connections, idle ones included
    active: usize,
}

struct PoolInner {
    addr: ServerAddr,
    dialer: Arc<dyn Dialer>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the idle stack
    pub idle: usize,
    /// Open connections, idle ones included
    pub active: usize,
}

/// Cloneable handle to a pool of connections to one address
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.inner.addr)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool; no connection is dialed until the first checkout
    pub fn new(addr: ServerAddr, dialer: Arc<dyn Dialer>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                addr,
                dialer,
                config,
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Address this pool dials
    pub fn addr(&self) -> &ServerAddr {
        &self.inner.addr
    }

    /// Whether both handles refer to the same pool
    pub fn same_pool(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current occupancy
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.active,
        }
    }

    /// Check out a connection.
    ///
    /// Reuses an idle connection when one is available, dials a new one while
    /// under the active cap, and otherwise waits for a return.
    pub fn get(&self) -> StoreResult<PooledConnection> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.wait_timeout;
        let mut state = self.inner.state.lock();

        loop {
            if let Some(IdleConn { mut conn, returned_at }) = state.idle.pop() {
                drop(state);
                if returned_at.elapsed() >= config.idle_check_after {
                    if let Err(e) = conn.ping() {
                        debug!(
                            target: "fleetstore::pool",
                            addr = %self.inner.addr,
                            error = %e,
                            "discarding stale idle connection"
                        );
                        drop(conn);
                        return self.dial_counted();
                    }
                }
                return Ok(self.guard(conn));
            }

            if config.max_active == 0 || state.active < config.max_active {
                state.active += 1;
                drop(state);
                return self.dial_counted();
            }

            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                warn!(
                    target: "fleetstore::pool",
                    addr = %self.inner.addr,
                    max_active = config.max_active,
                    "connection pool exhausted"
                );
                return Err(StoreError::ConnectionFailed(format!(
                    "connection pool exhausted for {}: {} connections in use",
                    self.inner.addr, config.max_active
                )));
            }
        }
    }

    /// Dial for a slot already counted in `active`; releases it on failure
    fn dial_counted(&self) -> StoreResult<PooledConnection> {
        match self.inner.dialer.dial(&self.inner.addr) {
            Ok(conn) => Ok(self.guard(conn)),
            Err(e) => {
                self.inner.release_slot();
                Err(StoreError::from_driver(
                    e,
                    &format!("failed to dial {}: ", self.inner.addr),
                ))
            }
        }
    }

    fn guard(&self, conn: Box<dyn StoreConnection>) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            broken: false,
        }
    }
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn put_back(&self, conn: Box<dyn StoreConnection>, broken: bool) {
        let mut state = self.state.lock();
        if broken || state.idle.len() >= self.config.max_idle {
            state.active = state.active.saturating_sub(1);
            drop(state);
            drop(conn);
        } else {
            state.idle.push(IdleConn {
                conn,
                returned_at: Instant::now(),
            });
            drop(state);
        }
        self.available.notify_one();
    }
}

/// A connection checked out from a [`ConnectionPool`]
///
/// Returned to the pool when dropped.
pub struct PooledConnection {
    conn: Option<Box<dyn StoreConnection>>,
    pool: Arc<PoolInner>,
    broken: bool,
}

impl PooledConnection {
    /// Discard the connection on drop instead of returning it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Run `f` on the connection, marking it broken if `f` reports a
    /// connection failure.
    pub fn run<T>(
        &mut self,
        f: impl FnOnce(&mut dyn StoreConnection) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let result = f(&mut **self);
        if let Err(e) = &result {
            if e.is_connection_failure() {
                self.broken = true;
            }
        }
        result
    }
}

impl Deref for PooledConnection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn, self.broken);
        }
    }
}
