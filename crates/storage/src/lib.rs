//! Storage layer for fleetstore
//!
//! This crate implements everything below the engine:
//! - StoreConnection / Dialer: the command-level seam to a backend
//! - RedisDialer: synchronous Redis connections via the `redis` crate
//! - MemoryCluster: in-process backend with Sentinel and failover simulation
//! - ConnectionPool: bounded pool with lazy dial and idle health check
//! - Master discovery through Sentinel

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod discovery;
pub mod glob;
pub mod memory;
pub mod pool;
pub mod redis_backend;

pub use connection::{Dialer, MasterSwitch, StoreConnection, WriteOp, SWITCH_MASTER_CHANNEL};
pub use discovery::{resolve_master, retry_resolve_master};
pub use glob::glob_match;
pub use memory::{MemoryCluster, MemoryConnection, MemoryStore};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use redis_backend::{map_redis_error, RedisConnection, RedisDialer};
