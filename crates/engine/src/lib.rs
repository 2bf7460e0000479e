//! Persistence engine for fleetstore
//!
//! This crate sits on top of the storage seam and provides:
//! - StoreManager: one lazily built pool pair per logical store
//! - ConnPool: read pool plus a hot-swappable write pool that follows the
//!   Sentinel-elected master
//! - CRUD on `"<table>:<key>"` records holding JSON
//! - Secondary indexes on sorted sets, including subscription and
//!   aggregate-host indexes
//! - Optimistic transactions (`WATCH` + `MULTI`/`EXEC`)
//! - FailoverMonitor: resets write pools on Sentinel `+switch-master`
//!
//! Every operation checks out a connection per call and blocks no longer
//! than the configured dial and pool waits. The failover monitor is the
//! only thing that spawns threads.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conn_pool;
pub mod crud;
pub mod failover;
pub mod index;
pub mod manager;
pub mod subscription;
pub mod transaction;

pub use conn_pool::{is_retriable, ConnPool};
pub use crud::{record_key, KEYS_PAGE_SIZE, SCAN_PAGE_SIZE};
pub use failover::{FailoverMonitor, SWITCH_MASTER_POLL};
pub use index::{fields_from_json, IndexFields, INDEX_PAGE_SIZE, PLACEHOLDER_MEMBER};
pub use manager::StoreManager;
pub use subscription::{aggregate_member, device_subscription_member, FIELD_SEPARATOR};
pub use transaction::{CallbackErrorPolicy, Transaction};
