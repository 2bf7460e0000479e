//! Core types for fleetstore
//!
//! This crate defines the foundational types shared by the storage and
//! engine layers:
//! - Error: `StoreError` taxonomy with stable codes, `DriverError` and its
//!   connection-failure classifier
//! - Config: `DbConf` (TOML), per-store `StoreConfig`, `PoolConfig`,
//!   `RetryConfig`, `StoreKind`, `ServerAddr`
//! - JSON: record encoding that rejects non-finite floats
//! - Index values: `IndexValue` encoding for secondary-index members and the
//!   `Condition` filter used on list members

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod index_value;
pub mod json;

pub use config::{
    DbConf, PoolConfig, RetryConfig, ServerAddr, StoreConfig, StoreKind, CONFIG_FILE_NAME,
    DEFAULT_MAX_ACTIVE_CONNS, DEFAULT_MAX_IDLE_CONNS, DEFAULT_PROTOCOL,
};
pub use error::{DriverError, DriverResult, ErrorCode, StoreError, StoreResult};
pub use index_value::{
    member_id, parse_list_value, split_member, Condition, IndexEntry, IndexValue,
    MEMBER_SEPARATOR,
};
pub use json::{to_json, JSON_WRITE_ERR};
