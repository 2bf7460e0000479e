//! fleetstore - HA-aware persistence over Redis
//!
//! fleetstore stores JSON records under `"<table>:<key>"` keys in two
//! independently configured stores (in-memory and on-disk), keeps secondary
//! indexes in sorted sets, and follows the Sentinel-elected master for
//! writes.
//!
//! # Quick Start
//!
//! ```ignore
//! use fleetstore::{DbConf, StoreKind, StoreManager};
//!
//! let conf = DbConf::from_file("fleetstore.toml".as_ref())?;
//! let manager = StoreManager::from_conf(&conf);
//!
//! let store = manager.get_connection(StoreKind::OnDisk)?;
//! store.create("ComputerSystem", "abc-123", &serde_json::json!({"model": "Intel"}))?;
//! let json = store.read("ComputerSystem", "abc-123")?;
//! ```
//!
//! # Architecture
//!
//! - `fleetstore-core`: errors, configuration, index value encoding
//! - `fleetstore-storage`: connection seam, Redis and in-memory backends,
//!   connection pool, Sentinel discovery
//! - `fleetstore-engine`: store manager, CRUD, indexes, transactions

pub use fleetstore_core::*;
pub use fleetstore_engine::*;

/// Backends and connection plumbing
pub mod storage {
    pub use fleetstore_storage::*;
}
