//! Subscription and aggregate-host indexes
//!
//! These are sorted sets whose members carry the whole record, all scored 0:
//!
//! - event subscriptions: the caller's key as-is
//! - device subscriptions: `"<host>||<location>||[<resource> ...]"`
//! - aggregate hosts: `"<aggregate>||[<host> ...]"`
//!
//! Lookups are `ZSCAN ... MATCH` patterns. Square brackets in caller keys are
//! escaped before scanning so they match literally; other glob characters
//! are left to the caller.

use crate::conn_pool::{ConnPool, DATA_RETRIEVAL_ERR, DELETE_ERR, WRITE_ERR};
use crate::index::zscan_all;
use fleetstore_core::{StoreError, StoreResult};
use tracing::debug;

/// Separator between the parts of a device or aggregate member
pub const FIELD_SEPARATOR: &str = "||";

fn escape_brackets(key: &str) -> String {
    key.replace('[', "\\[").replace(']', "\\]")
}

fn bracket_list(items: &[String]) -> String {
    format!("[{}]", items.join(" "))
}

/// Member stored for a device subscription
pub fn device_subscription_member(host: &str, location: &str, origin_resources: &[String]) -> String {
    format!(
        "{host}{sep}{location}{sep}{list}",
        sep = FIELD_SEPARATOR,
        list = bracket_list(origin_resources)
    )
}

/// Member stored for an aggregate
pub fn aggregate_member(aggregate_id: &str, hosts: &[String]) -> String {
    format!("{}{}{}", aggregate_id, FIELD_SEPARATOR, bracket_list(hosts))
}

fn not_found_for(pattern: &str) -> StoreError {
    StoreError::KeyNotFound(format!("no data found for the key: {}", pattern))
}

fn already_indexed(index: &str) -> StoreError {
    StoreError::KeyAlreadyExists(format!("data already exists for the index: {}", index))
}

impl ConnPool {
    fn scan_members(&self, index: &str, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.read_conn()?;
        conn.run(|c| zscan_all(c, index, 0, pattern))
            .map_err(|e| StoreError::from_driver(e, DATA_RETRIEVAL_ERR))
    }

    fn add_zero_scored(&self, index: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.zadd(index, 0.0, member))
            .map(|_| ())
            .map_err(|e| self.write_error(e, WRITE_ERR))
    }

    fn remove_members(&self, index: &str, members: &[String]) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.zrem(index, members))
            .map(|removed| {
                debug!(target: "fleetstore::index", index, removed, "members removed");
            })
            .map_err(|e| self.write_error(e, DELETE_ERR))
    }

    // ========================================================================
    // Event subscriptions
    // ========================================================================

    /// Add `key` to `index`; fails with `KeyAlreadyExists` if it is present
    pub fn create_subscription_index(&self, index: &str, key: &str) -> StoreResult<()> {
        let existing = self.find_subscriptions(index, &escape_brackets(key))?;
        if !existing.is_empty() {
            return Err(already_indexed(index));
        }
        self.add_zero_scored(index, key)
    }

    /// Members of `index` matching the glob `search_key`
    pub fn find_subscriptions(&self, index: &str, search_key: &str) -> StoreResult<Vec<String>> {
        self.scan_members(index, search_key)
    }

    /// Remove every member matching `key`; `KeyNotFound` when none do
    pub fn delete_subscriptions(&self, index: &str, key: &str) -> StoreResult<()> {
        let pattern = escape_brackets(key);
        let members = self.find_subscriptions(index, &pattern)?;
        if members.is_empty() {
            return Err(not_found_for(&pattern));
        }
        self.remove_members(index, &members)
    }

    /// Replace the members matching `subscription_id` with `key`
    pub fn update_subscriptions(&self, index: &str, subscription_id: &str, key: &str) -> StoreResult<()> {
        self.delete_subscriptions(index, subscription_id)?;
        self.create_subscription_index(index, key)
            .map_err(|e| StoreError::undefined(format!("error while updating subscriptions: {}", e)))
    }

    // ========================================================================
    // Device subscriptions
    // ========================================================================

    /// Index a device subscription; fails with `KeyAlreadyExists` if the
    /// identical member is present
    pub fn create_device_subscription_index(
        &self,
        index: &str,
        host: &str,
        location: &str,
        origin_resources: &[String],
    ) -> StoreResult<()> {
        let member = device_subscription_member(host, location, origin_resources);
        let existing = self.scan_members(index, &escape_brackets(&member))?;
        if !existing.is_empty() {
            return Err(already_indexed(index));
        }
        self.add_zero_scored(index, &member)
    }

    /// Device subscription members matching `pattern`; `KeyNotFound` when none
    pub fn get_device_subscription(&self, index: &str, pattern: &str) -> StoreResult<Vec<String>> {
        let members = self.scan_members(index, pattern)?;
        if members.is_empty() {
            return Err(not_found_for(pattern));
        }
        Ok(members)
    }

    /// Remove the device subscriptions whose member starts with `host_pattern`
    pub fn delete_device_subscription(&self, index: &str, host_pattern: &str) -> StoreResult<()> {
        let members = self.get_device_subscription(index, &format!("{}*", host_pattern))?;
        self.remove_members(index, &members)
    }

    /// Replace the subscription of `host`, which must already exist.
    ///
    /// The host is matched up to a non-digit so `10.0.0.1` never matches
    /// `10.0.0.12`.
    pub fn update_device_subscription(
        &self,
        index: &str,
        host: &str,
        location: &str,
        origin_resources: &[String],
    ) -> StoreResult<()> {
        self.get_device_subscription(index, &format!("{}[^0-9]*", host))?;
        self.delete_device_subscription(index, &format!("{}[^0-9]", host))?;
        self.create_device_subscription_index(index, host, location, origin_resources)
            .map_err(|e| StoreError::undefined(format!("error while updating subscriptions: {}", e)))
    }

    // ========================================================================
    // Aggregate hosts
    // ========================================================================

    /// Index the hosts of an aggregate. No duplicate check.
    pub fn create_aggregate_host_index(&self, index: &str, aggregate_id: &str, hosts: &[String]) -> StoreResult<()> {
        self.add_zero_scored(index, &aggregate_member(aggregate_id, hosts))
    }

    /// Aggregate members matching `pattern`; `KeyNotFound` when none
    pub fn get_aggregate_hosts(&self, index: &str, pattern: &str) -> StoreResult<Vec<String>> {
        let members = self.scan_members(index, pattern)?;
        if members.is_empty() {
            return Err(not_found_for(pattern));
        }
        Ok(members)
    }

    /// Remove the entry of `aggregate_id`
    pub fn delete_aggregate_hosts(&self, index: &str, aggregate_id: &str) -> StoreResult<()> {
        let members = self.get_aggregate_hosts(index, &format!("{}[^0-9]*", aggregate_id))?;
        self.remove_members(index, &members)
    }

    /// Replace the hosts of an existing aggregate
    pub fn update_aggregate_hosts(&self, index: &str, aggregate_id: &str, hosts: &[String]) -> StoreResult<()> {
        self.delete_aggregate_hosts(index, aggregate_id)?;
        self.create_aggregate_host_index(index, aggregate_id, hosts)
            .map_err(|e| StoreError::undefined(format!("error while updating aggregate host: {}", e)))
    }
}
