//! Record CRUD on `"<table>:<key>"` physical keys
//!
//! Reads go to the read pool, writes to the write pool. Write failures that
//! mean the master is unreachable invalidate the write pool.

use crate::conn_pool::{ConnPool, DELETE_ERR, READ_ERR, WRITE_ERR};
use fleetstore_core::{to_json, StoreError, StoreResult};
use fleetstore_storage::WriteOp;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Keys visited per `SCAN` page when enumerating a table
pub const SCAN_PAGE_SIZE: usize = 1000;

/// Keys returned per [`ConnPool::list_keys_page`] call
pub const KEYS_PAGE_SIZE: usize = 500;

/// Physical key of a record
pub fn record_key(table: &str, key: &str) -> String {
    format!("{}:{}", table, key)
}

fn not_found(key: &str) -> StoreError {
    StoreError::KeyNotFound(format!("no data with the key {} found", key))
}

fn already_exists(key: &str) -> StoreError {
    StoreError::KeyAlreadyExists(format!("data with key {} already exists", key))
}

impl ConnPool {
    /// Store `data` as JSON under `table:key`.
    ///
    /// Fails with `KeyAlreadyExists` when a record is already present. The
    /// existence check and the write are separate round trips.
    pub fn create<T: Serialize + ?Sized>(&self, table: &str, key: &str, data: &T) -> StoreResult<()> {
        match self.read(table, key) {
            Ok(_) => return Err(already_exists(key)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.upsert(table, key, data)
    }

    /// Raw JSON stored under `table:key`
    pub fn read(&self, table: &str, key: &str) -> StoreResult<String> {
        self.get_key_value(&record_key(table, key))
            .map_err(|e| if e.is_not_found() { not_found(key) } else { e })
    }

    /// Replace the record under `table:key`; fails with `KeyNotFound` if
    /// absent. Returns the physical key.
    pub fn update<T: Serialize + ?Sized>(&self, table: &str, key: &str, data: &T) -> StoreResult<String> {
        match self.read(table, key) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(StoreError::KeyNotFound(format!("data with key {} does not exist", key)))
            }
            Err(e) => return Err(e),
        }
        self.upsert(table, key, data)?;
        Ok(record_key(table, key))
    }

    /// Write the record under `table:key` whether or not it exists
    pub fn upsert<T: Serialize + ?Sized>(&self, table: &str, key: &str, data: &T) -> StoreResult<()> {
        let json = to_json(data)?;
        let id = record_key(table, key);
        let mut conn = self.write_conn()?;
        conn.run(|c| c.set(&id, &json, None))
            .map_err(|e| self.write_error(e, WRITE_ERR))
    }

    /// Store `data` under `table:key` byte for byte, without JSON encoding.
    ///
    /// Used for event payloads that are already serialized. Non-UTF-8 input
    /// is rejected.
    pub fn save_undelivered_event(&self, table: &str, key: &str, data: &[u8]) -> StoreResult<()> {
        let payload = std::str::from_utf8(data).map_err(|e| {
            StoreError::undefined(format!("{}event payload is not valid UTF-8: {}", WRITE_ERR, e))
        })?;
        let id = record_key(table, key);
        let mut conn = self.write_conn()?;
        conn.run(|c| c.set(&id, payload, None))
            .map_err(|e| self.write_error(e, WRITE_ERR))
    }

    /// Remove the record under `table:key`; fails with `KeyNotFound` if absent
    pub fn delete(&self, table: &str, key: &str) -> StoreResult<()> {
        self.read(table, key)?;
        self.delete_key(&record_key(table, key))
    }

    /// Like [`ConnPool::read`] but an absent record is `Ok(None)`
    pub fn find_or_null(&self, table: &str, key: &str) -> StoreResult<Option<String>> {
        match self.read(table, key) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Keys of every record in `table`, prefix stripped
    pub fn list_all(&self, table: &str) -> StoreResult<Vec<String>> {
        self.scan_table(table, &format!("{}:*", table))
    }

    /// Keys of the records in `table` whose key contains `pattern`
    pub fn list_matching(&self, table: &str, pattern: &str) -> StoreResult<Vec<String>> {
        self.scan_table(table, &format!("{}:*{}*", table, pattern))
    }

    /// One page of keys in `table` containing `pattern`.
    ///
    /// Returns the full physical keys and the cursor to pass next; a
    /// returned cursor of 0 means the scan is complete.
    pub fn list_keys_page(&self, table: &str, pattern: &str, cursor: u64) -> StoreResult<(Vec<String>, u64)> {
        let glob = format!("{}:*{}*", table, pattern);
        let mut conn = self.read_conn()?;
        let (next, keys) = conn
            .run(|c| c.scan(cursor, &glob, KEYS_PAGE_SIZE))
            .map_err(|e| StoreError::from_driver(e, "error while fetching data: "))?;
        Ok((keys, next))
    }

    /// Delete every physical key matching `*<key>`, whatever its table.
    ///
    /// Keys are deleted one by one; a failed deletion is logged and the
    /// remaining keys are still attempted. Only the key lookup can fail the
    /// call.
    pub fn delete_by_pattern(&self, key: &str) -> StoreResult<()> {
        let pattern = format!("*{}", key);
        let keys = {
            let mut conn = self.read_conn()?;
            conn.run(|c| c.keys(&pattern))
                .map_err(|e| StoreError::from_driver(e, READ_ERR))?
        };
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.write_conn()?;
        let mut failed = 0usize;
        for k in &keys {
            if let Err(e) = conn.run(|c| c.del(std::slice::from_ref(k))) {
                failed += 1;
                let err = self.write_error(e, DELETE_ERR);
                warn!(target: "fleetstore::crud", key = %k, error = %err, "failed to delete key");
            }
        }
        debug!(
            target: "fleetstore::crud",
            pattern = %pattern,
            matched = keys.len(),
            failed,
            "delete by pattern finished"
        );
        Ok(())
    }

    /// Read the record whose physical key ends with `suffix`, whatever its
    /// table
    pub fn get_resource_details(&self, suffix: &str) -> StoreResult<String> {
        let pattern = format!("*{}", suffix);
        let keys = self.scan_keys(&pattern)?;
        let (table, key) = keys
            .first()
            .and_then(|k| k.split_once(':'))
            .ok_or_else(|| StoreError::KeyNotFound(format!("no data with the key {} found", suffix)))?;
        if keys.len() > 1 {
            debug!(
                target: "fleetstore::crud",
                suffix = %suffix,
                matches = keys.len(),
                "several keys end with suffix, using the first"
            );
        }
        self.read(table, key)
    }

    /// `MGET` of physical keys; absent keys yield `None`
    pub fn read_multiple_keys(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let mut conn = self.read_conn()?;
        let values = conn
            .run(|c| c.mget(keys))
            .map_err(|e| StoreError::from_driver_fetch(e, READ_ERR))?;
        if values.is_empty() {
            return Err(StoreError::KeyNotFound(format!("no data with the keys {:?} found", keys)));
        }
        Ok(values)
    }

    /// Delete physical keys in one atomic batch
    pub fn delete_multiple_keys(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.write_conn()?;
        conn.run(|c| c.exec(&[WriteOp::Del { keys: keys.to_vec() }]))
            .map(|_| ())
            .map_err(|e| self.write_error(e, DELETE_ERR))
    }

    /// Value of a raw physical key
    pub fn get_key_value(&self, key: &str) -> StoreResult<String> {
        let mut conn = self.read_conn()?;
        match conn.run(|c| c.get(key)) {
            Ok(Some(value)) if !value.is_empty() => Ok(value),
            Ok(_) => Err(not_found(key)),
            Err(e) => Err(StoreError::from_driver_fetch(e, READ_ERR)),
        }
    }

    /// Delete a raw physical key; deleting an absent key succeeds
    pub fn delete_key(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.del(&[key.to_string()]))
            .map(|_| ())
            .map_err(|e| self.write_error(e, DELETE_ERR))
    }

    /// Increment the counter at `table:key`
    pub fn incr(&self, table: &str, key: &str) -> StoreResult<i64> {
        self.incr_by(table, key, 1)
    }

    /// Decrement the counter at `table:key`
    pub fn decr(&self, table: &str, key: &str) -> StoreResult<i64> {
        self.incr_by(table, key, -1)
    }

    fn incr_by(&self, table: &str, key: &str, delta: i64) -> StoreResult<i64> {
        let id = record_key(table, key);
        let mut conn = self.write_conn()?;
        conn.run(|c| c.incr_by(&id, delta)).map_err(|e| {
            let err = self.write_error(e, READ_ERR);
            match err {
                StoreError::UndefinedErrorType(msg) => StoreError::FetchFailed(msg),
                other => other,
            }
        })
    }

    /// Create a record that expires after `ttl_secs` seconds.
    ///
    /// Fails with `KeyAlreadyExists` if present and `ConnectionFailed` if
    /// the store cannot be reached.
    pub fn set_expire<T: Serialize + ?Sized>(
        &self,
        table: &str,
        key: &str,
        data: &T,
        ttl_secs: u64,
    ) -> StoreResult<()> {
        match self.read(table, key) {
            Ok(_) => return Err(already_exists(key)),
            Err(e) if e.is_connection_failed() => {
                return Err(StoreError::ConnectionFailed("db connection failed".to_string()))
            }
            Err(_) => {}
        }
        let json = to_json(data)?;
        let id = record_key(table, key);
        let ttl = Duration::from_secs(ttl_secs);
        let mut conn = self.write_conn()?;
        conn.run(|c| c.set(&id, &json, Some(ttl)))
            .map_err(|e| self.write_error(e, WRITE_ERR))
    }

    /// Seconds left before `table:key` expires; -1 without expiry, -2 when
    /// absent
    pub fn ttl(&self, table: &str, key: &str) -> StoreResult<i64> {
        let id = record_key(table, key);
        let mut conn = self.read_conn()?;
        conn.run(|c| c.ttl(&id))
            .map_err(|e| StoreError::from_driver_fetch(e, READ_ERR))
    }

    /// Write several physical keys as one atomic batch, in key order.
    ///
    /// Entries that fail to encode are left out of the batch and their keys
    /// returned.
    pub fn save_batch<T: Serialize>(&self, entries: &BTreeMap<String, T>) -> StoreResult<Vec<String>> {
        let mut skipped = Vec::new();
        let mut ops = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match to_json(value) {
                Ok(json) => ops.push(WriteOp::set(key.clone(), json)),
                Err(e) => {
                    warn!(target: "fleetstore::crud", key = %key, error = %e, "skipping entry");
                    skipped.push(key.clone());
                }
            }
        }
        if ops.is_empty() {
            return Ok(skipped);
        }
        let mut conn = self.write_conn()?;
        conn.run(|c| c.exec(&ops))
            .map_err(|e| self.write_error(e, WRITE_ERR))?;
        Ok(skipped)
    }

    /// Set the same expiry on several physical keys as one atomic batch
    pub fn expire_keys(&self, keys: &[String], ttl_secs: u64) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let ttl = Duration::from_secs(ttl_secs);
        let mut sorted = keys.to_vec();
        sorted.sort();
        let ops: Vec<WriteOp> = sorted
            .into_iter()
            .map(|key| WriteOp::Expire { key, ttl })
            .collect();
        let mut conn = self.write_conn()?;
        conn.run(|c| c.exec(&ops))
            .map(|_| ())
            .map_err(|e| self.write_error(e, WRITE_ERR))
    }

    /// Remove every key of the store
    pub fn clean_up_db(&self) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.flushall())
            .map_err(|e| self.write_error(e, READ_ERR))
    }

    /// `CONFIG SET <notifier_type> <filter_type>` on the master, e.g.
    /// `("notify-keyspace-events", "Ex")` to have expirations announced
    pub fn enable_keyspace_notifier(&self, notifier_type: &str, filter_type: &str) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.config_set(notifier_type, filter_type))
            .map_err(|e| self.write_error(e, "error while enabling keyspace notifications: "))?;
        debug!(target: "fleetstore::crud", notifier_type, filter_type, "keyspace notifier configured");
        Ok(())
    }

    /// `SADD`
    pub fn add_member_to_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.sadd(key, member))
            .map(|_| ())
            .map_err(|e| self.write_error(e, WRITE_ERR))
    }

    /// `SMEMBERS`
    pub fn get_all_members_in_set(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.read_conn()?;
        conn.run(|c| c.smembers(key))
            .map_err(|e| StoreError::from_driver_fetch(e, READ_ERR))
    }

    /// `SREM`
    pub fn remove_member_from_set(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.write_conn()?;
        conn.run(|c| c.srem(key, member))
            .map(|_| ())
            .map_err(|e| self.write_error(e, WRITE_ERR))
    }

    fn scan_table(&self, table: &str, pattern: &str) -> StoreResult<Vec<String>> {
        let prefix = format!("{}:", table);
        Ok(self
            .scan_keys(pattern)?
            .into_iter()
            .map(|k| if k.starts_with(&prefix) { k[prefix.len()..].to_string() } else { k })
            .collect())
    }

    /// Every physical key matching `pattern`, following the cursor to the end
    fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.read_conn()?;
        let mut cursor = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page) = conn
                .run(|c| c.scan(cursor, pattern, SCAN_PAGE_SIZE))
                .map_err(|e| StoreError::from_driver(e, READ_ERR))?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
