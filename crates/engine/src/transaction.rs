//! Optimistic transactions over one watched key
//!
//! [`ConnPool::run_transaction`] checks out a write connection, `WATCH`es
//! the key and hands the callback a [`Transaction`]. Reads inside the
//! callback go straight to the watched connection; writes are queued and
//! sent as one `MULTI`/`EXEC` once the callback returns. If the key changed
//! in between, the server discards the batch and the call fails with
//! `UndefinedErrorType`. There is no automatic retry.

use crate::conn_pool::{ConnPool, READ_ERR};
use crate::crud::record_key;
use fleetstore_core::{to_json, StoreError, StoreResult};
use fleetstore_storage::{PooledConnection, WriteOp};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

const TXN_ERR: &str = "transaction failed: ";

/// What to do with queued writes when the callback fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackErrorPolicy {
    /// Commit what was queued, then return the callback's error
    #[default]
    CommitQueued,
    /// Drop the queued writes and return the callback's error
    Discard,
}

/// Handle passed to a transaction callback
pub struct Transaction<'a> {
    pool: &'a ConnPool,
    conn: &'a mut PooledConnection,
    ops: Vec<WriteOp>,
}

impl<'a> Transaction<'a> {
    /// Read a physical key on the watched connection
    pub fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        let pool = self.pool;
        self.conn
            .run(|c| c.get(key))
            .map_err(|e| pool.write_error(e, READ_ERR))
    }

    /// Read the record `table:key`; `KeyNotFound` when absent
    pub fn read(&mut self, table: &str, key: &str) -> StoreResult<String> {
        match self.get(&record_key(table, key))? {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(StoreError::KeyNotFound(format!(
                "no data with the key {} found",
                key
            ))),
        }
    }

    /// Queue a `SET`
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.push(WriteOp::set(key, value));
    }

    /// Queue a `SET` with expiry
    pub fn set_with_ttl(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.ops.push(WriteOp::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        });
    }

    /// Queue a JSON write of `data` to `table:key`
    pub fn set_json<T: Serialize + ?Sized>(&mut self, table: &str, key: &str, data: &T) -> StoreResult<()> {
        let json = to_json(data)?;
        self.set(record_key(table, key), json);
        Ok(())
    }

    /// Queue a `DEL`
    pub fn del(&mut self, key: impl Into<String>) {
        self.ops.push(WriteOp::del(key));
    }

    /// Queue a `ZADD`
    pub fn zadd(&mut self, index: impl Into<String>, score: f64, member: impl Into<String>) {
        self.ops.push(WriteOp::zadd(index, score, member));
    }

    /// Queue a `ZREM`
    pub fn zrem(&mut self, index: impl Into<String>, members: Vec<String>) {
        self.ops.push(WriteOp::zrem(index, members));
    }

    /// Writes queued so far
    pub fn queued(&self) -> &[WriteOp] {
        &self.ops
    }
}

impl ConnPool {
    /// Run `callback` under an optimistic lock on `key`, committing queued
    /// writes even if the callback fails.
    ///
    /// See [`ConnPool::run_transaction_with`].
    pub fn run_transaction<F>(&self, key: &str, callback: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Transaction<'_>, &str) -> StoreResult<()>,
    {
        self.run_transaction_with(key, CallbackErrorPolicy::default(), callback)
    }

    /// Run `callback` under an optimistic lock on `key`.
    ///
    /// `key` is a physical key. The callback receives it back as its second
    /// argument. A concurrent change to `key` before commit fails the call
    /// with `UndefinedErrorType` and applies nothing.
    pub fn run_transaction_with<F>(&self, key: &str, policy: CallbackErrorPolicy, callback: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Transaction<'_>, &str) -> StoreResult<()>,
    {
        let mut conn = self.write_conn()?;
        let watched = [key.to_string()];
        conn.run(|c| c.watch(&watched))
            .map_err(|e| self.write_error(e, TXN_ERR))?;

        let result = self.run_watched(&mut conn, key, policy, callback);
        if result.is_err() {
            let _ = conn.run(|c| c.unwatch());
        }
        result
    }

    fn run_watched<F>(
        &self,
        conn: &mut PooledConnection,
        key: &str,
        policy: CallbackErrorPolicy,
        callback: F,
    ) -> StoreResult<()>
    where
        F: FnOnce(&mut Transaction<'_>, &str) -> StoreResult<()>,
    {
        let (ops, outcome) = {
            let mut txn = Transaction {
                pool: self,
                conn: &mut *conn,
                ops: Vec::new(),
            };
            let outcome = callback(&mut txn, key);
            (txn.ops, outcome)
        };

        if let Err(e) = &outcome {
            if policy == CallbackErrorPolicy::Discard {
                warn!(target: "fleetstore::txn", key, error = %e, discarded = ops.len(), "callback failed");
                return outcome;
            }
        }

        if ops.is_empty() {
            conn.run(|c| c.unwatch())
                .map_err(|e| self.write_error(e, TXN_ERR))?;
            return outcome;
        }

        let committed = conn
            .run(|c| c.exec(&ops))
            .map_err(|e| self.write_error(e, TXN_ERR))?;
        if !committed {
            warn!(target: "fleetstore::txn", key, "watched key modified, transaction aborted");
            return Err(StoreError::undefined(format!(
                "transaction aborted: watched key {} modified",
                key
            )));
        }
        debug!(target: "fleetstore::txn", key, ops = ops.len(), "transaction committed");
        outcome
    }
}
