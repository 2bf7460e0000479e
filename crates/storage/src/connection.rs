//! Connection seam between the engine and a key-value backend
//!
//! [`StoreConnection`] has one method per wire command the engine issues.
//! Both the Redis backend and the in-memory backend implement it, so every
//! engine path can be exercised without a live server.

use fleetstore_core::{DriverResult, ServerAddr};
use std::time::Duration;

/// Sentinel channel announcing a completed failover
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// One `+switch-master` announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSwitch {
    /// Master set that failed over
    pub master_set: String,
    /// Master before the failover
    pub old_master: ServerAddr,
    /// Master after the failover
    pub new_master: ServerAddr,
}

impl MasterSwitch {
    /// Parse a `<set> <old-ip> <old-port> <new-ip> <new-port>` payload
    pub fn parse(payload: &str) -> Option<Self> {
        let parts: Vec<&str> = payload.split_whitespace().collect();
        let [set, old_ip, old_port, new_ip, new_port] = parts.as_slice() else {
            return None;
        };
        Some(Self {
            master_set: set.to_string(),
            old_master: ServerAddr::new(*old_ip, old_port.parse().ok()?),
            new_master: ServerAddr::new(*new_ip, new_port.parse().ok()?),
        })
    }

    /// Payload as Sentinel publishes it
    pub fn payload(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.master_set,
            self.old_master.host,
            self.old_master.port,
            self.new_master.host,
            self.new_master.port
        )
    }
}

/// A command that may be queued inside a `MULTI`/`EXEC` batch
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// `SET key value [PX ttl]`
    Set {
        /// Physical key
        key: String,
        /// Value
        value: String,
        /// Optional expiry
        ttl: Option<Duration>,
    },
    /// `DEL key [key ...]`
    Del {
        /// Keys to remove
        keys: Vec<String>,
    },
    /// `ZADD index score member`
    ZAdd {
        /// Sorted-set name
        index: String,
        /// Score
        score: f64,
        /// Member
        member: String,
    },
    /// `ZREM index member [member ...]`
    ZRem {
        /// Sorted-set name
        index: String,
        /// Members to remove
        members: Vec<String>,
    },
    /// `PEXPIRE key ttl`
    Expire {
        /// Physical key
        key: String,
        /// Time to live
        ttl: Duration,
    },
}

impl WriteOp {
    /// `SET` without expiry
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        WriteOp::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        }
    }

    /// `DEL` of a single key
    pub fn del(key: impl Into<String>) -> Self {
        WriteOp::Del {
            keys: vec![key.into()],
        }
    }

    /// `ZADD` of one member
    pub fn zadd(index: impl Into<String>, score: f64, member: impl Into<String>) -> Self {
        WriteOp::ZAdd {
            index: index.into(),
            score,
            member: member.into(),
        }
    }

    /// `ZREM` of the given members
    pub fn zrem(index: impl Into<String>, members: Vec<String>) -> Self {
        WriteOp::ZRem {
            index: index.into(),
            members,
        }
    }
}

/// One open connection to a store
///
/// Connections are not shared: the pool hands each caller exclusive use of
/// one until it is returned. `watch` state belongs to the connection, so a
/// transaction must issue `watch`, its reads and `exec` on the same one.
pub trait StoreConnection: Send {
    /// `PING`
    fn ping(&mut self) -> DriverResult<()>;

    /// `GET`; `None` when the key is absent
    fn get(&mut self, key: &str) -> DriverResult<Option<String>>;

    /// `MGET`; one slot per requested key
    fn mget(&mut self, keys: &[String]) -> DriverResult<Vec<Option<String>>>;

    /// `SET`, with `PX` when `ttl` is given
    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<()>;

    /// `DEL`; returns the number of keys removed
    fn del(&mut self, keys: &[String]) -> DriverResult<u64>;

    /// `KEYS pattern`
    fn keys(&mut self, pattern: &str) -> DriverResult<Vec<String>>;

    /// `SCAN cursor MATCH pattern COUNT count`
    fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> DriverResult<(u64, Vec<String>)>;

    /// `INCRBY`
    fn incr_by(&mut self, key: &str, delta: i64) -> DriverResult<i64>;

    /// `TTL` in seconds; -2 when absent, -1 when the key has no expiry
    fn ttl(&mut self, key: &str) -> DriverResult<i64>;

    /// `ZADD`; returns the number of members added
    fn zadd(&mut self, index: &str, score: f64, member: &str) -> DriverResult<u64>;

    /// `ZSCAN index cursor MATCH pattern COUNT count`
    fn zscan(
        &mut self,
        index: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> DriverResult<(u64, Vec<(String, f64)>)>;

    /// `ZRANGE index start stop`
    fn zrange(&mut self, index: &str, start: i64, stop: i64) -> DriverResult<Vec<String>>;

    /// `ZRANGEBYSCORE index min max`, both bounds inclusive
    fn zrangebyscore(&mut self, index: &str, min: f64, max: f64) -> DriverResult<Vec<String>>;

    /// `ZREM`; returns the number of members removed
    fn zrem(&mut self, index: &str, members: &[String]) -> DriverResult<u64>;

    /// `ZCOUNT index min max`
    fn zcount(&mut self, index: &str, min: f64, max: f64) -> DriverResult<u64>;

    /// `SADD`
    fn sadd(&mut self, key: &str, member: &str) -> DriverResult<u64>;

    /// `SREM`
    fn srem(&mut self, key: &str, member: &str) -> DriverResult<u64>;

    /// `SMEMBERS`
    fn smembers(&mut self, key: &str) -> DriverResult<Vec<String>>;

    /// `WATCH key [key ...]`
    fn watch(&mut self, keys: &[String]) -> DriverResult<()>;

    /// `UNWATCH`
    fn unwatch(&mut self) -> DriverResult<()>;

    /// `MULTI`, the queued ops, `EXEC`.
    ///
    /// Returns `Ok(false)` when a watched key changed and nothing was
    /// applied. Watches are cleared either way.
    fn exec(&mut self, ops: &[WriteOp]) -> DriverResult<bool>;

    /// `FLUSHALL`
    fn flushall(&mut self) -> DriverResult<()>;

    /// `CONFIG SET parameter value`
    fn config_set(&mut self, parameter: &str, value: &str) -> DriverResult<()>;

    /// `SENTINEL get-master-addr-by-name master_set`
    ///
    /// `None` when the Sentinel does not know the set.
    fn sentinel_master_addr(&mut self, master_set: &str) -> DriverResult<Option<(String, String)>>;

    /// `SUBSCRIBE +switch-master` on a Sentinel, then block.
    ///
    /// `on_event` gets every announcement, and `None` whenever `poll` passes
    /// without one. The subscription ends when `on_event` returns `false`;
    /// the connection is unusable for other commands afterwards.
    fn follow_switch_master(
        &mut self,
        poll: Duration,
        on_event: &mut dyn FnMut(Option<MasterSwitch>) -> bool,
    ) -> DriverResult<()>;
}

/// Opens connections to a server address
pub trait Dialer: Send + Sync {
    /// Dial `addr`
    fn dial(&self, addr: &ServerAddr) -> DriverResult<Box<dyn StoreConnection>>;
}
