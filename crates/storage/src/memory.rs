//! In-process backend speaking the [`StoreConnection`] surface
//!
//! A [`MemoryCluster`] is a set of simulated servers keyed by address. Each
//! node owns (or shares, for replicas) a [`MemoryStore`] and can act as a
//! Sentinel by registering master sets. Nodes can be taken down and brought
//! back, which is how failover is exercised without a live deployment:
//!
//! * dialing a down node fails with "connection refused"
//! * commands on a connection opened before the node went down fail with EOF,
//!   even after the node is back up
//!
//! Watch semantics follow Redis: every write bumps a per-key version, `WATCH`
//! records the versions it saw and `EXEC` applies nothing if any changed.
//! Versions of absent keys are only kept while some connection watches them.
//!
//! Sentinel nodes publish `+switch-master` to connections blocked in
//! [`StoreConnection::follow_switch_master`] when
//! [`MemoryCluster::switch_master`] is called.

use crate::connection::{Dialer, MasterSwitch, StoreConnection, WriteOp};
use crate::glob::glob_match;
use fleetstore_core::{DriverError, DriverResult, ServerAddr};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

#[derive(Debug, Default)]
struct StoreData {
    strings: HashMap<String, StringEntry>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, BTreeSet<String>>,
    versions: HashMap<String, u64>,
    /// Connections watching each key
    watchers: HashMap<String, usize>,
    clock: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    String,
    ZSet,
    Set,
}

impl StoreData {
    fn purge_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self.strings.get(key).map_or(false, |e| e.expired(now)) {
            self.strings.remove(key);
        }
    }

    fn key_type(&mut self, key: &str) -> Option<KeyType> {
        self.purge_expired(key);
        if self.strings.contains_key(key) {
            Some(KeyType::String)
        } else if self.zsets.contains_key(key) {
            Some(KeyType::ZSet)
        } else if self.sets.contains_key(key) {
            Some(KeyType::Set)
        } else {
            None
        }
    }

    fn expect_type(&mut self, key: &str, expected: KeyType) -> DriverResult<()> {
        match self.key_type(key) {
            Some(actual) if actual != expected => Err(DriverError::Response(WRONGTYPE.to_string())),
            _ => Ok(()),
        }
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// Drop the version of a removed key unless someone watches it
    fn forget_version(&mut self, key: &str) {
        if !self.watchers.contains_key(key) {
            self.versions.remove(key);
        }
    }

    fn add_watcher(&mut self, key: &str) {
        *self.watchers.entry(key.to_string()).or_insert(0) += 1;
    }

    fn release_watcher(&mut self, key: &str) {
        let Some(count) = self.watchers.get_mut(key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.watchers.remove(key);
            if self.key_type(key).is_none() {
                self.versions.remove(key);
            }
        }
    }

    fn live_keys(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.strings.retain(|_, e| !e.expired(now));
        let mut keys: Vec<String> = self
            .strings
            .keys()
            .chain(self.zsets.keys())
            .chain(self.sets.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.zsets.remove(key);
        self.sets.remove(key);
        self.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        self.touch(key);
    }

    fn del(&mut self, keys: &[String]) -> u64 {
        let mut removed = 0;
        for key in keys {
            if self.key_type(key).is_some() {
                self.strings.remove(key);
                self.zsets.remove(key);
                self.sets.remove(key);
                self.touch(key);
                self.forget_version(key);
                removed += 1;
            }
        }
        removed
    }

    fn zadd(&mut self, index: &str, score: f64, member: &str) -> DriverResult<u64> {
        self.expect_type(index, KeyType::ZSet)?;
        let added = self
            .zsets
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string(), score)
            .is_none();
        self.touch(index);
        Ok(u64::from(added))
    }

    fn zrem(&mut self, index: &str, members: &[String]) -> DriverResult<u64> {
        self.expect_type(index, KeyType::ZSet)?;
        let Some(zset) = self.zsets.get_mut(index) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| zset.remove(m.as_str()).is_some()).count() as u64;
        let emptied = zset.is_empty();
        if emptied {
            self.zsets.remove(index);
        }
        if removed > 0 {
            self.touch(index);
        }
        if emptied {
            self.forget_version(index);
        }
        Ok(removed)
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        self.purge_expired(key);
        match self.strings.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                self.touch(key);
                true
            }
            None => false,
        }
    }

    /// Members ordered by (score, member), the order Redis uses
    fn sorted_members(&mut self, index: &str) -> DriverResult<Vec<(String, f64)>> {
        self.expect_type(index, KeyType::ZSet)?;
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(index)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    fn check_op(&mut self, op: &WriteOp) -> DriverResult<()> {
        match op {
            WriteOp::ZAdd { index, .. } | WriteOp::ZRem { index, .. } => {
                self.expect_type(index, KeyType::ZSet)
            }
            WriteOp::Set { .. } | WriteOp::Del { .. } | WriteOp::Expire { .. } => Ok(()),
        }
    }

    fn apply(&mut self, op: &WriteOp) -> DriverResult<()> {
        match op {
            WriteOp::Set { key, value, ttl } => self.set(key, value, *ttl),
            WriteOp::Del { keys } => {
                self.del(keys);
            }
            WriteOp::ZAdd {
                index,
                score,
                member,
            } => {
                self.zadd(index, *score, member)?;
            }
            WriteOp::ZRem { index, members } => {
                self.zrem(index, members)?;
            }
            WriteOp::Expire { key, ttl } => {
                self.expire(key, *ttl);
            }
        }
        Ok(())
    }
}

/// Keyspace of one simulated server
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    /// Empty keyspace
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys of any type
    pub fn key_count(&self) -> usize {
        self.data.lock().live_keys().len()
    }
}

// ============================================================================
// Cluster
// ============================================================================

#[derive(Debug)]
struct MemoryNode {
    store: Arc<MemoryStore>,
    up: AtomicBool,
    generation: AtomicU64,
    dials: AtomicUsize,
    masters: Mutex<HashMap<String, ServerAddr>>,
    config: Mutex<HashMap<String, String>>,
    subscribers: Mutex<Vec<(u64, Sender<String>)>>,
    next_subscriber: AtomicU64,
}

impl MemoryNode {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            up: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            dials: AtomicUsize::new(0),
            masters: Mutex::new(HashMap::new()),
            config: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
        }
    }
}

/// Simulated deployment of stores and Sentinels
///
/// # Example
/// ```ignore
/// let cluster = Arc::new(MemoryCluster::new());
/// let master = ServerAddr::new("10.0.0.1", 6379);
/// cluster.add_node(&master);
/// cluster.set_sentinel_master(&ServerAddr::new("10.0.0.1", 26379), "mymaster", Some(master));
/// ```
#[derive(Debug, Default)]
pub struct MemoryCluster {
    nodes: RwLock<HashMap<String, Arc<MemoryNode>>>,
}

impl MemoryCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node with a fresh keyspace, or return the existing one
    pub fn add_node(&self, addr: &ServerAddr) -> Arc<MemoryStore> {
        let mut nodes = self.nodes.write();
        nodes
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(MemoryNode::new(Arc::new(MemoryStore::new()))))
            .store
            .clone()
    }

    /// Register `addr` as a replica sharing `of`'s keyspace
    ///
    /// Registers `of` first if needed.
    pub fn add_replica(&self, addr: &ServerAddr, of: &ServerAddr) -> Arc<MemoryStore> {
        let store = self.add_node(of);
        self.nodes
            .write()
            .insert(addr.to_string(), Arc::new(MemoryNode::new(store.clone())));
        store
    }

    /// Take a node down or bring it back.
    ///
    /// Connections opened before a node goes down stay broken.
    pub fn set_node_up(&self, addr: &ServerAddr, up: bool) {
        if let Some(node) = self.node(addr) {
            if !up {
                node.generation.fetch_add(1, Ordering::SeqCst);
            }
            node.up.store(up, Ordering::SeqCst);
        }
    }

    /// Point a Sentinel's master set at `master`, or forget it with `None`.
    ///
    /// Registers the Sentinel node if needed.
    pub fn set_sentinel_master(&self, sentinel: &ServerAddr, master_set: &str, master: Option<ServerAddr>) {
        self.add_node(sentinel);
        if let Some(node) = self.node(sentinel) {
            let mut masters = node.masters.lock();
            match master {
                Some(addr) => {
                    masters.insert(master_set.to_string(), addr);
                }
                None => {
                    masters.remove(master_set);
                }
            }
        }
    }

    /// Fail a Sentinel's master set over to `new_master` and announce it on
    /// `+switch-master`.
    ///
    /// Returns how many subscribers received the announcement.
    pub fn switch_master(&self, sentinel: &ServerAddr, master_set: &str, new_master: ServerAddr) -> usize {
        self.add_node(sentinel);
        let Some(node) = self.node(sentinel) else {
            return 0;
        };
        let old_master = node
            .masters
            .lock()
            .insert(master_set.to_string(), new_master.clone())
            .unwrap_or_else(|| new_master.clone());
        let payload = MasterSwitch {
            master_set: master_set.to_string(),
            old_master,
            new_master,
        }
        .payload();
        let mut subscribers = node.subscribers.lock();
        subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        subscribers.len()
    }

    /// Connections currently subscribed to `+switch-master` on `sentinel`
    pub fn switch_subscribers(&self, sentinel: &ServerAddr) -> usize {
        self.node(sentinel).map_or(0, |n| n.subscribers.lock().len())
    }

    /// Last value set through `CONFIG SET parameter` on `addr`
    pub fn config_value(&self, addr: &ServerAddr, parameter: &str) -> Option<String> {
        self.node(addr)
            .and_then(|n| n.config.lock().get(&parameter.to_lowercase()).cloned())
    }

    /// Keyspace served at `addr`
    pub fn store(&self, addr: &ServerAddr) -> Option<Arc<MemoryStore>> {
        self.node(addr).map(|n| n.store.clone())
    }

    /// Successful dials made to `addr`
    pub fn dial_count(&self, addr: &ServerAddr) -> usize {
        self.node(addr).map_or(0, |n| n.dials.load(Ordering::SeqCst))
    }

    fn node(&self, addr: &ServerAddr) -> Option<Arc<MemoryNode>> {
        self.nodes.read().get(&addr.to_string()).cloned()
    }
}

impl Dialer for MemoryCluster {
    fn dial(&self, addr: &ServerAddr) -> DriverResult<Box<dyn StoreConnection>> {
        let node = self
            .node(addr)
            .filter(|n| n.up.load(Ordering::SeqCst))
            .ok_or_else(|| DriverError::refused(addr))?;
        node.dials.fetch_add(1, Ordering::SeqCst);
        let generation = node.generation.load(Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            node,
            generation,
            watched: HashMap::new(),
        }))
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Connection to one [`MemoryCluster`] node
#[derive(Debug)]
pub struct MemoryConnection {
    node: Arc<MemoryNode>,
    generation: u64,
    watched: HashMap<String, u64>,
}

impl MemoryConnection {
    fn data(&self) -> DriverResult<parking_lot::MutexGuard<'_, StoreData>> {
        self.check_alive()?;
        Ok(self.node.store.data.lock())
    }

    fn check_alive(&self) -> DriverResult<()> {
        if !self.node.up.load(Ordering::SeqCst)
            || self.node.generation.load(Ordering::SeqCst) != self.generation
        {
            return Err(DriverError::eof());
        }
        Ok(())
    }

    /// Clear this connection's watches, even if the node is down
    fn release_watches(&mut self) {
        if self.watched.is_empty() {
            return;
        }
        let mut data = self.node.store.data.lock();
        for key in self.watched.keys() {
            data.release_watcher(key);
        }
        drop(data);
        self.watched.clear();
    }

    fn exec_watched(&self, ops: &[WriteOp]) -> DriverResult<bool> {
        let mut data = self.data()?;
        if self
            .watched
            .iter()
            .any(|(key, version)| data.version(key) != *version)
        {
            return Ok(false);
        }
        for op in ops {
            data.check_op(op)?;
        }
        for op in ops {
            data.apply(op)?;
        }
        Ok(true)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release_watches();
    }
}

fn page<T: Clone>(items: &[T], cursor: u64, count: usize) -> (u64, &[T]) {
    let start = (cursor as usize).min(items.len());
    let end = start.saturating_add(count.max(1)).min(items.len());
    let next = if end >= items.len() { 0 } else { end as u64 };
    (next, &items[start..end])
}

fn resolve_index(idx: i64, len: usize) -> i64 {
    if idx < 0 {
        len as i64 + idx
    } else {
        idx
    }
}

impl StoreConnection for MemoryConnection {
    fn ping(&mut self) -> DriverResult<()> {
        self.data().map(|_| ())
    }

    fn get(&mut self, key: &str) -> DriverResult<Option<String>> {
        let mut data = self.data()?;
        data.expect_type(key, KeyType::String)?;
        Ok(data.strings.get(key).map(|e| e.value.clone()))
    }

    fn mget(&mut self, keys: &[String]) -> DriverResult<Vec<Option<String>>> {
        let mut data = self.data()?;
        Ok(keys
            .iter()
            .map(|key| {
                data.purge_expired(key);
                data.strings.get(key).map(|e| e.value.clone())
            })
            .collect())
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<()> {
        self.data()?.set(key, value, ttl);
        Ok(())
    }

    fn del(&mut self, keys: &[String]) -> DriverResult<u64> {
        Ok(self.data()?.del(keys))
    }

    fn keys(&mut self, pattern: &str) -> DriverResult<Vec<String>> {
        let mut data = self.data()?;
        Ok(data
            .live_keys()
            .into_iter()
            .filter(|k| glob_match(pattern, k))
            .collect())
    }

    fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> DriverResult<(u64, Vec<String>)> {
        let keys = self.data()?.live_keys();
        let (next, window) = page(&keys, cursor, count);
        Ok((
            next,
            window.iter().filter(|k| glob_match(pattern, k)).cloned().collect(),
        ))
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> DriverResult<i64> {
        let mut data = self.data()?;
        data.expect_type(key, KeyType::String)?;
        let (current, expires_at) = match data.strings.get(key) {
            Some(entry) => (
                entry.value.parse::<i64>().map_err(|_| {
                    DriverError::Response("ERR value is not an integer or out of range".into())
                })?,
                entry.expires_at,
            ),
            None => (0, None),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| DriverError::Response("ERR increment or decrement would overflow".into()))?;
        data.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        data.touch(key);
        Ok(next)
    }

    fn ttl(&mut self, key: &str) -> DriverResult<i64> {
        let mut data = self.data()?;
        if data.key_type(key).is_none() {
            return Ok(-2);
        }
        let now = Instant::now();
        Ok(match data.strings.get(key).and_then(|e| e.expires_at) {
            Some(at) => ((at.saturating_duration_since(now).as_millis() + 500) / 1000) as i64,
            None => -1,
        })
    }

    fn zadd(&mut self, index: &str, score: f64, member: &str) -> DriverResult<u64> {
        self.data()?.zadd(index, score, member)
    }

    fn zscan(
        &mut self,
        index: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> DriverResult<(u64, Vec<(String, f64)>)> {
        let mut data = self.data()?;
        data.expect_type(index, KeyType::ZSet)?;
        let mut members: Vec<(String, f64)> = data
            .zsets
            .get(index)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        let (next, window) = page(&members, cursor, count);
        Ok((
            next,
            window
                .iter()
                .filter(|(m, _)| glob_match(pattern, m))
                .cloned()
                .collect(),
        ))
    }

    fn zrange(&mut self, index: &str, start: i64, stop: i64) -> DriverResult<Vec<String>> {
        let members = self.data()?.sorted_members(index)?;
        let len = members.len();
        let start = resolve_index(start, len).max(0);
        let stop = resolve_index(stop, len).min(len as i64 - 1);
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(members[start as usize..=stop as usize]
            .iter()
            .map(|(m, _)| m.clone())
            .collect())
    }

    fn zrangebyscore(&mut self, index: &str, min: f64, max: f64) -> DriverResult<Vec<String>> {
        let members = self.data()?.sorted_members(index)?;
        Ok(members
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .map(|(m, _)| m)
            .collect())
    }

    fn zrem(&mut self, index: &str, members: &[String]) -> DriverResult<u64> {
        self.data()?.zrem(index, members)
    }

    fn zcount(&mut self, index: &str, min: f64, max: f64) -> DriverResult<u64> {
        let members = self.data()?.sorted_members(index)?;
        Ok(members.iter().filter(|(_, s)| *s >= min && *s <= max).count() as u64)
    }

    fn sadd(&mut self, key: &str, member: &str) -> DriverResult<u64> {
        let mut data = self.data()?;
        data.expect_type(key, KeyType::Set)?;
        let added = data
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        data.touch(key);
        Ok(u64::from(added))
    }

    fn srem(&mut self, key: &str, member: &str) -> DriverResult<u64> {
        let mut data = self.data()?;
        data.expect_type(key, KeyType::Set)?;
        let Some(set) = data.sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            data.sets.remove(key);
        }
        if removed {
            data.touch(key);
        }
        Ok(u64::from(removed))
    }

    fn smembers(&mut self, key: &str) -> DriverResult<Vec<String>> {
        let mut data = self.data()?;
        data.expect_type(key, KeyType::Set)?;
        Ok(data
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn watch(&mut self, keys: &[String]) -> DriverResult<()> {
        let mut fresh: Vec<String> = keys
            .iter()
            .filter(|k| !self.watched.contains_key(*k))
            .cloned()
            .collect();
        fresh.sort();
        fresh.dedup();
        let versions: Vec<(String, u64)> = {
            let mut data = self.data()?;
            fresh
                .into_iter()
                .map(|key| {
                    data.add_watcher(&key);
                    let version = data.version(&key);
                    (key, version)
                })
                .collect()
        };
        self.watched.extend(versions);
        Ok(())
    }

    fn unwatch(&mut self) -> DriverResult<()> {
        self.release_watches();
        Ok(())
    }

    fn exec(&mut self, ops: &[WriteOp]) -> DriverResult<bool> {
        let result = self.exec_watched(ops);
        self.release_watches();
        result
    }

    fn flushall(&mut self) -> DriverResult<()> {
        let mut data = self.data()?;
        let keys = data.live_keys();
        for key in &keys {
            data.touch(key);
        }
        data.strings.clear();
        data.zsets.clear();
        data.sets.clear();
        for key in &keys {
            data.forget_version(key);
        }
        Ok(())
    }

    fn config_set(&mut self, parameter: &str, value: &str) -> DriverResult<()> {
        self.check_alive()?;
        self.node
            .config
            .lock()
            .insert(parameter.to_lowercase(), value.to_string());
        Ok(())
    }

    fn sentinel_master_addr(&mut self, master_set: &str) -> DriverResult<Option<(String, String)>> {
        self.data().map(|_| ())?;
        Ok(self
            .node
            .masters
            .lock()
            .get(master_set)
            .map(|addr| (addr.host.clone(), addr.port.to_string())))
    }

    fn follow_switch_master(
        &mut self,
        poll: Duration,
        on_event: &mut dyn FnMut(Option<MasterSwitch>) -> bool,
    ) -> DriverResult<()> {
        self.check_alive()?;
        let (tx, rx) = mpsc::channel();
        let id = self.node.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.node.subscribers.lock().push((id, tx));

        let result = loop {
            let event = match rx.recv_timeout(poll) {
                Ok(payload) => MasterSwitch::parse(&payload),
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.check_alive() {
                        break Err(e);
                    }
                    None
                }
                Err(RecvTimeoutError::Disconnected) => break Err(DriverError::eof()),
            };
            if !on_event(event) {
                break Ok(());
            }
        };
        self.node.subscribers.lock().retain(|(sid, _)| *sid != id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect() -> (Arc<MemoryCluster>, ServerAddr, Box<dyn StoreConnection>) {
        let cluster = Arc::new(MemoryCluster::new());
        let addr = ServerAddr::new("127.0.0.1", 6379);
        cluster.add_node(&addr);
        let conn = cluster.dial(&addr).unwrap();
        (cluster, addr, conn)
    }

    #[test]
    fn strings_and_keys() {
        let (_cluster, _addr, mut conn) = connect();
        conn.set("Systems:1", "{}", None).unwrap();
        conn.set("Systems:2", "{}", None).unwrap();
        conn.set("Chassis:1", "{}", None).unwrap();
        assert_eq!(conn.get("Systems:1").unwrap().as_deref(), Some("{}"));
        assert_eq!(conn.get("missing").unwrap(), None);
        assert_eq!(conn.keys("Systems:*").unwrap(), vec!["Systems:1", "Systems:2"]);
        assert_eq!(conn.del(&["Systems:1".into(), "nope".into()]).unwrap(), 1);
    }

    #[test]
    fn wrongtype_is_a_response_error() {
        let (_cluster, _addr, mut conn) = connect();
        conn.zadd("idx", 1.0, "a::1").unwrap();
        let err = conn.get("idx").unwrap_err();
        assert!(err.to_string().starts_with("WRONGTYPE"));
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn scan_pages_until_cursor_returns_to_zero() {
        let (_cluster, _addr, mut conn) = connect();
        for i in 0..25 {
            conn.set(&format!("k:{:02}", i), "v", None).unwrap();
        }
        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, keys) = conn.scan(cursor, "k:*", 10).unwrap();
            seen.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
    }

    #[test]
    fn zrange_and_scores() {
        let (_cluster, _addr, mut conn) = connect();
        conn.zadd("idx", 3.0, "3::c").unwrap();
        conn.zadd("idx", 1.0, "1::a").unwrap();
        conn.zadd("idx", 2.0, "2::b").unwrap();
        assert_eq!(conn.zrange("idx", 0, -1).unwrap(), vec!["1::a", "2::b", "3::c"]);
        assert_eq!(conn.zrange("idx", -2, -1).unwrap(), vec!["2::b", "3::c"]);
        assert_eq!(conn.zrangebyscore("idx", 2.0, 3.0).unwrap(), vec!["2::b", "3::c"]);
        assert_eq!(conn.zcount("idx", 0.0, 1.5).unwrap(), 1);
        assert_eq!(conn.zrem("idx", &["1::a".into()]).unwrap(), 1);
    }

    #[test]
    fn watch_aborts_exec_after_concurrent_write() {
        let (cluster, addr, mut conn) = connect();
        let mut other = cluster.dial(&addr).unwrap();
        conn.set("k", "1", None).unwrap();
        conn.watch(&["k".into()]).unwrap();
        other.set("k", "2", None).unwrap();
        assert!(!conn.exec(&[WriteOp::set("k", "3")]).unwrap());
        assert_eq!(conn.get("k").unwrap().as_deref(), Some("2"));

        conn.watch(&["k".into()]).unwrap();
        assert!(conn.exec(&[WriteOp::set("k", "3")]).unwrap());
        assert_eq!(conn.get("k").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn down_node_refuses_dials_and_breaks_connections() {
        let (cluster, addr, mut conn) = connect();
        cluster.set_node_up(&addr, false);
        assert!(conn.ping().unwrap_err().is_connection_failure());
        assert!(cluster.dial(&addr).err().unwrap().is_connection_failure());

        cluster.set_node_up(&addr, true);
        assert!(conn.ping().is_err());
        assert!(cluster.dial(&addr).unwrap().ping().is_ok());
    }

    #[test]
    fn replicas_share_the_keyspace() {
        let cluster = MemoryCluster::new();
        let master = ServerAddr::new("10.0.0.1", 6379);
        let replica = ServerAddr::new("10.0.0.2", 6379);
        cluster.add_replica(&replica, &master);
        cluster.dial(&master).unwrap().set("k", "v", None).unwrap();
        assert_eq!(cluster.dial(&replica).unwrap().get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn sentinel_lookup() {
        let cluster = MemoryCluster::new();
        let sentinel = ServerAddr::new("10.0.0.1", 26379);
        cluster.set_sentinel_master(&sentinel, "mymaster", Some(ServerAddr::new("10.0.0.5", 6379)));
        let mut conn = cluster.dial(&sentinel).unwrap();
        assert_eq!(
            conn.sentinel_master_addr("mymaster").unwrap(),
            Some(("10.0.0.5".to_string(), "6379".to_string()))
        );
        assert_eq!(conn.sentinel_master_addr("other").unwrap(), None);
    }

    #[test]
    fn versions_of_removed_keys_are_pruned() {
        let (cluster, addr, mut conn) = connect();
        conn.set("k", "1", None).unwrap();
        conn.del(&["k".into()]).unwrap();
        conn.zadd("idx", 1.0, "1::a").unwrap();
        conn.zrem("idx", &["1::a".into()]).unwrap();
        conn.set("gone", "1", None).unwrap();
        conn.flushall().unwrap();
        let store = cluster.store(&addr).unwrap();
        assert!(store.data.lock().versions.is_empty());
    }

    #[test]
    fn watched_key_keeps_its_version_until_released() {
        let (cluster, addr, mut conn) = connect();
        let mut other = cluster.dial(&addr).unwrap();
        conn.watch(&["k".into()]).unwrap();
        other.set("k", "1", None).unwrap();
        other.del(&["k".into()]).unwrap();
        assert!(!conn.exec(&[WriteOp::set("k", "2")]).unwrap());

        let store = cluster.store(&addr).unwrap();
        let data = store.data.lock();
        assert!(data.versions.is_empty());
        assert!(data.watchers.is_empty());
    }

    #[test]
    fn dropped_connection_releases_watches() {
        let (cluster, addr, mut conn) = connect();
        conn.watch(&["a".into(), "b".into(), "a".into()]).unwrap();
        assert_eq!(cluster.store(&addr).unwrap().data.lock().watchers.len(), 2);
        drop(conn);
        assert!(cluster.store(&addr).unwrap().data.lock().watchers.is_empty());
    }

    #[test]
    fn config_set_is_recorded_per_node() {
        let (cluster, addr, mut conn) = connect();
        conn.config_set("notify-keyspace-events", "Ex").unwrap();
        assert_eq!(cluster.config_value(&addr, "notify-keyspace-events").as_deref(), Some("Ex"));
        assert_eq!(cluster.config_value(&addr, "maxmemory"), None);
    }

    #[test]
    fn switch_master_reaches_subscribers() {
        let cluster = Arc::new(MemoryCluster::new());
        let sentinel = ServerAddr::new("10.0.0.9", 26379);
        let old = ServerAddr::new("10.0.0.1", 6379);
        let new = ServerAddr::new("10.0.0.2", 6379);
        cluster.set_sentinel_master(&sentinel, "mymaster", Some(old.clone()));
        let mut conn = cluster.dial(&sentinel).unwrap();

        let publisher = {
            let cluster = cluster.clone();
            let sentinel = sentinel.clone();
            let new = new.clone();
            std::thread::spawn(move || {
                while cluster.switch_subscribers(&sentinel) == 0 {
                    std::thread::sleep(Duration::from_millis(1));
                }
                cluster.switch_master(&sentinel, "mymaster", new)
            })
        };

        let mut seen = Vec::new();
        conn.follow_switch_master(Duration::from_millis(10), &mut |event| {
            if let Some(event) = event {
                seen.push(event);
            }
            seen.is_empty()
        })
        .unwrap();

        assert_eq!(publisher.join().unwrap(), 1);
        assert_eq!(seen[0].old_master, old);
        assert_eq!(seen[0].new_master, new);
        assert_eq!(cluster.switch_subscribers(&sentinel), 0);
        assert_eq!(
            cluster.dial(&sentinel).unwrap().sentinel_master_addr("mymaster").unwrap(),
            Some(("10.0.0.2".to_string(), "6379".to_string()))
        );
    }

    #[test]
    fn subscription_ends_when_sentinel_goes_down() {
        let cluster = MemoryCluster::new();
        let sentinel = ServerAddr::new("10.0.0.9", 26379);
        cluster.set_sentinel_master(&sentinel, "mymaster", None);
        let mut conn = cluster.dial(&sentinel).unwrap();
        cluster.set_node_up(&sentinel, false);
        let err = conn
            .follow_switch_master(Duration::from_millis(5), &mut |_| true)
            .unwrap_err();
        assert!(err.is_connection_failure());
    }

    #[test]
    fn ttl_and_incr() {
        let (_cluster, _addr, mut conn) = connect();
        assert_eq!(conn.ttl("missing").unwrap(), -2);
        conn.set("plain", "1", None).unwrap();
        assert_eq!(conn.ttl("plain").unwrap(), -1);
        conn.set("exp", "1", Some(Duration::from_secs(30))).unwrap();
        assert_eq!(conn.ttl("exp").unwrap(), 30);
        assert_eq!(conn.incr_by("plain", 4).unwrap(), 5);
        assert_eq!(conn.incr_by("counter", -1).unwrap(), -1);
    }
}
