//! Redis backend over the `redis` crate's synchronous client

use crate::connection::{Dialer, MasterSwitch, StoreConnection, WriteOp, SWITCH_MASTER_CHANNEL};
use fleetstore_core::{DriverError, DriverResult, ServerAddr};
use redis::{ErrorKind, IntoConnectionInfo, RedisError};
use std::io;
use std::time::Duration;
use tracing::debug;

/// Opens plain TCP connections to Redis servers and Sentinels
#[derive(Debug, Clone)]
pub struct RedisDialer {
    password: Option<String>,
    dial_timeout: Duration,
}

impl RedisDialer {
    /// Dialer without authentication
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            password: None,
            dial_timeout,
        }
    }

    /// Authenticate every connection with `password`
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }
}

impl Dialer for RedisDialer {
    fn dial(&self, addr: &ServerAddr) -> DriverResult<Box<dyn StoreConnection>> {
        let mut info = format!("redis://{}:{}/0", addr.host, addr.port)
            .into_connection_info()
            .map_err(map_redis_error)?;
        info.redis.password = self.password.clone();

        let client = redis::Client::open(info).map_err(map_redis_error)?;
        let conn = client
            .get_connection_with_timeout(self.dial_timeout)
            .map_err(map_redis_error)?;
        debug!(target: "fleetstore::pool", addr = %addr, "dialed redis");
        Ok(Box::new(RedisConnection { conn }))
    }
}

/// One synchronous Redis connection
pub struct RedisConnection {
    conn: redis::Connection,
}

/// Map a driver error onto [`DriverError`], keeping connection failures
/// recognisable to the classifier.
pub fn map_redis_error(err: RedisError) -> DriverError {
    let text = err.to_string();
    if err.is_connection_refusal() {
        DriverError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, text))
    } else if err.is_timeout() {
        DriverError::Io(io::Error::new(io::ErrorKind::TimedOut, text))
    } else if err.is_connection_dropped() {
        DriverError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF"))
    } else if err.is_io_error() {
        DriverError::Io(io::Error::new(io::ErrorKind::Other, text))
    } else if err.kind() == ErrorKind::TypeError {
        DriverError::Protocol(text)
    } else {
        match err.code() {
            Some(code) => DriverError::Response(format!("{} {}", code, err.detail().unwrap_or_default())),
            None => DriverError::Response(text),
        }
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

impl RedisConnection {
    fn query<T: redis::FromRedisValue>(&mut self, cmd: &redis::Cmd) -> DriverResult<T> {
        cmd.query(&mut self.conn).map_err(map_redis_error)
    }
}

impl StoreConnection for RedisConnection {
    fn ping(&mut self) -> DriverResult<()> {
        let _: String = self.query(&redis::cmd("PING"))?;
        Ok(())
    }

    fn get(&mut self, key: &str) -> DriverResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key))
    }

    fn mget(&mut self, keys: &[String]) -> DriverResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.query(redis::cmd("MGET").arg(keys))
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> DriverResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.query(&cmd)
    }

    fn del(&mut self, keys: &[String]) -> DriverResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(keys))
    }

    fn keys(&mut self, pattern: &str) -> DriverResult<Vec<String>> {
        self.query(redis::cmd("KEYS").arg(pattern))
    }

    fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> DriverResult<(u64, Vec<String>)> {
        self.query(
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count),
        )
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> DriverResult<i64> {
        self.query(redis::cmd("INCRBY").arg(key).arg(delta))
    }

    fn ttl(&mut self, key: &str) -> DriverResult<i64> {
        self.query(redis::cmd("TTL").arg(key))
    }

    fn zadd(&mut self, index: &str, score: f64, member: &str) -> DriverResult<u64> {
        self.query(redis::cmd("ZADD").arg(index).arg(score_arg(score)).arg(member))
    }

    fn zscan(
        &mut self,
        index: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> DriverResult<(u64, Vec<(String, f64)>)> {
        let (next, flat): (u64, Vec<String>) = self.query(
            redis::cmd("ZSCAN")
                .arg(index)
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count),
        )?;
        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut items = flat.into_iter();
        while let (Some(member), Some(score)) = (items.next(), items.next()) {
            let score = score
                .parse::<f64>()
                .map_err(|e| DriverError::Protocol(format!("bad zscan score '{}': {}", score, e)))?;
            pairs.push((member, score));
        }
        Ok((next, pairs))
    }

    fn zrange(&mut self, index: &str, start: i64, stop: i64) -> DriverResult<Vec<String>> {
        self.query(redis::cmd("ZRANGE").arg(index).arg(start).arg(stop))
    }

    fn zrangebyscore(&mut self, index: &str, min: f64, max: f64) -> DriverResult<Vec<String>> {
        self.query(
            redis::cmd("ZRANGEBYSCORE")
                .arg(index)
                .arg(score_arg(min))
                .arg(score_arg(max)),
        )
    }

    fn zrem(&mut self, index: &str, members: &[String]) -> DriverResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("ZREM").arg(index).arg(members))
    }

    fn zcount(&mut self, index: &str, min: f64, max: f64) -> DriverResult<u64> {
        self.query(
            redis::cmd("ZCOUNT")
                .arg(index)
                .arg(score_arg(min))
                .arg(score_arg(max)),
        )
    }

    fn sadd(&mut self, key: &str, member: &str) -> DriverResult<u64> {
        self.query(redis::cmd("SADD").arg(key).arg(member))
    }

    fn srem(&mut self, key: &str, member: &str) -> DriverResult<u64> {
        self.query(redis::cmd("SREM").arg(key).arg(member))
    }

    fn smembers(&mut self, key: &str) -> DriverResult<Vec<String>> {
        self.query(redis::cmd("SMEMBERS").arg(key))
    }

    fn watch(&mut self, keys: &[String]) -> DriverResult<()> {
        // bare WATCH is an arity error
        if keys.is_empty() {
            return Ok(());
        }
        self.query(redis::cmd("WATCH").arg(keys))
    }

    fn unwatch(&mut self) -> DriverResult<()> {
        self.query(&redis::cmd("UNWATCH"))
    }

    fn exec(&mut self, ops: &[WriteOp]) -> DriverResult<bool> {
        if ops.is_empty() {
            self.unwatch()?;
            return Ok(true);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                WriteOp::Set { key, value, ttl } => {
                    pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        pipe.arg("PX").arg(ttl.as_millis() as u64);
                    }
                }
                WriteOp::Del { keys } => {
                    pipe.cmd("DEL").arg(keys);
                }
                WriteOp::ZAdd {
                    index,
                    score,
                    member,
                } => {
                    pipe.cmd("ZADD").arg(index).arg(score_arg(*score)).arg(member);
                }
                WriteOp::ZRem { index, members } => {
                    pipe.cmd("ZREM").arg(index).arg(members);
                }
                WriteOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64);
                }
            }
            pipe.ignore();
        }
        // EXEC answers nil when a watched key changed
        let reply: Option<Vec<redis::Value>> = pipe.query(&mut self.conn).map_err(map_redis_error)?;
        Ok(reply.is_some())
    }

    fn flushall(&mut self) -> DriverResult<()> {
        self.query(&redis::cmd("FLUSHALL"))
    }

    fn config_set(&mut self, parameter: &str, value: &str) -> DriverResult<()> {
        self.query(redis::cmd("CONFIG").arg("SET").arg(parameter).arg(value))
    }

    fn sentinel_master_addr(&mut self, master_set: &str) -> DriverResult<Option<(String, String)>> {
        let reply: Option<Vec<String>> = self.query(
            redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master_set),
        )?;
        Ok(match reply {
            Some(parts) if parts.len() == 2 => {
                let mut parts = parts.into_iter();
                parts.next().zip(parts.next())
            }
            _ => None,
        })
    }

    fn follow_switch_master(
        &mut self,
        poll: Duration,
        on_event: &mut dyn FnMut(Option<MasterSwitch>) -> bool,
    ) -> DriverResult<()> {
        let mut pubsub = self.conn.as_pubsub();
        pubsub.subscribe(SWITCH_MASTER_CHANNEL).map_err(map_redis_error)?;
        pubsub.set_read_timeout(Some(poll)).map_err(map_redis_error)?;
        loop {
            let event = match pubsub.get_message() {
                Ok(msg) => {
                    let payload: String = msg.get_payload().map_err(map_redis_error)?;
                    let event = MasterSwitch::parse(&payload);
                    if event.is_none() {
                        debug!(target: "fleetstore::discovery", payload = %payload, "ignoring malformed switch-master payload");
                    }
                    event
                }
                Err(e) if e.is_timeout() => None,
                Err(e) => return Err(map_redis_error(e)),
            };
            if !on_event(event) {
                return Ok(());
            }
        }
    }
}
