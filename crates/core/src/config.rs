//! Store configuration via `fleetstore.toml`
//!
//! One [`DbConf`] describes both logical stores (in-memory and on-disk).
//! [`DbConf::store_config`] projects it onto the per-store [`StoreConfig`]
//! that the connection layer consumes.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Config file name conventionally used for [`DbConf`].
pub const CONFIG_FILE_NAME: &str = "fleetstore.toml";

/// Only protocol the store speaks.
pub const DEFAULT_PROTOCOL: &str = "tcp";
/// Default cap on total connections per pool.
pub const DEFAULT_MAX_ACTIVE_CONNS: usize = 120;
/// Default cap on idle connections kept per pool.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 10;
/// Connections idle longer than this are pinged before reuse.
pub const DEFAULT_IDLE_CHECK_SECS: u64 = 60;
/// Dial timeout for new connections.
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5000;

/// The two independently configured logical stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    /// Volatile store (sessions, tasks, subscriptions)
    InMemory,
    /// Persistent store (inventory)
    OnDisk,
}

impl StoreKind {
    /// Both kinds, in a fixed order
    pub const ALL: [StoreKind; 2] = [StoreKind::InMemory, StoreKind::OnDisk];

    /// Short name for logs
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKind::InMemory => "in-memory",
            StoreKind::OnDisk => "on-disk",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    /// Host name or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ServerAddr {
    /// Build an address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse the `(ip, port)` pair a Sentinel reports.
    pub fn from_parts(host: &str, port: &str) -> StoreResult<Self> {
        let port = port.trim().parse::<u16>().map_err(|e| {
            StoreError::undefined(format!("invalid port '{}' for host {}: {}", port, host, e))
        })?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identifies one logical store instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Static host (reads always go here)
    pub host: String,
    /// Static port
    pub port: u16,
    /// Transport protocol, always `"tcp"`
    pub protocol: String,
    /// Sentinel host; falls back to `host` when empty
    pub sentinel_host: String,
    /// Sentinel port; `None` disables HA
    pub sentinel_port: Option<u16>,
    /// Master-set name tracked by the Sentinel; empty disables HA
    pub master_set: String,
    /// Optional AUTH password
    pub password: Option<String>,
}

impl StoreConfig {
    /// Non-HA config pointing at a single static address
    pub fn standalone(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: DEFAULT_PROTOCOL.to_string(),
            sentinel_host: String::new(),
            sentinel_port: None,
            master_set: String::new(),
            password: None,
        }
    }

    /// Enable Sentinel-based master discovery
    pub fn with_sentinel(
        mut self,
        sentinel_host: impl Into<String>,
        sentinel_port: u16,
        master_set: impl Into<String>,
    ) -> Self {
        self.sentinel_host = sentinel_host.into();
        self.sentinel_port = Some(sentinel_port);
        self.master_set = master_set.into();
        self
    }

    /// Set the AUTH password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// HA is on iff both a sentinel port and a master set are configured
    pub fn ha_enabled(&self) -> bool {
        self.sentinel_port.is_some() && !self.master_set.is_empty()
    }

    /// Static address used for the read pool
    pub fn static_addr(&self) -> ServerAddr {
        ServerAddr::new(self.host.clone(), self.port)
    }

    /// Address of the Sentinel, if HA is enabled
    pub fn sentinel_addr(&self) -> Option<ServerAddr> {
        if !self.ha_enabled() {
            return None;
        }
        let host = if self.sentinel_host.is_empty() {
            self.host.clone()
        } else {
            self.sentinel_host.clone()
        };
        self.sentinel_port.map(|port| ServerAddr::new(host, port))
    }
}

/// Connection pool sizing and health-check settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle connections kept for reuse
    pub max_idle: usize,
    /// Total connections (idle + checked out)
    pub max_active: usize,
    /// Idle time after which a connection is pinged before reuse
    pub idle_check_after: Duration,
    /// Dial timeout
    pub dial_timeout: Duration,
    /// How long a caller waits for a free slot once `max_active` is reached
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE_CONNS,
            max_active: DEFAULT_MAX_ACTIVE_CONNS,
            idle_check_after: Duration::from_secs(DEFAULT_IDLE_CHECK_SECS),
            dial_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
            wait_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
        }
    }
}

impl PoolConfig {
    /// Set the idle cap
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the active cap
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Set the idle health-check window
    pub fn with_idle_check_after(mut self, window: Duration) -> Self {
        self.idle_check_after = window;
        self
    }

    /// Set the checkout wait timeout
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

/// Master discovery retry bound
///
/// # Example
/// ```ignore
/// let retry = RetryConfig::new().with_max_attempts(5).with_interval(Duration::from_millis(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum Sentinel queries per rebuild
    pub max_attempts: usize,
    /// Pause between queries
    pub interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Create a RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt bound
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the pause between attempts
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Database configuration loaded from `fleetstore.toml`.
///
/// # Example
///
/// ```toml
/// in_memory_host = "redis-inmemory"
/// in_memory_port = 6379
/// on_disk_host = "redis-ondisk"
/// on_disk_port = 6380
/// redis_ha_enabled = true
/// in_memory_sentinel_port = 26379
/// in_memory_primary_set = "inmemory-primary"
/// on_disk_sentinel_port = 26380
/// on_disk_primary_set = "ondisk-primary"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DbConf {
    /// Transport protocol; anything but `"tcp"` is replaced with `"tcp"`
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// In-memory store host
    #[serde(default)]
    pub in_memory_host: String,
    /// In-memory store port
    #[serde(default)]
    pub in_memory_port: u16,
    /// On-disk store host
    #[serde(default)]
    pub on_disk_host: String,
    /// On-disk store port
    #[serde(default)]
    pub on_disk_port: u16,
    /// Idle connection cap per pool
    #[serde(default)]
    pub max_idle_conns: usize,
    /// Active connection cap per pool
    #[serde(default)]
    pub max_active_conns: usize,
    /// Resolve write masters through Sentinel
    #[serde(default)]
    pub redis_ha_enabled: bool,
    /// In-memory Sentinel host (defaults to `in_memory_host`)
    #[serde(default)]
    pub in_memory_sentinel_host: String,
    /// In-memory Sentinel port
    #[serde(default)]
    pub in_memory_sentinel_port: u16,
    /// In-memory master-set name
    #[serde(default)]
    pub in_memory_primary_set: String,
    /// On-disk Sentinel host (defaults to `on_disk_host`)
    #[serde(default)]
    pub on_disk_sentinel_host: String,
    /// On-disk Sentinel port
    #[serde(default)]
    pub on_disk_sentinel_port: u16,
    /// On-disk master-set name
    #[serde(default)]
    pub on_disk_primary_set: String,
    /// In-memory AUTH password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_memory_password: Option<String>,
    /// On-disk AUTH password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_disk_password: Option<String>,
    /// Idle health-check window in seconds
    #[serde(default = "default_idle_check_secs")]
    pub idle_check_secs: u64,
    /// Dial timeout in milliseconds
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn default_idle_check_secs() -> u64 {
    DEFAULT_IDLE_CHECK_SECS
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

impl Default for DbConf {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            in_memory_host: "localhost".to_string(),
            in_memory_port: 6379,
            on_disk_host: "localhost".to_string(),
            on_disk_port: 6380,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_active_conns: DEFAULT_MAX_ACTIVE_CONNS,
            redis_ha_enabled: false,
            in_memory_sentinel_host: String::new(),
            in_memory_sentinel_port: 0,
            in_memory_primary_set: String::new(),
            on_disk_sentinel_host: String::new(),
            on_disk_sentinel_port: 0,
            on_disk_primary_set: String::new(),
            in_memory_password: None,
            on_disk_password: None,
            idle_check_secs: DEFAULT_IDLE_CHECK_SECS,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
        }
    }
}

impl DbConf {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# fleetstore configuration
#
# Static addresses. Reads always use these; writes use them too unless
# redis_ha_enabled is set, in which case the write master is resolved
# through Sentinel.
in_memory_host = "localhost"
in_memory_port = 6379
on_disk_host = "localhost"
on_disk_port = 6380

# Pool sizing (defaults: 120 active, 10 idle)
max_active_conns = 120
max_idle_conns = 10

# Connections idle longer than this are pinged before reuse
idle_check_secs = 60

redis_ha_enabled = false
# in_memory_sentinel_port = 26379
# in_memory_primary_set = "inmemory-primary"
# on_disk_sentinel_port = 26380
# on_disk_primary_set = "ondisk-primary"
"#
    }

    /// Parse and validate a TOML document.
    ///
    /// Every default substituted during validation is logged at `warn`.
    pub fn from_toml(content: &str) -> StoreResult<Self> {
        let mut conf: DbConf = toml::from_str(content).map_err(|e| {
            StoreError::undefined(format!("failed to parse store configuration: {}", e))
        })?;
        for warning in conf.validate()? {
            warn!(target: "fleetstore::config", "{}", warning);
        }
        Ok(conf)
    }

    /// Read, parse and validate config from a file path.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::undefined(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Check required fields and substitute defaults.
    ///
    /// Returns the warnings for every default that was applied.
    pub fn validate(&mut self) -> StoreResult<Vec<String>> {
        let mut warnings = Vec::new();
        if self.protocol != DEFAULT_PROTOCOL {
            warnings.push("incorrect value configured for DB protocol, setting default value".to_string());
            self.protocol = default_protocol();
        }
        if self.in_memory_host.is_empty() {
            return Err(missing("in_memory_host"));
        }
        if self.in_memory_port == 0 {
            return Err(missing("in_memory_port"));
        }
        if self.on_disk_host.is_empty() {
            return Err(missing("on_disk_host"));
        }
        if self.on_disk_port == 0 {
            return Err(missing("on_disk_port"));
        }
        if self.max_active_conns == 0 {
            warnings.push("no value configured for max_active_conns, setting default value".to_string());
            self.max_active_conns = DEFAULT_MAX_ACTIVE_CONNS;
        }
        if self.max_idle_conns == 0 {
            warnings.push("no value configured for max_idle_conns, setting default value".to_string());
            self.max_idle_conns = DEFAULT_MAX_IDLE_CONNS;
        }
        if self.redis_ha_enabled {
            if self.in_memory_sentinel_port == 0 {
                return Err(missing("in_memory_sentinel_port"));
            }
            if self.on_disk_sentinel_port == 0 {
                return Err(missing("on_disk_sentinel_port"));
            }
            if self.in_memory_primary_set.is_empty() {
                return Err(missing("in_memory_primary_set"));
            }
            if self.on_disk_primary_set.is_empty() {
                return Err(missing("on_disk_primary_set"));
            }
        }
        Ok(warnings)
    }

    /// Per-store view of this configuration
    pub fn store_config(&self, kind: StoreKind) -> StoreConfig {
        let (host, port, sentinel_host, sentinel_port, master_set, password) = match kind {
            StoreKind::InMemory => (
                &self.in_memory_host,
                self.in_memory_port,
                &self.in_memory_sentinel_host,
                self.in_memory_sentinel_port,
                &self.in_memory_primary_set,
                &self.in_memory_password,
            ),
            StoreKind::OnDisk => (
                &self.on_disk_host,
                self.on_disk_port,
                &self.on_disk_sentinel_host,
                self.on_disk_sentinel_port,
                &self.on_disk_primary_set,
                &self.on_disk_password,
            ),
        };
        let mut config = StoreConfig::standalone(host.clone(), port);
        config.protocol = self.protocol.clone();
        config.password = password.clone();
        if self.redis_ha_enabled {
            config = config.with_sentinel(sentinel_host.clone(), sentinel_port, master_set.clone());
        }
        config
    }

    /// Pool settings derived from this configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle: self.max_idle_conns,
            max_active: self.max_active_conns,
            idle_check_after: Duration::from_secs(self.idle_check_secs),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            wait_timeout: Duration::from_millis(self.dial_timeout_ms),
        }
    }
}

fn missing(field: &str) -> StoreError {
    StoreError::undefined(format!("no value configured for DB {}", field))
}
