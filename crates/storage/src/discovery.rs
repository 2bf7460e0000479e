//! Sentinel master discovery

use crate::connection::Dialer;
use fleetstore_core::{RetryConfig, ServerAddr, StoreConfig, StoreError, StoreResult};
use tracing::{info, warn};

/// Ask the configured Sentinel for the current master of `config.master_set`.
///
/// Returns `Ok(None)` when the Sentinel does not know the set. Failing to
/// reach or query the Sentinel is an `UndefinedErrorType`.
pub fn resolve_master(dialer: &dyn Dialer, config: &StoreConfig) -> StoreResult<Option<ServerAddr>> {
    let sentinel = config
        .sentinel_addr()
        .ok_or_else(|| StoreError::undefined("sentinel is not configured for this store"))?;

    let mut conn = dialer.dial(&sentinel).map_err(|e| {
        StoreError::undefined(format!("failed to connect to sentinel {}: {}", sentinel, e))
    })?;

    let reply = conn.sentinel_master_addr(&config.master_set).map_err(|e| {
        StoreError::undefined(format!(
            "failed to get master address for {} from sentinel {}: {}",
            config.master_set, sentinel, e
        ))
    })?;

    match reply {
        Some((host, port)) if !host.is_empty() => ServerAddr::from_parts(&host, &port).map(Some),
        _ => {
            warn!(
                target: "fleetstore::discovery",
                master_set = %config.master_set,
                sentinel = %sentinel,
                "sentinel returned no master for set"
            );
            Ok(None)
        }
    }
}

/// Query the Sentinel until it names a master, up to `retry.max_attempts`
/// times, `retry.interval` apart.
///
/// Query errors count as failed attempts. Returns `None` once the bound is
/// reached.
pub fn retry_resolve_master(
    last_known_ip: &str,
    dialer: &dyn Dialer,
    config: &StoreConfig,
    retry: &RetryConfig,
) -> Option<ServerAddr> {
    for attempt in 0..retry.max_attempts {
        if attempt > 0 {
            std::thread::sleep(retry.interval);
        }
        match resolve_master(dialer, config) {
            Ok(Some(master)) => {
                if master.host != last_known_ip {
                    info!(
                        target: "fleetstore::discovery",
                        previous = %last_known_ip,
                        current = %master,
                        master_set = %config.master_set,
                        "master changed"
                    );
                }
                return Some(master);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    target: "fleetstore::discovery",
                    attempt,
                    error = %e,
                    "master lookup failed"
                );
            }
        }
    }
    warn!(
        target: "fleetstore::discovery",
        attempts = retry.max_attempts,
        master_set = %config.master_set,
        "gave up waiting for a master"
    );
    None
}
