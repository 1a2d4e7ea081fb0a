//! Engine configuration.

use std::time::Duration;

use nlm_proto::defaults::*;

/// Tunables for one lock-manager instance. Built from CLI flags by the
/// binary; tests construct it directly with short timeouts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name we register ourselves under with the status monitor.
    pub node_name: String,
    /// Post-startup window during which only reclaims are honored.
    pub grace_period: Duration,
    /// Idle time after which an unreferenced, lock-free host is
    /// eligible for destruction.
    pub idle_timeout: Duration,
    /// Wake interval for threads waiting on host recovery.
    pub retrans_timeout: Duration,
    /// Status-monitor bind attempts before startup fails.
    pub sm_bind_retries: u32,
    /// Fixed backoff between bind attempts.
    pub sm_bind_backoff: Duration,
    /// Bound on concurrently parked blocking lock waits.
    pub max_blocking_waiters: usize,
    /// Cached RPC handles per (host, version).
    pub rpc_cache_per_vers: usize,
    /// Backoff between shutdown drain passes.
    pub shutdown_drain_backoff: Duration,
    /// Drain passes before shutdown gives up on referenced hosts.
    pub shutdown_drain_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "lockd".to_string(),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            retrans_timeout: Duration::from_secs(DEFAULT_RETRANS_TIMEOUT_SECS),
            sm_bind_retries: DEFAULT_SM_BIND_RETRIES,
            sm_bind_backoff: Duration::from_millis(DEFAULT_SM_BIND_BACKOFF_MS),
            max_blocking_waiters: DEFAULT_MAX_BLOCKING_WAITERS,
            rpc_cache_per_vers: DEFAULT_RPC_CACHE_PER_VERS,
            shutdown_drain_backoff: Duration::from_millis(DEFAULT_SHUTDOWN_DRAIN_BACKOFF_MS),
            shutdown_drain_attempts: DEFAULT_SHUTDOWN_DRAIN_ATTEMPTS,
        }
    }
}
