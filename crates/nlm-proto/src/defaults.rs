//! Tunable operational defaults for the lock manager.
//!
//! Protocol-level constants (program numbers, sysid encoding) remain in
//! [`crate::constants`]. This module centralizes the configurable
//! defaults that can be overridden via CLI flags.

// ─── Grace / Recovery ───────────────────────────────────────────────────────

/// Seconds after startup during which only reclaim requests are honored.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 90;

/// Wake interval while a thread waits for a host to finish reclaiming,
/// so cancellation can be observed between waits.
pub const DEFAULT_RETRANS_TIMEOUT_SECS: u64 = 5;

// ─── Host Garbage Collection ────────────────────────────────────────────────

/// Seconds a host may sit unreferenced and lock-free before it becomes
/// eligible for destruction.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Backoff between shutdown drain passes while handlers still hold
/// host references.
pub const DEFAULT_SHUTDOWN_DRAIN_BACKOFF_MS: u64 = 50;

/// Maximum shutdown drain passes before giving up on stragglers.
pub const DEFAULT_SHUTDOWN_DRAIN_ATTEMPTS: u32 = 100;

// ─── Status Monitor Discovery ───────────────────────────────────────────────

/// Attempts to bind the status-monitor endpoint before startup fails.
pub const DEFAULT_SM_BIND_RETRIES: u32 = 10;

/// Fixed backoff between status-monitor bind attempts (milliseconds).
pub const DEFAULT_SM_BIND_BACKOFF_MS: u64 = 1000;

// ─── Resource Bounds ────────────────────────────────────────────────────────

/// Bound on concurrently parked server-side blocking lock waits. When
/// the pool is exhausted a blocking LOCK is answered `DeniedNolocks`
/// instead of being parked.
pub const DEFAULT_MAX_BLOCKING_WAITERS: usize = 256;

/// Cached RPC handles kept per (host, protocol version).
pub const DEFAULT_RPC_CACHE_PER_VERS: usize = 4;
