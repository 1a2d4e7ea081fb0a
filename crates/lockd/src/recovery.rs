//! Client-side lock recovery.
//!
//! When the status monitor tells us a server we hold locks on came
//! back, the client-side notify path flags the host RECLAIMING and
//! spawns one reclaimer task for it. The task drives re-assertion of
//! our locks through the [`LockReclaimer`] collaborator, then clears
//! the flag, wakes anyone parked in [`wait_grace`], and drops the
//! reference the spawn took.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::daemon::{Globals, RunStatus};
use crate::host::Host;

/// Re-asserts our outstanding locks on one restarted server.
/// Best-effort and self-contained: it must not block the rest of the
/// engine, and completion is signalled simply by returning.
#[async_trait]
pub trait LockReclaimer: Send + Sync {
    async fn reclaim(&self, host: &Arc<Host>);
}

/// Reclaimer that re-asserts nothing. Used when the instance has no
/// client side, and by tests that only watch the state machine.
pub struct NullReclaimer;

#[async_trait]
impl LockReclaimer for NullReclaimer {
    async fn reclaim(&self, host: &Arc<Host>) {
        debug!("no locks to reclaim on {}", host.name);
    }
}

/// Body of the per-host reclaimer task.
pub(crate) async fn reclaimer_task(g: Arc<Globals>, host: Arc<Host>) {
    info!("lock recovery for {} started", host.name);

    g.reclaimer.reclaim(&host).await;

    host.inner.lock().await.reclaiming = false;
    host.recovery_notify.notify_waiters();
    info!("lock recovery for {} completed", host.name);

    // Drop the reference the notify path took when it spawned us.
    g.host_release(&host).await;
}

/// Outcome of waiting for a host's recovery to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceWaitResult {
    /// Recovery finished; the caller may proceed.
    Ready,
    /// The wait was interrupted by shutdown.
    Interrupted,
}

/// Park until the host finishes reclaiming. Wakes every
/// `retrans_timeout` so shutdown can interrupt the wait.
pub async fn wait_grace(g: &Globals, host: &Arc<Host>) -> GraceWaitResult {
    loop {
        let notified = host.recovery_notify.notified();
        if !host.is_reclaiming().await {
            return GraceWaitResult::Ready;
        }
        if matches!(
            g.run_status().await,
            RunStatus::Stopping | RunStatus::Down
        ) {
            return GraceWaitResult::Interrupted;
        }
        let _ = timeout(g.config.retrans_timeout, notified).await;
    }
}
