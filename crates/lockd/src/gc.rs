//! Idle-host garbage collection.
//!
//! One task per instance walks the idle list and destroys hosts that
//! have sat unreferenced past their deadline with nothing left to pin
//! them: no vholds, no locks or shares attributed to their sysid on
//! either side.
//!
//! The expensive checks run without the registry lock. After taking it
//! back the decision is revalidated against the deadline and refcount,
//! so a handler that grabbed the host mid-check always wins over the
//! reaper.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use nlm_core::flock::{LockManager, LockQuery};
use nlm_proto::constants::SYSID_CLIENT_FLAG;

use crate::daemon::{Globals, RunStatus};
use crate::host::Host;

/// GC task body. Parks on the GC notify up to `idle_timeout` between
/// passes; shutdown and on-demand schedules wake it early.
pub(crate) async fn gc_task(g: Arc<Globals>) {
    info!("host reaper started");
    loop {
        let notified = g.gc_notify.notified();
        if g.run_status().await == RunStatus::Stopping {
            break;
        }
        let _ = tokio::time::timeout(g.config.idle_timeout, notified).await;
        if g.run_status().await == RunStatus::Stopping {
            break;
        }
        gc_pass(&g).await;
    }
    info!("host reaper exiting");
}

/// One reap pass over the expired head of the idle list.
pub(crate) async fn gc_pass(g: &Globals) {
    let now = Instant::now();
    loop {
        let host = {
            let mut reg = g.registry.write().await;
            match reg.pop_expired_idle(now) {
                Some(h) => h,
                None => break,
            }
        };
        let seen_deadline = host.idle_deadline();

        // Expensive host work with the registry lock dropped.
        let has_locks = host_has_locks(g, &host).await;

        let mut reg = g.registry.write().await;
        if host.idle_deadline() != seen_deadline {
            // A handler grabbed and released the host meanwhile; its
            // new deadline governs. The release re-parked it.
            continue;
        }
        if host.refs() > 0 {
            // Grabbed and still held; it left the idle list.
            continue;
        }
        if has_locks {
            // Something still pins the host. Push the deadline out and
            // park it at the tail.
            host.restamp_idle(now + g.config.idle_timeout);
            reg.push_idle(host.clone());
            continue;
        }

        reg.remove(&host);
        drop(reg);

        debug!("reaping idle host {} (sysid {})", host.name, host.sysid);
        g.host_unmonitor(&host).await;
        g.host_destroy(&host).await;
    }
}

/// Whether anything still ties the host to lock state: a surviving
/// vhold after a GC sweep, or client-side locks we hold on the peer.
async fn host_has_locks(g: &Globals, host: &Arc<Host>) -> bool {
    let vholds_left = {
        let mut inner = host.inner.lock().await;
        g.vhold_gc_locked(host.sysid, &mut inner.vholds).await;
        !inner.vholds.is_empty()
    };
    vholds_left
        || g.lockmgr
            .sysid_has_locks(host.sysid | SYSID_CLIENT_FLAG, LockQuery::BOTH)
            .await
}
