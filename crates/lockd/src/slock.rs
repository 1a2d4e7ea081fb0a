//! Client-side sleeping locks.
//!
//! When our client side issues a blocking lock to a remote server and
//! gets `Blocked` back, it parks on a sleeping-lock record until the
//! server's GRANTED call arrives. The records live on one per-zone
//! list, independent of the host tables, because the GRANTED call is
//! routed by the sysid planted in the owner handle, not by transport
//! endpoint.
//!
//! State machine, each transition at most once, waiter frees the
//! record:
//!
//! ```text
//! Blocked --grant-->  Granted
//! Blocked --cancel--> Cancelled
//! ```

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use nlm_core::flock::Flock;
use nlm_proto::Fh;

use crate::daemon::Globals;
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlockState {
    Blocked,
    Granted,
    Cancelled,
}

/// Outcome of waiting for the remote grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlockWaitResult {
    /// The server granted the lock.
    Granted,
    /// No grant arrived in time; the caller retransmits or gives up.
    Timeout,
    /// The wait was cancelled (host crash fan-out or shutdown).
    Interrupted,
}

/// One parked blocking request of ours against a remote server.
pub struct SleepingLock {
    /// The server we are waiting on. Non-owning back-pointer; the
    /// registering caller holds the host reference.
    host: Arc<Host>,
    fh: Fh,
    fl: Flock,
    /// Flipped exactly once, under the zone slock mutex.
    state: StdMutex<SlockState>,
    notify: Notify,
}

impl SleepingLock {
    pub fn state(&self) -> SlockState {
        *self.state.lock().unwrap()
    }

    /// Move out of Blocked. Returns false if already terminal.
    fn transition(&self, to: SlockState) -> bool {
        let mut st = self.state.lock().unwrap();
        if *st != SlockState::Blocked {
            return false;
        }
        *st = to;
        self.notify.notify_one();
        true
    }
}

#[derive(Default)]
pub(crate) struct SlockTable {
    list: Vec<Arc<SleepingLock>>,
}

impl Globals {
    /// Register a sleeping lock before sending the blocking call.
    /// The returned handle is what [`slock_wait`] and
    /// [`Globals::slock_unregister`] operate on.
    pub async fn slock_register(
        &self,
        host: &Arc<Host>,
        fl: Flock,
        fh: Fh,
    ) -> Arc<SleepingLock> {
        let slock = Arc::new(SleepingLock {
            host: host.clone(),
            fh,
            fl,
            state: StdMutex::new(SlockState::Blocked),
            notify: Notify::new(),
        });
        self.slocks.lock().await.list.push(slock.clone());
        slock
    }

    /// Remove a sleeping lock from the zone list. Only the waiter that
    /// registered it calls this.
    pub async fn slock_unregister(&self, slock: &Arc<SleepingLock>) {
        self.slocks
            .lock()
            .await
            .list
            .retain(|s| !Arc::ptr_eq(s, slock));
    }

    /// Route an incoming GRANTED call to the matching blocked entry:
    /// same server, same (svid, offset, len), same file handle bytes.
    /// Returns false when nothing matches (stale or duplicate grant).
    pub async fn slock_grant(
        &self,
        host: &Arc<Host>,
        svid: u32,
        offset: u64,
        len: u64,
        fh: &Fh,
    ) -> bool {
        let table = self.slocks.lock().await;
        for slock in &table.list {
            if Arc::ptr_eq(&slock.host, host)
                && slock.fl.pid == svid
                && slock.fl.start == offset
                && slock.fl.len == len
                && slock.fh == *fh
                && slock.transition(SlockState::Granted)
            {
                return true;
            }
        }
        debug!("unmatched grant from {} for svid {}", host.name, svid);
        false
    }

    /// Cancel every blocked entry waiting on this server.
    pub(crate) async fn slock_cancel_all(&self, host: &Arc<Host>) {
        let table = self.slocks.lock().await;
        for slock in &table.list {
            if Arc::ptr_eq(&slock.host, host) {
                slock.transition(SlockState::Cancelled);
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn slock_count(&self) -> usize {
        self.slocks.lock().await.list.len()
    }
}

/// Wait for the grant, up to `timeout`. A grant that raced in just as
/// the timer fired still counts as granted.
pub async fn slock_wait(slock: &Arc<SleepingLock>, timeout: Duration) -> SlockWaitResult {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let notified = slock.notify.notified();
        match slock.state() {
            SlockState::Granted => return SlockWaitResult::Granted,
            SlockState::Cancelled => return SlockWaitResult::Interrupted,
            SlockState::Blocked => {}
        }
        if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return match slock.state() {
                SlockState::Granted => SlockWaitResult::Granted,
                SlockState::Cancelled => SlockWaitResult::Interrupted,
                SlockState::Blocked => SlockWaitResult::Timeout,
            };
        }
    }
}
