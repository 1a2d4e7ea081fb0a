//! Local advisory byte-range lock manager interface.
//!
//! The engine never manipulates lock tables directly; it drives the
//! file system's advisory locking through this trait, attributing
//! remote owners by sysid. Two contracts the service handlers lean on:
//!
//! - a blocking [`LockManager::set_wait`] is cancelled by an
//!   [`LockManager::unlock`] carrying the identical owner and range
//!   (this is how CANCEL pokes a parked waiter), and
//! - [`LockManager::unlock_sysid`] drops every active lock *and*
//!   cancels every parked waiter attributed to a sysid (the crash
//!   fan-out path).
//!
//! [`MemLockManager`] is the in-process implementation used for
//! development and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::fs::Vnode;

/// Kind of a byte-range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockKind {
    Read,
    Write,
}

/// A byte-range lock in local form. `len == 0` means to end of file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flock {
    pub sysid: u32,
    pub pid: u32,
    pub start: u64,
    pub len: u64,
    pub kind: FlockKind,
}

impl Flock {
    /// Exclusive end of the range; None for to-EOF.
    pub fn end(&self) -> Option<u64> {
        if self.len == 0 {
            None
        } else {
            Some(self.start + self.len)
        }
    }

    pub fn same_owner(&self, other: &Flock) -> bool {
        self.sysid == other.sysid && self.pid == other.pid
    }

    pub fn same_range(&self, other: &Flock) -> bool {
        self.start == other.start && self.len == other.len
    }

    pub fn overlaps(&self, other: &Flock) -> bool {
        let before_other_end = match other.end() {
            Some(e) => self.start < e,
            None => true,
        };
        let other_before_end = match self.end() {
            Some(e) => other.start < e,
            None => true,
        };
        before_other_end && other_before_end
    }

    /// Whether a lock held by `other` blocks this request.
    pub fn conflicts_with(&self, other: &Flock) -> bool {
        !self.same_owner(other)
            && self.overlaps(other)
            && (self.kind == FlockKind::Write || other.kind == FlockKind::Write)
    }
}

/// Result of a non-blocking lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetLockResult {
    Granted,
    /// A conflicting lock is held by another owner.
    Conflict,
    /// The lock table is out of resources.
    NoLocks,
}

/// Result of a blocking lock wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitLockResult {
    Granted,
    /// The wait was cancelled by an exact-range unlock.
    Cancelled,
}

/// Which lock populations a sysid query should consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockQuery {
    pub active: bool,
    pub sleeping: bool,
}

impl LockQuery {
    pub const ACTIVE: LockQuery = LockQuery { active: true, sleeping: false };
    pub const SLEEPING: LockQuery = LockQuery { active: false, sleeping: true };
    pub const BOTH: LockQuery = LockQuery { active: true, sleeping: true };
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Report the first lock that would conflict with `fl`, or None.
    async fn test(&self, vp: &Arc<Vnode>, fl: &Flock) -> Option<Flock>;

    /// Non-blocking lock attempt.
    async fn set(&self, vp: &Arc<Vnode>, fl: &Flock) -> SetLockResult;

    /// Blocking lock attempt. Parks until the lock is granted or the
    /// wait is cancelled by an identical-range [`Self::unlock`].
    async fn set_wait(&self, vp: &Arc<Vnode>, fl: &Flock) -> WaitLockResult;

    /// Remove this owner's locks overlapping the range, trimming
    /// partial overlaps, and cancel a parked waiter with the identical
    /// owner and range. Returns true if anything was cleared.
    async fn unlock(&self, vp: &Arc<Vnode>, fl: &Flock) -> bool;

    /// Drop every active lock and cancel every parked waiter this
    /// sysid owns on the file.
    async fn unlock_sysid(&self, vp: &Arc<Vnode>, sysid: u32);

    /// Whether the sysid owns any active or sleeping lock on the file.
    async fn vp_has_locks(&self, vp: &Arc<Vnode>, sysid: u32) -> bool;

    /// Whether the sysid owns any lock on any file.
    async fn sysid_has_locks(&self, sysid: u32, query: LockQuery) -> bool;
}

/// A parked blocking waiter. `cancelled` is flipped under the table
/// lock; the notify carries a stored permit, so a wake sent before the
/// waiter parks is never lost.
#[derive(Default)]
struct Sleeper {
    cancelled: AtomicBool,
    notify: Notify,
}

#[derive(Default)]
struct FileLocks {
    active: Vec<Flock>,
    sleepers: Vec<(Flock, Arc<Sleeper>)>,
}

impl FileLocks {
    fn remove_sleeper(&mut self, cell: &Arc<Sleeper>) {
        self.sleepers.retain(|(_, c)| !Arc::ptr_eq(c, cell));
    }

    fn wake_all_sleepers(&self) {
        for (_, cell) in &self.sleepers {
            cell.notify.notify_one();
        }
    }

    /// Install a granted lock, replacing this owner's overlapping
    /// portions first so re-locks and upgrades never stack.
    fn apply(&mut self, fl: &Flock) {
        remove_owned_range(&mut self.active, fl);
        self.active.push(fl.clone());
    }
}

/// Trim `fl`'s owner's locks out of `fl`'s range, splitting partial
/// overlaps. Returns true if any lock was touched.
fn remove_owned_range(active: &mut Vec<Flock>, fl: &Flock) -> bool {
    let mut touched = false;
    let mut kept = Vec::with_capacity(active.len());
    for held in active.drain(..) {
        if !held.same_owner(fl) || !held.overlaps(fl) {
            kept.push(held);
            continue;
        }
        touched = true;
        if held.start < fl.start {
            kept.push(Flock {
                len: fl.start - held.start,
                ..held.clone()
            });
        }
        match (fl.end(), held.end()) {
            (Some(cut), Some(held_end)) if held_end > cut => kept.push(Flock {
                start: cut,
                len: held_end - cut,
                ..held.clone()
            }),
            (Some(cut), None) => kept.push(Flock {
                start: cut,
                len: 0,
                ..held.clone()
            }),
            _ => {}
        }
    }
    *active = kept;
    touched
}

/// In-memory advisory lock table, one entry per file.
#[derive(Default)]
pub struct MemLockManager {
    files: Mutex<HashMap<u64, FileLocks>>,
}

impl MemLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active locks on a file, for assertions in tests.
    pub async fn active_locks(&self, vp: &Arc<Vnode>) -> Vec<Flock> {
        let files = self.files.lock().await;
        files
            .get(&vp.fileid)
            .map(|f| f.active.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LockManager for MemLockManager {
    async fn test(&self, vp: &Arc<Vnode>, fl: &Flock) -> Option<Flock> {
        let files = self.files.lock().await;
        let f = files.get(&vp.fileid)?;
        f.active.iter().find(|held| fl.conflicts_with(held)).cloned()
    }

    async fn set(&self, vp: &Arc<Vnode>, fl: &Flock) -> SetLockResult {
        let mut files = self.files.lock().await;
        let f = files.entry(vp.fileid).or_default();
        if f.active.iter().any(|held| fl.conflicts_with(held)) {
            return SetLockResult::Conflict;
        }
        f.apply(fl);
        SetLockResult::Granted
    }

    async fn set_wait(&self, vp: &Arc<Vnode>, fl: &Flock) -> WaitLockResult {
        let cell = Arc::new(Sleeper::default());
        loop {
            {
                let mut files = self.files.lock().await;
                let f = files.entry(vp.fileid).or_default();
                if cell.cancelled.load(Ordering::Acquire) {
                    f.remove_sleeper(&cell);
                    return WaitLockResult::Cancelled;
                }
                if !f.active.iter().any(|held| fl.conflicts_with(held)) {
                    f.remove_sleeper(&cell);
                    f.apply(fl);
                    return WaitLockResult::Granted;
                }
                if !f.sleepers.iter().any(|(_, c)| Arc::ptr_eq(c, &cell)) {
                    f.sleepers.push((fl.clone(), cell.clone()));
                }
            }
            cell.notify.notified().await;
        }
    }

    async fn unlock(&self, vp: &Arc<Vnode>, fl: &Flock) -> bool {
        let mut files = self.files.lock().await;
        let Some(f) = files.get_mut(&vp.fileid) else {
            return false;
        };
        let mut cancelled = false;
        for (sfl, cell) in &f.sleepers {
            // An already-cancelled waiter that has not unparked yet is
            // not cancellable a second time.
            if sfl.same_owner(fl) && sfl.same_range(fl) && !cell.cancelled.load(Ordering::Acquire)
            {
                cell.cancelled.store(true, Ordering::Release);
                cell.notify.notify_one();
                cancelled = true;
            }
        }
        let removed = remove_owned_range(&mut f.active, fl);
        if removed {
            f.wake_all_sleepers();
        }
        cancelled || removed
    }

    async fn unlock_sysid(&self, vp: &Arc<Vnode>, sysid: u32) {
        let mut files = self.files.lock().await;
        let Some(f) = files.get_mut(&vp.fileid) else {
            return;
        };
        for (sfl, cell) in &f.sleepers {
            if sfl.sysid == sysid {
                cell.cancelled.store(true, Ordering::Release);
                cell.notify.notify_one();
            }
        }
        let before = f.active.len();
        f.active.retain(|held| held.sysid != sysid);
        if f.active.len() != before {
            f.wake_all_sleepers();
        }
    }

    async fn vp_has_locks(&self, vp: &Arc<Vnode>, sysid: u32) -> bool {
        let files = self.files.lock().await;
        let Some(f) = files.get(&vp.fileid) else {
            return false;
        };
        f.active.iter().any(|held| held.sysid == sysid)
            || f.sleepers.iter().any(|(sfl, cell)| {
                sfl.sysid == sysid && !cell.cancelled.load(Ordering::Acquire)
            })
    }

    async fn sysid_has_locks(&self, sysid: u32, query: LockQuery) -> bool {
        let files = self.files.lock().await;
        files.values().any(|f| {
            (query.active && f.active.iter().any(|held| held.sysid == sysid))
                || (query.sleeping
                    && f.sleepers.iter().any(|(sfl, cell)| {
                        sfl.sysid == sysid && !cell.cancelled.load(Ordering::Acquire)
                    }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_vp(fileid: u64) -> Arc<Vnode> {
        Arc::new(Vnode { fileid, read_only: false })
    }

    fn make_fl(sysid: u32, pid: u32, start: u64, len: u64, kind: FlockKind) -> Flock {
        Flock { sysid, pid, start, len, kind }
    }

    #[tokio::test]
    async fn test_exclusive_conflict() {
        let lm = MemLockManager::new();
        let vp = make_vp(1);
        let a = make_fl(1, 10, 0, 10, FlockKind::Write);
        let b = make_fl(2, 20, 5, 10, FlockKind::Write);

        assert_eq!(lm.set(&vp, &a).await, SetLockResult::Granted);
        assert_eq!(lm.set(&vp, &b).await, SetLockResult::Conflict);
        assert_eq!(lm.test(&vp, &b).await, Some(a.clone()));

        // Shared locks from distinct owners coexist
        let c = make_fl(3, 30, 100, 10, FlockKind::Read);
        let d = make_fl(4, 40, 100, 10, FlockKind::Read);
        assert_eq!(lm.set(&vp, &c).await, SetLockResult::Granted);
        assert_eq!(lm.set(&vp, &d).await, SetLockResult::Granted);
    }

    #[tokio::test]
    async fn test_to_eof_ranges_overlap() {
        let lm = MemLockManager::new();
        let vp = make_vp(1);
        let eof = make_fl(1, 10, 50, 0, FlockKind::Write);
        assert_eq!(lm.set(&vp, &eof).await, SetLockResult::Granted);

        let high = make_fl(2, 20, 1_000_000, 1, FlockKind::Read);
        assert_eq!(lm.set(&vp, &high).await, SetLockResult::Conflict);
        let low = make_fl(2, 20, 0, 50, FlockKind::Write);
        assert_eq!(lm.set(&vp, &low).await, SetLockResult::Granted);
    }

    #[tokio::test]
    async fn test_unlock_trims_partial_overlap() {
        let lm = MemLockManager::new();
        let vp = make_vp(1);
        lm.set(&vp, &make_fl(1, 10, 0, 30, FlockKind::Write)).await;

        assert!(lm.unlock(&vp, &make_fl(1, 10, 10, 10, FlockKind::Write)).await);

        let active = lm.active_locks(&vp).await;
        assert_eq!(active.len(), 2);
        assert!(active.iter().any(|l| l.start == 0 && l.len == 10));
        assert!(active.iter().any(|l| l.start == 20 && l.len == 10));

        // Unlocking a range we do not hold clears nothing
        assert!(!lm.unlock(&vp, &make_fl(1, 10, 500, 5, FlockKind::Write)).await);
    }

    #[tokio::test]
    async fn test_blocking_wait_granted_on_unlock() {
        let lm = Arc::new(MemLockManager::new());
        let vp = make_vp(1);
        let held = make_fl(1, 10, 0, 10, FlockKind::Write);
        lm.set(&vp, &held).await;

        let waiter_fl = make_fl(2, 20, 0, 10, FlockKind::Write);
        let lm2 = lm.clone();
        let vp2 = vp.clone();
        let wfl = waiter_fl.clone();
        let waiter = tokio::spawn(async move { lm2.set_wait(&vp2, &wfl).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lm.sysid_has_locks(2, LockQuery::SLEEPING).await);

        lm.unlock(&vp, &held).await;
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, WaitLockResult::Granted);
        assert!(lm.sysid_has_locks(2, LockQuery::ACTIVE).await);
    }

    #[tokio::test]
    async fn test_exact_unlock_cancels_waiter() {
        let lm = Arc::new(MemLockManager::new());
        let vp = make_vp(1);
        lm.set(&vp, &make_fl(1, 10, 0, 10, FlockKind::Write)).await;

        let waiter_fl = make_fl(2, 20, 0, 10, FlockKind::Write);
        let lm2 = lm.clone();
        let vp2 = vp.clone();
        let wfl = waiter_fl.clone();
        let waiter = tokio::spawn(async move { lm2.set_wait(&vp2, &wfl).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lm.unlock(&vp, &waiter_fl).await);

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, WaitLockResult::Cancelled);
        assert!(!lm.sysid_has_locks(2, LockQuery::BOTH).await);
    }

    #[tokio::test]
    async fn test_unlock_sysid_drops_and_cancels() {
        let lm = Arc::new(MemLockManager::new());
        let vp = make_vp(1);
        lm.set(&vp, &make_fl(7, 1, 0, 10, FlockKind::Write)).await;
        lm.set(&vp, &make_fl(7, 2, 50, 10, FlockKind::Read)).await;
        lm.set(&vp, &make_fl(8, 1, 100, 10, FlockKind::Write)).await;

        let lm2 = lm.clone();
        let vp2 = vp.clone();
        let waiter = tokio::spawn(async move {
            lm2.set_wait(&vp2, &make_fl(7, 3, 100, 10, FlockKind::Write)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        lm.unlock_sysid(&vp, 7).await;
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, WaitLockResult::Cancelled);

        assert!(!lm.vp_has_locks(&vp, 7).await);
        assert!(lm.vp_has_locks(&vp, 8).await);
    }
}
