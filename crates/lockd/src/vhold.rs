//! Per-host held-file tracking.
//!
//! A vhold pins a local file on behalf of one host for as long as the
//! file is relevant to that host: an operation is in flight on it, a
//! server-side sleep request is parked on it, or the host's sysid
//! still owns a lock or share on it. Destroying a vhold drops the
//! `Arc<Vnode>` and with it the pin.
//!
//! Server-side sleep requests live on the vhold they target. They
//! record a blocking lock attempt parked inside the local lock
//! manager, so a CANCEL (or a crash fan-out) can find and clear it.

use std::collections::HashMap;
use std::sync::Arc;

use nlm_core::flock::{Flock, FlockKind, LockManager};
use nlm_core::fs::Vnode;
use nlm_core::share::ShareManager;

use crate::daemon::Globals;
use crate::host::Host;

/// A blocking lock attempt parked in the local lock manager. Identity
/// is all four fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SleepReq {
    pub start: u64,
    pub len: u64,
    pub pid: u32,
    pub kind: FlockKind,
}

impl SleepReq {
    fn from_flock(fl: &Flock) -> Self {
        Self {
            start: fl.start,
            len: fl.len,
            pid: fl.pid,
            kind: fl.kind,
        }
    }
}

/// Handle to a vhold within its host's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VholdId(u64);

pub(crate) struct Vhold {
    pub vp: Arc<Vnode>,
    /// Operations currently in flight on this file for this host.
    pub refcnt: u32,
    pub slreqs: Vec<SleepReq>,
}

/// The held-file table of one host, guarded by the host mutex. Entries
/// are keyed by vnode pointer identity and kept in insertion order.
#[derive(Default)]
pub(crate) struct VholdTable {
    entries: HashMap<u64, Vhold>,
    order: Vec<u64>,
    by_vp: HashMap<usize, u64>,
    next_id: u64,
}

impl VholdTable {
    /// Find the entry for a vnode, or pin it and create one.
    pub fn get_or_create(&mut self, vp: &Arc<Vnode>) -> VholdId {
        let key = Arc::as_ptr(vp) as usize;
        if let Some(&id) = self.by_vp.get(&key) {
            let v = self.entries.get_mut(&id).expect("vhold index out of sync");
            v.refcnt += 1;
            return VholdId(id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Vhold {
                vp: vp.clone(),
                refcnt: 1,
                slreqs: Vec::new(),
            },
        );
        self.order.push(id);
        self.by_vp.insert(key, id);
        VholdId(id)
    }

    pub fn get(&self, id: VholdId) -> &Vhold {
        self.entries.get(&id.0).expect("stale vhold id")
    }

    pub fn get_mut(&mut self, id: VholdId) -> &mut Vhold {
        self.entries.get_mut(&id.0).expect("stale vhold id")
    }

    fn remove(&mut self, id: u64) -> Vhold {
        let v = self.entries.remove(&id).expect("stale vhold id");
        self.order.retain(|&o| o != id);
        self.by_vp.remove(&(Arc::as_ptr(&v.vp) as usize));
        v
    }

    pub fn ids(&self) -> Vec<VholdId> {
        self.order.iter().map(|&id| VholdId(id)).collect()
    }

    /// Vnodes of every entry, in insertion order.
    pub fn vnodes(&self) -> Vec<Arc<Vnode>> {
        self.order
            .iter()
            .map(|id| self.entries[id].vp.clone())
            .collect()
    }

    /// Detach every pending sleep request, returning them so the
    /// caller can drop them outside the critical section.
    pub fn take_slreqs(&mut self) -> Vec<SleepReq> {
        let mut all = Vec::new();
        for v in self.entries.values_mut() {
            all.append(&mut v.slreqs);
        }
        all
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Globals {
    /// Resolve a vnode to its vhold in the host's table, creating and
    /// pinning on first sight. Pair with [`Globals::vhold_release`].
    pub(crate) async fn vhold_get(&self, host: &Arc<Host>, vp: &Arc<Vnode>) -> VholdId {
        let mut inner = host.inner.lock().await;
        inner.vholds.get_or_create(vp)
    }

    /// Take an additional operation reference on an existing vhold.
    pub(crate) async fn vhold_ref(&self, host: &Arc<Host>, id: VholdId) {
        let mut inner = host.inner.lock().await;
        inner.vholds.get_mut(id).refcnt += 1;
    }

    /// Drop an operation reference. The entry stays until the GC finds
    /// it non-busy; keeping it pinned covers locks the peer still owns.
    pub(crate) async fn vhold_release(&self, host: &Arc<Host>, id: VholdId) {
        let mut inner = host.inner.lock().await;
        let v = inner.vholds.get_mut(id);
        assert!(v.refcnt > 0, "vhold released with zero refcnt");
        v.refcnt -= 1;
    }

    /// Park a sleep request on the vhold. Returns false when an
    /// identical request is already parked, which means another worker
    /// owns that wait (a retransmitted LOCK).
    pub(crate) async fn slreq_register(
        &self,
        host: &Arc<Host>,
        id: VholdId,
        fl: &Flock,
    ) -> bool {
        let mut inner = host.inner.lock().await;
        let v = inner.vholds.get_mut(id);
        let req = SleepReq::from_flock(fl);
        if v.slreqs.contains(&req) {
            return false;
        }
        v.slreqs.push(req);
        true
    }

    /// Remove a parked sleep request. Returns false when no matching
    /// request exists (already cleared by a crash fan-out or a racing
    /// CANCEL).
    pub(crate) async fn slreq_unregister(
        &self,
        host: &Arc<Host>,
        id: VholdId,
        fl: &Flock,
    ) -> bool {
        let mut inner = host.inner.lock().await;
        let v = inner.vholds.get_mut(id);
        let req = SleepReq::from_flock(fl);
        match v.slreqs.iter().position(|r| *r == req) {
            Some(pos) => {
                v.slreqs.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Destroy every vhold with no remaining reason to exist.
    pub(crate) async fn vhold_gc(&self, host: &Arc<Host>) {
        let mut inner = host.inner.lock().await;
        self.vhold_gc_locked(host.sysid, &mut inner.vholds).await;
    }

    /// GC body, for callers already holding the host mutex.
    pub(crate) async fn vhold_gc_locked(&self, sysid: u32, vholds: &mut VholdTable) {
        for id in vholds.ids() {
            let busy = {
                let v = vholds.get(id);
                v.refcnt > 0
                    || !v.slreqs.is_empty()
                    || self.lockmgr.vp_has_locks(&v.vp, sysid).await
                    || self.sharemgr.vp_has_shares(&v.vp, sysid).await
            };
            if !busy {
                vholds.remove(id.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_vp(fileid: u64) -> Arc<Vnode> {
        Arc::new(Vnode { fileid, read_only: false })
    }

    #[test]
    fn test_get_or_create_dedups_by_pointer() {
        let mut table = VholdTable::default();
        let vp = make_vp(1);
        let other = make_vp(2);

        let a = table.get_or_create(&vp);
        let b = table.get_or_create(&vp);
        let c = table.get_or_create(&other);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a).refcnt, 2);
        assert_eq!(table.get(c).refcnt, 1);
    }

    #[test]
    fn test_take_slreqs_empties_every_entry() {
        let mut table = VholdTable::default();
        let a = table.get_or_create(&make_vp(1));
        let b = table.get_or_create(&make_vp(2));
        table.get_mut(a).slreqs.push(SleepReq {
            start: 0,
            len: 10,
            pid: 1,
            kind: FlockKind::Write,
        });
        table.get_mut(b).slreqs.push(SleepReq {
            start: 5,
            len: 0,
            pid: 2,
            kind: FlockKind::Read,
        });

        let taken = table.take_slreqs();
        assert_eq!(taken.len(), 2);
        assert!(table.get(a).slreqs.is_empty());
        assert!(table.get(b).slreqs.is_empty());
    }

    #[test]
    fn test_vnodes_in_insertion_order() {
        let mut table = VholdTable::default();
        let first = make_vp(10);
        let second = make_vp(20);
        table.get_or_create(&first);
        table.get_or_create(&second);

        let vps = table.vnodes();
        assert!(Arc::ptr_eq(&vps[0], &first));
        assert!(Arc::ptr_eq(&vps[1], &second));
    }
}
