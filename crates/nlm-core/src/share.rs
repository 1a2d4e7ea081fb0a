//! DOS-style share reservation interface.
//!
//! Share reservations gate whole-file open modes rather than byte
//! ranges: a reservation pairs the access the opener wants with the
//! access it denies to everyone else. The engine records and removes
//! reservations on behalf of remote peers through this trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use nlm_proto::types::{ShareAccess, ShareMode};

use crate::fs::Vnode;

/// A share reservation in local form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shr {
    pub sysid: u32,
    /// Opaque owner bytes from the peer; reservations from the same
    /// owner never conflict with each other.
    pub owner: Vec<u8>,
    pub access: ShareAccess,
    pub deny: ShareMode,
}

impl Shr {
    fn same_owner(&self, other: &Shr) -> bool {
        self.sysid == other.sysid && self.owner == other.owner
    }

    /// DOS sharing rule: a request is refused when an existing
    /// reservation denies the access it wants, or it denies the access
    /// an existing reservation holds.
    fn conflicts_with(&self, other: &Shr) -> bool {
        !self.same_owner(other)
            && ((self.access.bits() & other.deny.bits()) != 0
                || (self.deny.bits() & other.access.bits()) != 0)
    }
}

#[async_trait]
pub trait ShareManager: Send + Sync {
    /// Record a reservation. Returns false when an existing
    /// reservation conflicts.
    async fn set(&self, vp: &Arc<Vnode>, shr: &Shr) -> bool;

    /// Remove a matching reservation.
    async fn unset(&self, vp: &Arc<Vnode>, shr: &Shr);

    /// Remove every reservation the sysid holds on the file.
    async fn unset_sysid(&self, vp: &Arc<Vnode>, sysid: u32);

    /// Whether the sysid holds any reservation on the file.
    async fn vp_has_shares(&self, vp: &Arc<Vnode>, sysid: u32) -> bool;
}

/// In-memory share reservation table, one entry list per file.
#[derive(Default)]
pub struct MemShareManager {
    files: Mutex<HashMap<u64, Vec<Shr>>>,
}

impl MemShareManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShareManager for MemShareManager {
    async fn set(&self, vp: &Arc<Vnode>, shr: &Shr) -> bool {
        let mut files = self.files.lock().await;
        let shares = files.entry(vp.fileid).or_default();
        if shares.iter().any(|held| shr.conflicts_with(held)) {
            return false;
        }
        shares.push(shr.clone());
        true
    }

    async fn unset(&self, vp: &Arc<Vnode>, shr: &Shr) {
        let mut files = self.files.lock().await;
        if let Some(shares) = files.get_mut(&vp.fileid) {
            if let Some(pos) = shares.iter().position(|held| held == shr) {
                shares.remove(pos);
            }
        }
    }

    async fn unset_sysid(&self, vp: &Arc<Vnode>, sysid: u32) {
        let mut files = self.files.lock().await;
        if let Some(shares) = files.get_mut(&vp.fileid) {
            shares.retain(|held| held.sysid != sysid);
        }
    }

    async fn vp_has_shares(&self, vp: &Arc<Vnode>, sysid: u32) -> bool {
        let files = self.files.lock().await;
        files
            .get(&vp.fileid)
            .map(|shares| shares.iter().any(|held| held.sysid == sysid))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_vp(fileid: u64) -> Arc<Vnode> {
        Arc::new(Vnode { fileid, read_only: false })
    }

    fn make_shr(sysid: u32, owner: u8, access: ShareAccess, deny: ShareMode) -> Shr {
        Shr { sysid, owner: vec![owner], access, deny }
    }

    #[tokio::test]
    async fn test_deny_write_blocks_writer() {
        let sm = MemShareManager::new();
        let vp = make_vp(1);

        assert!(sm.set(&vp, &make_shr(1, 1, ShareAccess::Read, ShareMode::DenyWrite)).await);
        assert!(!sm.set(&vp, &make_shr(2, 2, ShareAccess::Write, ShareMode::DenyNone)).await);
        assert!(sm.set(&vp, &make_shr(2, 2, ShareAccess::Read, ShareMode::DenyNone)).await);
    }

    #[tokio::test]
    async fn test_same_owner_never_conflicts() {
        let sm = MemShareManager::new();
        let vp = make_vp(1);

        let first = make_shr(1, 1, ShareAccess::ReadWrite, ShareMode::DenyReadWrite);
        assert!(sm.set(&vp, &first).await);
        assert!(sm.set(&vp, &make_shr(1, 1, ShareAccess::Write, ShareMode::DenyNone)).await);

        sm.unset(&vp, &first).await;
        assert!(sm.vp_has_shares(&vp, 1).await);
        sm.unset_sysid(&vp, 1).await;
        assert!(!sm.vp_has_shares(&vp, 1).await);
    }
}
