//! File-handle resolution.
//!
//! The lock manager receives opaque NFS file handles from peers and
//! needs the file they name. Resolution is the exporting file system's
//! business; the engine only sees this trait. A resolved [`Vnode`] is
//! handed out as `Arc<Vnode>`, and holding the `Arc` is what keeps the
//! file pinned.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use nlm_proto::Fh;

/// A local file as the lock manager sees it.
#[derive(Debug, PartialEq, Eq)]
pub struct Vnode {
    /// Stable file identity, unique within the exporting file system.
    pub fileid: u64,
    /// Files on read-only file systems refuse locks and shares.
    pub read_only: bool,
}

#[async_trait]
pub trait FhResolver: Send + Sync {
    /// Translate file-handle bytes to the file they name, or None if
    /// the handle is stale or malformed.
    async fn fh_to_vp(&self, fh: &Fh) -> Option<Arc<Vnode>>;
}

/// In-process resolver over a registered handle table, used for
/// development and tests.
#[derive(Default)]
pub struct MemFs {
    table: Mutex<HashMap<Fh, Arc<Vnode>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file handle. Returns the vnode backing it.
    pub async fn register(&self, fh: Fh, fileid: u64, read_only: bool) -> Arc<Vnode> {
        let vp = Arc::new(Vnode { fileid, read_only });
        self.table.lock().await.insert(fh, vp.clone());
        vp
    }

    /// Drop a file handle, simulating the file going away.
    pub async fn unregister(&self, fh: &Fh) {
        self.table.lock().await.remove(fh);
    }
}

#[async_trait]
impl FhResolver for MemFs {
    async fn fh_to_vp(&self, fh: &Fh) -> Option<Arc<Vnode>> {
        self.table.lock().await.get(fh).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memfs_resolution() {
        let fs = MemFs::new();
        let fh = Fh(vec![1, 2, 3, 4]);
        let vp = fs.register(fh.clone(), 77, false).await;

        let resolved = fs.fh_to_vp(&fh).await.unwrap();
        assert!(Arc::ptr_eq(&vp, &resolved));
        assert_eq!(resolved.fileid, 77);

        assert!(fs.fh_to_vp(&Fh(vec![9, 9])).await.is_none());

        fs.unregister(&fh).await;
        assert!(fs.fh_to_vp(&fh).await.is_none());
    }
}
