//! Sysid allocation.
//!
//! Every remote peer is tagged with a sysid so the local lock manager
//! can attribute locks and shares to it. Ids live in
//! `[SYSID_MIN, SYSID_MAX]`; id 0 belongs to local processes and bit 0
//! of the pool is permanently set so it can never be handed out. A
//! rotating cursor spreads allocations so a just-freed id is not
//! immediately reused for a different peer.

use bitvec::prelude::*;

use nlm_proto::constants::{SYSID_MAX, SYSID_MIN};

/// Process-wide sysid pool, guarded by the registry writer lock.
pub(crate) struct SysidPool {
    inuse: BitVec<u8, Msb0>,
    cursor: u32,
}

impl SysidPool {
    pub fn new() -> Self {
        let mut inuse = bitvec![u8, Msb0; 0; (SYSID_MAX + 1) as usize];
        inuse.set(0, true);
        Self {
            inuse,
            cursor: SYSID_MIN,
        }
    }

    /// Allocate the first free id at or after the cursor, wrapping
    /// once. None when every id is taken.
    pub fn alloc(&mut self) -> Option<u32> {
        let span = SYSID_MAX - SYSID_MIN + 1;
        for step in 0..span {
            let id = SYSID_MIN + (self.cursor - SYSID_MIN + step) % span;
            if !self.inuse[id as usize] {
                self.inuse.set(id as usize, true);
                self.cursor = SYSID_MIN + (id - SYSID_MIN + 1) % span;
                return Some(id);
            }
        }
        None
    }

    /// Return an id to the pool. Freeing an unallocated id is a bug.
    pub fn free(&mut self, id: u32) {
        assert!(
            id >= SYSID_MIN && id <= SYSID_MAX,
            "sysid {id} out of range"
        );
        assert!(self.inuse[id as usize], "double free of sysid {id}");
        self.inuse.set(id as usize, false);
    }

    #[cfg(test)]
    pub fn allocated(&self) -> usize {
        self.inuse.count_ones() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_allocates_zero() {
        let mut pool = SysidPool::new();
        for _ in 0..1000 {
            let id = pool.alloc().unwrap();
            assert_ne!(id, 0);
            assert!(id >= SYSID_MIN && id <= SYSID_MAX);
        }
    }

    #[test]
    fn test_alloc_unique_until_exhausted() {
        let mut pool = SysidPool::new();
        let mut seen = std::collections::HashSet::new();
        for _ in SYSID_MIN..=SYSID_MAX {
            let id = pool.alloc().unwrap();
            assert!(seen.insert(id), "sysid {id} handed out twice");
        }
        assert_eq!(pool.alloc(), None);
    }

    #[test]
    fn test_free_makes_id_reusable() {
        let mut pool = SysidPool::new();
        for _ in SYSID_MIN..=SYSID_MAX {
            pool.alloc().unwrap();
        }
        pool.free(42);
        assert_eq!(pool.alloc(), Some(42));
        assert_eq!(pool.alloc(), None);
    }

    #[test]
    fn test_cursor_rotates() {
        let mut pool = SysidPool::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        // Freeing `a` does not make it the very next allocation; the
        // cursor keeps moving forward.
        pool.free(a);
        let c = pool.alloc().unwrap();
        assert_ne!(c, a);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut pool = SysidPool::new();
        let id = pool.alloc().unwrap();
        pool.free(id);
        pool.free(id);
    }
}
