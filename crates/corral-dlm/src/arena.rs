//! Slab storage for lock objects, doubling as the handle table.
//!
//! The arena owns every [`Lock`] in a namespace and hands out [`LockId`]
//! slot indices. Freed slots are recycled via a free list. A slot index
//! plus the lock's random cookie forms the exportable handle; lookup
//! validates the cookie so a handle to a freed-and-reused slot resolves to
//! `None` rather than to an unrelated lock.

use corral_types::LockHandle;

use crate::lock::{Lock, LockId};

/// Fixed-capacity slab of lock slots with free-list reuse.
pub(crate) struct LockArena {
    slots: Vec<Option<Lock>>,
    free_list: Vec<u32>,
    live: usize,
    max_locks: usize,
}

impl LockArena {
    pub(crate) fn new(max_locks: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            max_locks,
        }
    }

    /// Number of live locks.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    /// Allocate a slot for `lock`. Returns `None` at capacity.
    pub(crate) fn alloc(&mut self, lock: Lock) -> Option<LockId> {
        if self.live >= self.max_locks {
            return None;
        }
        self.live += 1;

        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(lock);
            return Some(LockId(idx));
        }

        let idx = u32::try_from(self.slots.len()).expect("LockArena slot index overflow u32");
        self.slots.push(Some(lock));
        Some(LockId(idx))
    }

    /// Free the slot at `id`, making it available for reuse.
    ///
    /// # Panics
    ///
    /// Asserts that the slot is currently occupied (catches double-free).
    pub(crate) fn free(&mut self, id: LockId) {
        let slot = &mut self.slots[id.index()];
        assert!(slot.is_some(), "LockArena::free: double-free of {id}");
        *slot = None;
        self.free_list.push(id.0);
        self.live -= 1;
    }

    #[must_use]
    pub(crate) fn get(&self, id: LockId) -> &Lock {
        self.slots[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("LockArena::get: dangling lock id {id}"))
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, id: LockId) -> &mut Lock {
        self.slots[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("LockArena::get_mut: dangling lock id {id}"))
    }

    /// Resolve a handle to a live (not destroyed) lock.
    #[must_use]
    pub(crate) fn lookup(&self, handle: LockHandle) -> Option<LockId> {
        let id = self.lookup_any(handle)?;
        if self.get(id).destroyed() {
            return None;
        }
        Some(id)
    }

    /// Resolve a handle, accepting destroyed-but-not-yet-freed locks.
    ///
    /// Needed by reference-dropping operations (`release`, `decref_use`):
    /// a caller must be able to drop its last references after the lock was
    /// destroyed, or the slot would never free.
    #[must_use]
    pub(crate) fn lookup_any(&self, handle: LockHandle) -> Option<LockId> {
        let idx = usize::try_from(handle.id).ok()?;
        let lock = self.slots.get(idx)?.as_ref()?;
        if lock.cookie != handle.cookie {
            return None;
        }
        Some(LockId(u32::try_from(idx).ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_types::{LockFlags, LockMode};

    use crate::resource::ResourceId;

    fn make(cookie: u64) -> Lock {
        Lock::new(cookie, ResourceId(0), LockMode::EX, None, None)
    }

    // -----------------------------------------------------------------------
    // test_alloc_free_reuse
    // -----------------------------------------------------------------------

    #[test]
    fn test_alloc_free_reuse() {
        let mut arena = LockArena::new(16);
        let a = arena.alloc(make(1)).expect("alloc a");
        let b = arena.alloc(make(2)).expect("alloc b");
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);

        arena.free(a);
        assert_eq!(arena.len(), 1);

        // Freed slot is recycled.
        let c = arena.alloc(make(3)).expect("alloc c");
        assert_eq!(c, a, "free list should recycle slot");
        assert_eq!(arena.get(c).cookie, 3);
    }

    // -----------------------------------------------------------------------
    // test_capacity_limit
    // -----------------------------------------------------------------------

    #[test]
    fn test_capacity_limit() {
        let mut arena = LockArena::new(2);
        arena.alloc(make(1)).expect("first");
        arena.alloc(make(2)).expect("second");
        assert!(arena.alloc(make(3)).is_none(), "third exceeds max_locks");
    }

    // -----------------------------------------------------------------------
    // test_double_free_panics
    // -----------------------------------------------------------------------

    #[test]
    #[should_panic(expected = "double-free")]
    fn test_double_free_panics() {
        let mut arena = LockArena::new(4);
        let id = arena.alloc(make(1)).expect("alloc");
        arena.free(id);
        arena.free(id);
    }

    // -----------------------------------------------------------------------
    // test_lookup_validates_cookie
    // -----------------------------------------------------------------------

    #[test]
    fn test_lookup_validates_cookie() {
        let mut arena = LockArena::new(4);
        let id = arena.alloc(make(0x1111)).expect("alloc");
        let good = arena.get(id).handle(id);

        assert_eq!(arena.lookup(good), Some(id));

        let forged = LockHandle {
            id: good.id,
            cookie: 0x2222,
        };
        assert_eq!(arena.lookup(forged), None, "cookie mismatch must fail");

        let out_of_range = LockHandle {
            id: 999,
            cookie: 0x1111,
        };
        assert_eq!(arena.lookup(out_of_range), None);
    }

    // -----------------------------------------------------------------------
    // test_lookup_destroyed_lock
    // -----------------------------------------------------------------------

    #[test]
    fn test_lookup_destroyed_lock() {
        let mut arena = LockArena::new(4);
        let id = arena.alloc(make(0x42)).expect("alloc");
        let handle = arena.get(id).handle(id);

        arena.get_mut(id).flags.insert(LockFlags::DESTROYED);
        assert_eq!(arena.lookup(handle), None, "destroyed locks do not resolve");
        assert_eq!(
            arena.lookup_any(handle),
            Some(id),
            "reference-dropping lookups still reach the slot"
        );
    }
}
