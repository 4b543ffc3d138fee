//! Lockable resources and the namespace resource table.
//!
//! A [`Resource`] owns the three ordered lock queues (granted, converting,
//! waiting) plus the cached most-restrictive granted mode. Resources are
//! use-counted separately from any lock's refcount: every live lock
//! reference pins its resource, so a resource outlives a lock that is in
//! the middle of being retargeted onto it.

use std::collections::HashMap;
use std::fmt;

use corral_types::{LockMode, ResourceKey};

use crate::lock::{LockId, QueueKind};

/// Index of a resource slot in the namespace table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ResourceId(pub(crate) u32);

impl ResourceId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r#{}", self.0)
    }
}

/// One lockable entity and its queues.
pub(crate) struct Resource {
    pub(crate) key: ResourceKey,
    pub(crate) granted: Vec<LockId>,
    pub(crate) converting: Vec<LockId>,
    pub(crate) waiting: Vec<LockId>,
    /// Most restrictive mode ever granted on this resource. Tighten-only:
    /// grants raise it, releases do not lower it.
    pub(crate) most_restrictive: LockMode,
    /// Live references from locks and in-flight lookups.
    pub(crate) use_count: u32,
    /// Owning resource of the parent lock, when created under one.
    pub(crate) parent: Option<ResourceId>,
}

impl Resource {
    fn new(key: ResourceKey, parent: Option<ResourceId>) -> Self {
        Self {
            key,
            granted: Vec::new(),
            converting: Vec::new(),
            waiting: Vec::new(),
            most_restrictive: LockMode::NL,
            use_count: 0,
            parent,
        }
    }

    fn queue_mut(&mut self, queue: QueueKind) -> &mut Vec<LockId> {
        match queue {
            QueueKind::Granted => &mut self.granted,
            QueueKind::Converting => &mut self.converting,
            QueueKind::Waiting => &mut self.waiting,
            QueueKind::Unqueued | QueueKind::Destroyed => {
                panic!("Resource: {queue:?} is not a queue")
            }
        }
    }

    /// Append `lock` to the tail of `queue` (FIFO order).
    pub(crate) fn push(&mut self, queue: QueueKind, lock: LockId) {
        self.queue_mut(queue).push(lock);
    }

    /// Remove `lock` from `queue`.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not on that queue: queue-membership state and
    /// queue contents disagreeing means the namespace is corrupt.
    pub(crate) fn remove(&mut self, queue: QueueKind, lock: LockId) {
        let list = self.queue_mut(queue);
        let pos = list
            .iter()
            .position(|&id| id == lock)
            .unwrap_or_else(|| panic!("Resource: {lock} not on {queue:?} queue"));
        list.remove(pos);
    }

    /// Whether all three queues are empty.
    #[must_use]
    pub(crate) fn queues_empty(&self) -> bool {
        self.granted.is_empty() && self.converting.is_empty() && self.waiting.is_empty()
    }
}

/// Slab + key map of all resources in one namespace.
pub(crate) struct ResourceTable {
    slots: Vec<Option<Resource>>,
    free_list: Vec<u32>,
    by_key: HashMap<ResourceKey, ResourceId>,
    live: usize,
    max_resources: usize,
}

impl ResourceTable {
    pub(crate) fn new(max_resources: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            by_key: HashMap::new(),
            live: 0,
            max_resources,
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub(crate) fn get(&self, id: ResourceId) -> &Resource {
        self.slots[id.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("ResourceTable::get: dangling resource id {id}"))
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, id: ResourceId) -> &mut Resource {
        self.slots[id.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("ResourceTable::get_mut: dangling resource id {id}"))
    }

    /// Whether `id` names a live resource slot.
    #[must_use]
    pub(crate) fn contains(&self, id: ResourceId) -> bool {
        self.slots
            .get(id.index())
            .is_some_and(|slot| slot.is_some())
    }

    /// Look up `key` without touching use counts (diagnostics only).
    #[must_use]
    pub(crate) fn find(&self, key: &ResourceKey) -> Option<ResourceId> {
        self.by_key.get(key).copied()
    }

    /// Look up `key`, optionally creating an empty resource on miss.
    ///
    /// On success the returned resource's use count has been incremented;
    /// the caller owns that reference and must `put` it (or hand it to a
    /// lock, whose every refcount pins the resource). Returns `None` on
    /// miss without `create`, or when creation would exceed capacity.
    ///
    /// `created` reports whether this call made the entry, so the caller
    /// can emit the creation event exactly once.
    pub(crate) fn get_or_create(
        &mut self,
        key: ResourceKey,
        parent: Option<ResourceId>,
        create: bool,
    ) -> Option<(ResourceId, bool)> {
        if let Some(&id) = self.by_key.get(&key) {
            self.get_mut(id).use_count += 1;
            return Some((id, false));
        }
        if !create || self.live >= self.max_resources {
            return None;
        }

        self.live += 1;
        let mut resource = Resource::new(key, parent);
        resource.use_count = 1;

        let id = if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(resource);
            ResourceId(idx)
        } else {
            let idx =
                u32::try_from(self.slots.len()).expect("ResourceTable slot index overflow u32");
            self.slots.push(Some(resource));
            ResourceId(idx)
        };
        self.by_key.insert(key, id);
        Some((id, true))
    }

    /// Take an additional reference on an existing resource.
    pub(crate) fn getref(&mut self, id: ResourceId) {
        self.get_mut(id).use_count += 1;
    }

    /// Drop one reference; removes the entry once unused.
    ///
    /// Returns `true` when this put freed the resource.
    ///
    /// # Panics
    ///
    /// Panics on use-count underflow, and if the last reference drops while
    /// locks are still queued (those locks would become unreachable).
    pub(crate) fn put(&mut self, id: ResourceId) -> bool {
        let resource = self.get_mut(id);
        assert!(
            resource.use_count > 0,
            "ResourceTable::put: use-count underflow on {id}"
        );
        resource.use_count -= 1;
        if resource.use_count > 0 {
            return false;
        }
        assert!(
            resource.queues_empty(),
            "ResourceTable::put: freeing resource {} with queued locks",
            resource.key
        );

        let key = resource.key;
        self.by_key.remove(&key);
        self.slots[id.index()] = None;
        self.free_list.push(id.0);
        self.live -= 1;
        true
    }

    /// Iterate over occupied slots.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (ResourceId, &Resource)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|res| (ResourceId(idx as u32), res)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_types::ResourceType;

    fn key(n: u64) -> ResourceKey {
        ResourceKey::new([n, 0, 0], ResourceType::Plain)
    }

    // -----------------------------------------------------------------------
    // test_get_or_create_use_counts
    // -----------------------------------------------------------------------

    #[test]
    fn test_get_or_create_use_counts() {
        let mut table = ResourceTable::new(8);

        assert!(
            table.get_or_create(key(1), None, false).is_none(),
            "miss without create yields None"
        );

        let (id, created) = table.get_or_create(key(1), None, true).expect("create");
        assert!(created);
        assert_eq!(table.get(id).use_count, 1);

        let (again, created) = table.get_or_create(key(1), None, true).expect("hit");
        assert_eq!(again, id);
        assert!(!created, "second lookup reuses the entry");
        assert_eq!(table.get(id).use_count, 2);

        assert!(!table.put(id));
        assert!(table.put(id), "last put frees the entry");
        assert_eq!(table.len(), 0);
        assert!(table.get_or_create(key(1), None, false).is_none());
    }

    // -----------------------------------------------------------------------
    // test_capacity_limit
    // -----------------------------------------------------------------------

    #[test]
    fn test_capacity_limit() {
        let mut table = ResourceTable::new(1);
        table.get_or_create(key(1), None, true).expect("first");
        assert!(
            table.get_or_create(key(2), None, true).is_none(),
            "second resource exceeds max_resources"
        );
    }

    // -----------------------------------------------------------------------
    // test_queue_push_remove
    // -----------------------------------------------------------------------

    #[test]
    fn test_queue_push_remove() {
        let mut table = ResourceTable::new(8);
        let (id, _) = table.get_or_create(key(1), None, true).expect("create");

        let res = table.get_mut(id);
        res.push(QueueKind::Waiting, LockId(3));
        res.push(QueueKind::Waiting, LockId(4));
        assert_eq!(res.waiting, vec![LockId(3), LockId(4)]);

        res.remove(QueueKind::Waiting, LockId(3));
        assert_eq!(res.waiting, vec![LockId(4)]);
        assert!(!res.queues_empty());
    }

    // -----------------------------------------------------------------------
    // test_remove_missing_panics
    // -----------------------------------------------------------------------

    #[test]
    #[should_panic(expected = "not on Granted queue")]
    fn test_remove_missing_panics() {
        let mut table = ResourceTable::new(8);
        let (id, _) = table.get_or_create(key(1), None, true).expect("create");
        table.get_mut(id).remove(QueueKind::Granted, LockId(9));
    }

    // -----------------------------------------------------------------------
    // test_put_with_queued_locks_panics
    // -----------------------------------------------------------------------

    #[test]
    #[should_panic(expected = "queued locks")]
    fn test_put_with_queued_locks_panics() {
        let mut table = ResourceTable::new(8);
        let (id, _) = table.get_or_create(key(1), None, true).expect("create");
        table.get_mut(id).push(QueueKind::Granted, LockId(0));
        table.put(id);
    }
}
