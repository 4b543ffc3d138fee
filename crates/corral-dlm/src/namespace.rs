//! The lock namespace: resource registry, structural mutex, and the
//! refcount/handle surface of the public API.
//!
//! One [`Namespace`] owns every resource and lock in a lock domain. A
//! single structural mutex serializes all mutation across the whole
//! namespace — queue membership, refcounts, flags, cookie checks — a
//! deliberate simplicity-over-scalability tradeoff given how many
//! invariants cut across resources (parent/child lock edges,
//! queue-membership uniqueness, AST-once-per-lock). Callers waiting for a
//! lock to reach its requested mode block on a condition variable outside
//! that mutex.
//!
//! The enqueue state machine lives in [`crate::enqueue`]; grant, blocking
//! ASTs, reprocessing, convert and cancel live in [`crate::reprocess`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use tracing::debug;

use corral_error::{CorralError, Result};
use corral_observability::{LockEvent, LockObserver, NoOpObserver};
use corral_types::{LockFlags, LockHandle, LockMode, ResourceKey, ResourceType};

use crate::arena::LockArena;
use crate::config::DlmConfig;
use crate::dispatch::{self, AstBatch, AstTransport, NoOpTransport};
use crate::lock::{Lock, LockId, QueueKind};
use crate::policy::IntentPolicy;
use crate::resource::ResourceTable;

/// Which side of the protocol this namespace plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceRole {
    /// The coordinating server: evaluates compatibility, runs intent
    /// policies, reprocesses queues.
    Authority,
    /// A remote client: mirrors server decisions, never reprocesses, and
    /// honors pre-granted replies.
    Participant,
}

/// Queue lengths and cached mode for one resource (diagnostics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStats {
    pub granted: usize,
    pub converting: usize,
    pub waiting: usize,
    pub most_restrictive: LockMode,
}

/// All structural state of a namespace; mutated only under the mutex.
pub(crate) struct NamespaceInner {
    pub(crate) locks: LockArena,
    pub(crate) resources: ResourceTable,
    pub(crate) authority: bool,
    pub(crate) observer: Arc<dyn LockObserver>,
}

/// One lock domain.
pub struct Namespace {
    pub(crate) inner: Mutex<NamespaceInner>,
    /// Woken whenever any lock reaches its requested mode.
    pub(crate) grant_cv: Condvar,
    role: NamespaceRole,
    pub(crate) transport: Arc<dyn AstTransport>,
    pub(crate) policies: RwLock<HashMap<ResourceType, Arc<dyn IntentPolicy>>>,
}

impl Namespace {
    /// Create a namespace with default capacity, no transport, and no
    /// observer.
    #[must_use]
    pub fn new(role: NamespaceRole) -> Self {
        Self::with_config(role, DlmConfig::default())
    }

    /// Create a namespace with explicit capacity limits.
    #[must_use]
    pub fn with_config(role: NamespaceRole, config: DlmConfig) -> Self {
        Self {
            inner: Mutex::new(NamespaceInner {
                locks: LockArena::new(config.max_locks),
                resources: ResourceTable::new(config.max_resources),
                authority: role == NamespaceRole::Authority,
                observer: Arc::new(NoOpObserver),
            }),
            grant_cv: Condvar::new(),
            role,
            transport: Arc::new(NoOpTransport),
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the AST transport. Call before sharing the namespace.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn AstTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Replace the event observer. Call before sharing the namespace.
    #[must_use]
    pub fn with_observer(self, observer: Arc<dyn LockObserver>) -> Self {
        self.inner.lock().observer = observer;
        self
    }

    /// Register the intent policy for one resource type. Policies run on
    /// the authority side only.
    pub fn register_policy(&self, rtype: ResourceType, policy: Arc<dyn IntentPolicy>) {
        self.policies.write().insert(rtype, policy);
    }

    #[must_use]
    pub fn role(&self) -> NamespaceRole {
        self.role
    }

    #[must_use]
    pub fn is_authority(&self) -> bool {
        self.role == NamespaceRole::Authority
    }

    // -----------------------------------------------------------------------
    // Lock creation and handle resolution
    // -----------------------------------------------------------------------

    /// Create a lock against `key`, optionally under a parent lock.
    ///
    /// The returned handle carries one caller reference on top of the
    /// lock's own existence reference; drop it with [`Self::release`] once
    /// the lock has been destroyed. The resource is created on demand.
    pub fn create(
        &self,
        parent: Option<LockHandle>,
        key: ResourceKey,
        mode: LockMode,
        client_data: Option<Arc<[u8]>>,
    ) -> Result<LockHandle> {
        let cookie = rand::thread_rng().gen::<u64>();
        let mut inner = self.inner.lock();

        let parent_id = match parent {
            Some(handle) => Some(
                inner
                    .locks
                    .lookup(handle)
                    .ok_or(CorralError::StaleHandle)?,
            ),
            None => None,
        };
        let parent_res = parent_id.map(|pid| inner.locks.get(pid).resource);

        let (res_id, created) = inner
            .resources
            .get_or_create(key, parent_res, true)
            .ok_or_else(CorralError::no_resources)?;

        let lock = Lock::new(cookie, res_id, mode, parent_id, client_data);
        let Some(id) = inner.locks.alloc(lock) else {
            inner.resources.put(res_id);
            return Err(CorralError::no_locks());
        };
        // The existence reference adopts the resource use taken by
        // get_or_create above; the caller reference pins it once more.
        inner.lock_get(id);

        if let Some(pid) = parent_id {
            // A child holds one reference on its parent for its lifetime.
            inner.lock_get(pid);
            inner.locks.get_mut(pid).children.push(id);
        }

        if created {
            inner.observer.on_event(&LockEvent::ResourceCreated { key });
        }
        let handle = inner.locks.get(id).handle(id);
        debug!(%handle, %key, mode = %mode, "lock created");
        Ok(handle)
    }

    /// Validate a handle and take a strong reference on the lock.
    ///
    /// Returns `None` (not an error) for stale, forged, or destroyed
    /// handles. On success the caller owes one [`Self::release`].
    #[must_use]
    pub fn resolve(&self, handle: LockHandle) -> Option<LockHandle> {
        let mut inner = self.inner.lock();
        let id = inner.locks.lookup(handle)?;
        inner.lock_get(id);
        Some(handle)
    }

    /// Take an additional structural reference.
    pub fn addref(&self, handle: LockHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;
        inner.lock_get(id);
        Ok(())
    }

    /// Drop one structural reference. Accepts destroyed locks: the final
    /// release after `destroy`/`cancel` is what frees the slot.
    pub fn release(&self, handle: LockHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = inner
            .locks
            .lookup_any(handle)
            .ok_or(CorralError::StaleHandle)?;
        inner.lock_put(id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reader/writer use counts
    // -----------------------------------------------------------------------

    /// Record an active user of the lock in `mode` (reader for NL/CR/PR,
    /// writer otherwise). Takes one structural reference.
    pub fn addref_use(&self, handle: LockHandle, mode: LockMode) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;
        inner.addref_use(id, mode);
        Ok(())
    }

    /// Drop an active user recorded by [`Self::addref_use`].
    ///
    /// If this was the last user and a blocking AST arrived in the
    /// meantime (`CB_PENDING`), the lock's blocking callback is invoked
    /// synchronously before returning — after the structural mutex has
    /// been released. On the authority side a use-drop to zero frees
    /// compatibility headroom, so the resource is reprocessed.
    pub fn decref_use(&self, handle: LockHandle, mode: LockMode) -> Result<()> {
        let mut batch = AstBatch::new();
        let mut deferred = None;
        {
            let mut inner = self.inner.lock();
            let id = inner
                .locks
                .lookup_any(handle)
                .ok_or(CorralError::StaleHandle)?;

            let lock = inner.locks.get_mut(id);
            if mode.is_read() {
                assert!(lock.readers > 0, "decref_use: reader count underflow");
                lock.readers -= 1;
            } else {
                assert!(lock.writers > 0, "decref_use: writer count underflow");
                lock.writers -= 1;
            }
            let now_idle = lock.readers == 0 && lock.writers == 0;
            let cb_pending = lock.flags.contains(LockFlags::CB_PENDING);
            let res_id = lock.resource;

            if now_idle && cb_pending {
                assert!(
                    !inner.authority,
                    "decref_use: CB_PENDING set on an authority-side lock"
                );
                let lock = inner.locks.get(id);
                debug!(%handle, "final decref on CB_PENDING lock, deferring blocking callback");
                deferred = lock
                    .blocking_ast
                    .clone()
                    .map(|cb| (cb, lock.client_data.clone()));
            }

            // Drop the use reference taken by addref_use.
            inner.lock_put(id);

            if now_idle && !cb_pending {
                inner.reprocess(res_id, &mut batch);
            }
        }
        self.grant_cv.notify_all();
        dispatch::flush(&*self.transport, batch);
        if let Some((cb, data)) = deferred {
            // Outside the mutex: the callback may cancel the lock.
            cb(handle, None, data.as_deref());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Destroy and participant-side protocol glue
    // -----------------------------------------------------------------------

    /// Destroy an unqueued lock: mark it `DESTROYED` and drop its
    /// existence reference. Idempotent. For queued locks use
    /// [`Self::cancel`], which unlinks first.
    ///
    /// # Panics
    ///
    /// Panics if the lock still has children, active users, or queue
    /// membership — those are structural invariant violations.
    pub fn destroy(&self, handle: LockHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = inner
            .locks
            .lookup_any(handle)
            .ok_or(CorralError::StaleHandle)?;
        inner.destroy_lock(id);
        Ok(())
    }

    /// Note that a blocking AST arrived for a lock this participant holds;
    /// the release is owed once the last active user drops.
    pub fn mark_cb_pending(&self, handle: LockHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;
        inner.locks.get_mut(id).flags.insert(LockFlags::CB_PENDING);
        Ok(())
    }

    /// Apply a server reply that granted the lock before the local enqueue
    /// ran (participant side): record the granted mode so enqueue can
    /// short-circuit.
    pub fn note_remote_grant(&self, handle: LockHandle, mode: LockMode) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;
        inner.locks.get_mut(id).granted_mode = Some(mode);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// The lock's current resource key. Re-read this after an enqueue that
    /// reported `LOCK_CHANGED`.
    pub fn resource_key_of(&self, handle: LockHandle) -> Result<ResourceKey> {
        let inner = self.inner.lock();
        let id = inner
            .locks
            .lookup_any(handle)
            .ok_or(CorralError::StaleHandle)?;
        Ok(inner.resources.get(inner.locks.get(id).resource).key)
    }

    /// Snapshot of the lock's flag word.
    pub fn lock_flags(&self, handle: LockHandle) -> Result<LockFlags> {
        let inner = self.inner.lock();
        let id = inner
            .locks
            .lookup_any(handle)
            .ok_or(CorralError::StaleHandle)?;
        Ok(inner.locks.get(id).flags)
    }

    /// Requested and granted mode of the lock.
    pub fn lock_modes(&self, handle: LockHandle) -> Result<(LockMode, Option<LockMode>)> {
        let inner = self.inner.lock();
        let id = inner
            .locks
            .lookup_any(handle)
            .ok_or(CorralError::StaleHandle)?;
        let lock = inner.locks.get(id);
        Ok((lock.requested_mode, lock.granted_mode))
    }

    /// Queue lengths for `key`, if the resource exists.
    #[must_use]
    pub fn resource_stats(&self, key: &ResourceKey) -> Option<ResourceStats> {
        let inner = self.inner.lock();
        let id = inner.resources.find(key)?;
        let res = inner.resources.get(id);
        Some(ResourceStats {
            granted: res.granted.len(),
            converting: res.converting.len(),
            waiting: res.waiting.len(),
            most_restrictive: res.most_restrictive,
        })
    }

    /// Block until the lock reaches its requested mode (granted by this
    /// namespace or reported via [`Self::note_remote_grant`]). The wait is
    /// on a condition variable, not a spin.
    pub fn wait_for_grant(&self, handle: LockHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;
            if inner.locks.get(id).is_granted() {
                return Ok(());
            }
            self.grant_cv.wait(&mut inner);
        }
    }

    /// Render every resource and lock in the namespace, and log it.
    /// Diagnostic only; the format is not stable.
    #[must_use]
    pub fn dump(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "namespace role={:?} resources={} locks={}",
            self.role,
            inner.resources.len(),
            inner.locks.len()
        );
        for (_, res) in inner.resources.iter() {
            let _ = write!(
                out,
                "resource {} use={} most_restrictive={}",
                res.key, res.use_count, res.most_restrictive
            );
            // The parent resource can already be gone if only unparented
            // locks still pin this one.
            if let Some(pid) = res.parent {
                if inner.resources.contains(pid) {
                    let _ = write!(out, " parent={}", inner.resources.get(pid).key);
                }
            }
            let _ = writeln!(out);
            for (label, queue) in [
                ("granted", &res.granted),
                ("converting", &res.converting),
                ("waiting", &res.waiting),
            ] {
                for &id in queue.iter() {
                    let lock = inner.locks.get(id);
                    let granted = lock
                        .granted_mode
                        .map_or("--", |m| m.name());
                    let _ = writeln!(
                        out,
                        "  [{label}] {id} req={} granted={granted} refc={} r/w={}/{} flags={}",
                        lock.requested_mode,
                        lock.refcount,
                        lock.readers,
                        lock.writers,
                        lock.flags
                    );
                }
            }
        }
        debug!("{out}");
        out
    }
}

impl NamespaceInner {
    // -----------------------------------------------------------------------
    // Refcount glue
    // -----------------------------------------------------------------------

    /// Take a structural reference; every reference also pins the lock's
    /// resource.
    pub(crate) fn lock_get(&mut self, id: LockId) {
        let lock = self.locks.get_mut(id);
        lock.refcount += 1;
        let res = lock.resource;
        self.resources.getref(res);
    }

    /// Drop a structural reference. At zero the lock must already be
    /// destroyed; the slot is freed and the parent reference released.
    pub(crate) fn lock_put(&mut self, id: LockId) {
        let lock = self.locks.get_mut(id);
        assert!(lock.refcount > 0, "lock_put: refcount underflow on {id}");
        lock.refcount -= 1;
        let remaining = lock.refcount;
        let res = lock.resource;
        let destroyed = lock.destroyed();
        self.resources.put(res);

        if remaining == 0 {
            assert!(
                destroyed,
                "lock_put: {id} dropped to zero references without destroy"
            );
            let parent = self.locks.get(id).parent;
            self.locks.free(id);
            if let Some(pid) = parent {
                self.locks.get_mut(pid).children.retain(|&c| c != id);
                self.lock_put(pid);
            }
        }
    }

    pub(crate) fn addref_use(&mut self, id: LockId, mode: LockMode) {
        let lock = self.locks.get_mut(id);
        if mode.is_read() {
            lock.readers += 1;
        } else {
            lock.writers += 1;
        }
        self.lock_get(id);
    }

    // -----------------------------------------------------------------------
    // Queue membership
    // -----------------------------------------------------------------------

    /// Append the lock to one of its resource's queues.
    pub(crate) fn link(&mut self, id: LockId, queue: QueueKind) {
        let lock = self.locks.get_mut(id);
        assert!(
            lock.queue == QueueKind::Unqueued,
            "link: {id} already on {:?}",
            lock.queue
        );
        lock.queue = queue;
        let res = lock.resource;
        self.resources.get_mut(res).push(queue, id);
    }

    /// Remove the lock from whatever queue it is on. No-op if unqueued.
    pub(crate) fn unlink(&mut self, id: LockId) {
        let lock = self.locks.get_mut(id);
        let queue = lock.queue;
        match queue {
            QueueKind::Granted | QueueKind::Converting | QueueKind::Waiting => {
                lock.queue = QueueKind::Unqueued;
                let res = lock.resource;
                self.resources.get_mut(res).remove(queue, id);
            }
            QueueKind::Unqueued => {}
            QueueKind::Destroyed => panic!("unlink: {id} is destroyed"),
        }
    }

    // -----------------------------------------------------------------------
    // Destroy
    // -----------------------------------------------------------------------

    /// Mark the lock destroyed and drop its existence reference.
    /// Idempotent once `DESTROYED` is set.
    ///
    /// # Panics
    ///
    /// Panics if the lock still has children, active readers/writers, or
    /// queue membership.
    pub(crate) fn destroy_lock(&mut self, id: LockId) {
        let lock = self.locks.get_mut(id);
        if lock.destroyed() {
            return;
        }
        assert!(
            lock.children.is_empty(),
            "destroy: {id} still has {} children",
            lock.children.len()
        );
        assert!(
            lock.readers == 0 && lock.writers == 0,
            "destroy: {id} still has active users ({} readers, {} writers)",
            lock.readers,
            lock.writers
        );
        assert!(
            lock.queue == QueueKind::Unqueued,
            "destroy: {id} still linked on {:?}",
            lock.queue
        );
        lock.flags.insert(LockFlags::DESTROYED);
        lock.queue = QueueKind::Destroyed;
        self.lock_put(id);
    }

    // -----------------------------------------------------------------------
    // Intent retargeting
    // -----------------------------------------------------------------------

    /// Move the lock (and every resource pin its references hold) from its
    /// current resource to `new_key`, creating the resource if needed.
    ///
    /// The new key must keep the resource type: the lock's payload was
    /// validated against it, and the compat hooks dispatch on it.
    ///
    /// The lock must be unqueued: retargeting happens during enqueue,
    /// before placement.
    pub(crate) fn change_resource(&mut self, id: LockId, new_key: ResourceKey) -> Result<()> {
        let lock = self.locks.get(id);
        assert!(
            lock.queue == QueueKind::Unqueued,
            "change_resource: {id} is on {:?}",
            lock.queue
        );
        let old_res = lock.resource;
        let refcount = lock.refcount;

        let old_type = self.resources.get(old_res).key.rtype;
        if new_key.rtype != old_type {
            return Err(CorralError::InvalidPayload {
                expected: old_type,
                key: new_key,
            });
        }

        let (new_res, created) = self
            .resources
            .get_or_create(new_key, None, true)
            .ok_or_else(CorralError::no_resources)?;
        if created {
            self.observer
                .on_event(&LockEvent::ResourceCreated { key: new_key });
        }

        // get_or_create took one use; the lock's references need
        // `refcount` pins on the new resource and none on the old.
        for _ in 1..refcount {
            self.resources.getref(new_res);
        }
        for _ in 0..refcount {
            self.resources.put(old_res);
        }
        self.locks.get_mut(id).resource = new_res;
        debug!(%id, key = %new_key, "lock retargeted to new resource");
        Ok(())
    }
}
