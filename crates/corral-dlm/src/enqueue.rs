//! The enqueue engine: grant-now, queue-for-conversion, or queue-waiting.
//!
//! States of one lock request: unqueued → {granted, converting, waiting} →
//! destroyed. `enqueue` decides the first transition; reprocessing (see
//! [`crate::reprocess`]) performs the later ones.

use tracing::debug;

use corral_error::{CorralError, Result};
use corral_observability::{LockEvent, QueueName};
use corral_types::{LockFlags, LockHandle, LockMode, LockPayload, ResourceKey};

use crate::dispatch::{self, AstBatch};
use crate::lock::{BlockingAst, CompletionAst, LockId, QueueKind};
use crate::namespace::{Namespace, NamespaceInner};
use crate::policy::{hook_compatible, PolicyOutcome};

impl Namespace {
    /// Enqueue a created lock against its resource.
    ///
    /// `flags` is an in/out word: `BLOCK_CONV`/`BLOCK_WAIT`/`BLOCK_GRANTED`
    /// on input force queue placement (participant mirroring a server
    /// decision); on output they report why the request queued, and
    /// `LOCK_CHANGED` reports that the intent policy retargeted the lock —
    /// informational, the enqueue still proceeds and the caller must
    /// re-read the resource key.
    ///
    /// The intent policy (authority side only) runs outside the structural
    /// mutex. `Aborted` destroys the half-built lock, caller reference
    /// included, and surfaces as [`CorralError::EnqueueAborted`]; the
    /// handle is dead afterwards and must not be released.
    ///
    /// The completion callback is attached only after the grant/queue
    /// decision, so an immediately-granted lock does not fire it.
    pub fn enqueue(
        &self,
        handle: LockHandle,
        payload: LockPayload,
        flags: &mut LockFlags,
        completion: Option<CompletionAst>,
        blocking: Option<BlockingAst>,
        context: Option<&[u8]>,
    ) -> Result<()> {
        // Attach the blocking callback and snapshot the request for the
        // policy hook.
        let (desc, rtype) = {
            let mut inner = self.inner.lock();
            let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;
            let key = inner.resources.get(inner.locks.get(id).resource).key;
            if !payload.matches_type(key.rtype) {
                return Err(CorralError::InvalidPayload {
                    expected: key.rtype,
                    key,
                });
            }
            let lock = inner.locks.get_mut(id);
            lock.blocking_ast = blocking;
            lock.payload = payload;
            (lock.desc(key), key.rtype)
        };

        // Policies are not executed on the participant side, and never
        // under the structural mutex: the hook may run arbitrary server
        // business logic.
        let outcome = if self.is_authority() {
            match self.policies.read().get(&rtype).cloned() {
                Some(policy) => policy.apply(&desc, context, desc.requested_mode),
                None => PolicyOutcome::Continue,
            }
        } else {
            PolicyOutcome::Continue
        };

        let mut batch = AstBatch::new();
        {
            let mut inner = self.inner.lock();
            let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;

            match outcome {
                PolicyOutcome::Continue => {}
                PolicyOutcome::Aborted(reason) => {
                    debug!(%handle, %reason, "enqueue aborted by intent policy");
                    // The abort consumes the caller's reference too: the
                    // handle is dead and needs no release.
                    inner.destroy_lock(id);
                    inner.lock_put(id);
                    return Err(CorralError::EnqueueAborted { reason });
                }
                PolicyOutcome::ResourceChanged(new_key) => {
                    if let Err(err) = inner.change_resource(id, new_key) {
                        inner.destroy_lock(id);
                        inner.lock_put(id);
                        return Err(err);
                    }
                    inner.locks.get_mut(id).flags.insert(LockFlags::LOCK_CHANGED);
                    flags.insert(LockFlags::LOCK_CHANGED);
                }
            }

            let (res_id, mode, pre_granted) = {
                let lock = inner.locks.get(id);
                (lock.resource, lock.requested_mode, lock.is_granted())
            };
            let key = inner.resources.get(res_id).key;

            if !inner.authority && pre_granted {
                // The server granted the lock before we got a chance to
                // enqueue it locally; nothing to evaluate.
                inner.locks.get_mut(id).completion_ast = completion;
                return Ok(());
            }

            inner.unlink(id);

            if !inner.authority {
                // Participant: placement mirrors the flags the server
                // handed back.
                if flags.contains(LockFlags::BLOCK_CONV) {
                    inner.enqueue_on(id, QueueKind::Converting, key, mode);
                } else if flags.intersects(LockFlags::BLOCK_WAIT | LockFlags::BLOCK_GRANTED) {
                    inner.enqueue_on(id, QueueKind::Waiting, key, mode);
                } else {
                    inner.grant(id, &mut batch);
                }
            } else if !inner.resources.get(res_id).converting.is_empty() {
                inner.enqueue_on(id, QueueKind::Waiting, key, mode);
                flags.insert(LockFlags::BLOCK_CONV);
            } else if !inner.resources.get(res_id).waiting.is_empty() {
                // Strict FIFO: even a compatible request queues behind
                // earlier waiters.
                inner.enqueue_on(id, QueueKind::Waiting, key, mode);
                flags.insert(LockFlags::BLOCK_WAIT);
            } else if !inner.compatible_with_queues(id, true, &mut batch) {
                // The only path that issues blocking ASTs during enqueue
                // itself: notify every incompatible holder.
                inner.enqueue_on(id, QueueKind::Waiting, key, mode);
                flags.insert(LockFlags::BLOCK_GRANTED);
            } else {
                inner.grant(id, &mut batch);
            }

            // Attach the completion callback only now, after the decision.
            inner.locks.get_mut(id).completion_ast = completion;
        }

        self.grant_cv.notify_all();
        dispatch::flush(&*self.transport, batch);
        Ok(())
    }

    /// Find an already-existing lock that satisfies `mode` and `payload`
    /// on `key`, scanning granted, then converting, then waiting.
    ///
    /// Skips locks with a pending release obligation (`CB_PENDING`). On a
    /// hit the lock gets an [`Self::addref_use`] in `mode` and its handle
    /// is returned; if the match came from a non-granted queue, this call
    /// blocks (outside the structural mutex) until the lock is granted.
    #[must_use]
    pub fn lock_match(
        &self,
        key: &ResourceKey,
        mode: LockMode,
        payload: LockPayload,
    ) -> Option<LockHandle> {
        let (handle, needs_wait) = {
            let mut inner = self.inner.lock();
            let res_id = inner.resources.find(key)?;

            let found = {
                let res = inner.resources.get(res_id);
                let queues = [&res.granted, &res.converting, &res.waiting];
                let mut found = None;
                'scan: for queue in queues {
                    for &id in queue.iter() {
                        let lock = inner.locks.get(id);
                        if lock.flags.contains(LockFlags::CB_PENDING) {
                            continue;
                        }
                        if lock.requested_mode != mode {
                            continue;
                        }
                        if !lock.payload.covers(payload) {
                            continue;
                        }
                        found = Some(id);
                        break 'scan;
                    }
                }
                found
            };

            let id = found?;
            inner.addref_use(id, mode);
            let lock = inner.locks.get(id);
            let handle = lock.handle(id);
            let needs_wait = !lock.is_granted();
            debug!(%handle, %key, mode = %mode, needs_wait, "matched existing lock");
            (handle, needs_wait)
        };

        if needs_wait {
            // Matched from converting/waiting: wait for the grant without
            // holding the structural mutex.
            self.wait_for_grant(handle).ok()?;
        }
        Some(handle)
    }
}

impl NamespaceInner {
    /// Place the lock on a queue and emit the enqueue event.
    pub(crate) fn enqueue_on(
        &mut self,
        id: LockId,
        queue: QueueKind,
        key: ResourceKey,
        mode: LockMode,
    ) {
        self.link(id, queue);
        let queue_name = match queue {
            QueueKind::Granted => QueueName::Granted,
            QueueKind::Converting => QueueName::Converting,
            QueueKind::Waiting => QueueName::Waiting,
            QueueKind::Unqueued | QueueKind::Destroyed => unreachable!("not a queue"),
        };
        debug!(lock = %id, %key, mode = %mode, queue = ?queue_name, "lock queued");
        self.observer.on_event(&LockEvent::Enqueued {
            key,
            lock: u64::from(id.0),
            mode,
            queue: queue_name,
        });
    }

    /// Whether `candidate` is compatible with every lock on one queue.
    ///
    /// Compatibility is the per-type hook (disjoint extents/bits never
    /// conflict) OR the mode matrix against each holder's granted mode.
    /// With `send_cbs`, every incompatible holder with a blocking callback
    /// gets a blocking AST batched; the walk still visits the whole queue
    /// so each holder is notified.
    fn check_queue(
        &mut self,
        candidate: LockId,
        queue: QueueKind,
        send_cbs: bool,
        batch: &mut AstBatch,
    ) -> bool {
        let cand = self.locks.get(candidate);
        let res_id = cand.resource;
        let cand_mode = cand.requested_mode;
        let cand_payload = cand.payload;
        let rtype = self.resources.get(res_id).key.rtype;

        let others: Vec<LockId> = match queue {
            QueueKind::Granted => self.resources.get(res_id).granted.clone(),
            QueueKind::Converting => self.resources.get(res_id).converting.clone(),
            _ => panic!("check_queue: {queue:?} is not checked for compatibility"),
        };

        let mut compatible = true;
        for other in others {
            if other == candidate {
                continue;
            }
            let holder = self.locks.get(other);
            if hook_compatible(rtype, holder.payload, cand_payload) {
                continue;
            }
            if holder.held_mode().compatible(cand_mode) {
                continue;
            }

            compatible = false;
            if send_cbs {
                self.send_blocking_ast(other, candidate, batch);
            } else {
                break;
            }
        }
        compatible
    }

    /// Test `candidate` against the granted queue and, when that passes,
    /// the converting queue.
    pub(crate) fn compatible_with_queues(
        &mut self,
        candidate: LockId,
        send_cbs: bool,
        batch: &mut AstBatch,
    ) -> bool {
        if !self.check_queue(candidate, QueueKind::Granted, send_cbs, batch) {
            return false;
        }
        self.check_queue(candidate, QueueKind::Converting, send_cbs, batch)
    }
}
