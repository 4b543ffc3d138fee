//! Grant, blocking-AST generation, and queue reprocessing.
//!
//! Reprocessing runs after any event that frees compatibility headroom
//! (cancel, final use-drop, convert): it walks the converting queue and,
//! once that drains, the waiting queue, promoting locks in strict FIFO
//! order and stopping at the first one that is still blocked. Blocking
//! ASTs produced along the way are batched and flushed by the public
//! operation after it releases the structural mutex.

use tracing::debug;

use corral_error::{CorralError, Result};
use corral_observability::LockEvent;
use corral_types::{LockFlags, LockHandle, LockMode, ResourceKey};

use crate::dispatch::{self, AstBatch};
use crate::lock::{LockId, QueueKind};
use crate::namespace::{Namespace, NamespaceInner};
use crate::resource::ResourceId;

impl NamespaceInner {
    /// Grant an unqueued lock: move it to the granted queue, set its
    /// granted mode, tighten the resource's most-restrictive cache, and
    /// batch its completion AST if one is attached.
    pub(crate) fn grant(&mut self, id: LockId, batch: &mut AstBatch) {
        let lock = self.locks.get_mut(id);
        let mode = lock.requested_mode;
        lock.granted_mode = Some(mode);
        // A fresh grant resets the at-most-once blocking-AST latch.
        lock.flags.remove(LockFlags::AST_SENT);
        let res_id = lock.resource;

        self.link(id, QueueKind::Granted);

        let res = self.resources.get_mut(res_id);
        if mode > res.most_restrictive {
            res.most_restrictive = mode;
        }
        let key = res.key;
        debug!(lock = %id, %key, mode = %mode, "lock granted");

        let (completion, flags, handle, data) = {
            let lock = self.locks.get(id);
            (
                lock.completion_ast.clone(),
                lock.flags,
                lock.handle(id),
                lock.client_data.clone(),
            )
        };
        if let Some(cb) = completion {
            if let Some(msg) = cb(handle, flags, data.as_deref()) {
                batch.push(msg);
                self.observer.on_event(&LockEvent::CompletionAstQueued {
                    key,
                    lock: u64::from(id.0),
                });
            }
        }
        self.observer.on_event(&LockEvent::Granted {
            key,
            lock: u64::from(id.0),
            mode,
        });
    }

    /// Batch a blocking AST asking `holder` to release, because
    /// `candidate` conflicts with it. At most one blocking AST per lock
    /// until it is cancelled or regranted (`AST_SENT` latch).
    pub(crate) fn send_blocking_ast(
        &mut self,
        holder: LockId,
        candidate: LockId,
        batch: &mut AstBatch,
    ) {
        {
            let lock = self.locks.get(holder);
            if lock.flags.contains(LockFlags::AST_SENT) || lock.blocking_ast.is_none() {
                return;
            }
        }
        self.locks.get_mut(holder).flags.insert(LockFlags::AST_SENT);

        let cand_key = self.resources.get(self.locks.get(candidate).resource).key;
        let desc = self.locks.get(candidate).desc(cand_key);
        let (cb, handle, data) = {
            let lock = self.locks.get(holder);
            (
                lock.blocking_ast.clone().expect("checked above"),
                lock.handle(holder),
                lock.client_data.clone(),
            )
        };
        debug!(holder = %holder, candidate = %candidate, key = %cand_key, "blocking AST");
        if let Some(msg) = cb(handle, Some(&desc), data.as_deref()) {
            batch.push(msg);
        }
        let holder_key = self.resources.get(self.locks.get(holder).resource).key;
        self.observer.on_event(&LockEvent::BlockingAstQueued {
            key: holder_key,
            holder: u64::from(holder.0),
        });
    }

    /// Walk one queue in FIFO order, granting every lock that is now
    /// compatible; stop at the first still-blocked lock (which gets
    /// blocking ASTs sent toward whatever blocks it). Returns `true` if
    /// the walk stopped early.
    fn reprocess_queue(
        &mut self,
        res_id: ResourceId,
        queue: QueueKind,
        batch: &mut AstBatch,
        granted: &mut usize,
    ) -> bool {
        let pending: Vec<LockId> = match queue {
            QueueKind::Converting => self.resources.get(res_id).converting.clone(),
            QueueKind::Waiting => self.resources.get(res_id).waiting.clone(),
            _ => panic!("reprocess_queue: {queue:?} is not reprocessed"),
        };

        for id in pending {
            debug!(lock = %id, ?queue, "reprocessing");
            if !self.compatible_with_queues(id, true, batch) {
                return true;
            }
            self.unlink(id);
            self.grant(id, batch);
            *granted += 1;
        }
        false
    }

    /// Re-evaluate a resource's queues after capacity was freed.
    ///
    /// Only meaningful on the authority side; participant lock trees are
    /// never reprocessed. Converting locks go first; waiting locks are
    /// only considered once the converting queue has drained.
    pub(crate) fn reprocess(&mut self, res_id: ResourceId, batch: &mut AstBatch) {
        if !self.authority {
            return;
        }
        // The triggering release may have dropped the resource's last pin.
        if !self.resources.contains(res_id) {
            return;
        }

        let mut granted = 0;
        self.reprocess_queue(res_id, QueueKind::Converting, batch, &mut granted);
        if self.resources.get(res_id).converting.is_empty() {
            self.reprocess_queue(res_id, QueueKind::Waiting, batch, &mut granted);
        }

        let key = self.resources.get(res_id).key;
        self.observer
            .on_event(&LockEvent::Reprocessed { key, granted });
    }
}

impl Namespace {
    /// Change a lock's requested mode and requeue it.
    ///
    /// On the participant side the conversion is granted immediately
    /// (waking any waiter) unless `flags` demand queuing; on the authority
    /// side it always joins the converting queue and the resource is
    /// reprocessed. Returns the lock's resource key.
    pub fn convert(
        &self,
        handle: LockHandle,
        new_mode: LockMode,
        flags: &mut LockFlags,
    ) -> Result<ResourceKey> {
        let mut batch = AstBatch::new();
        let key = {
            let mut inner = self.inner.lock();
            let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;

            inner.locks.get_mut(id).requested_mode = new_mode;
            inner.unlink(id);
            let res_id = inner.locks.get(id).resource;
            let key = inner.resources.get(res_id).key;
            inner.observer.on_event(&LockEvent::Converted {
                key,
                lock: u64::from(id.0),
                new_mode,
            });

            if !inner.authority {
                if flags.intersects(LockFlags::BLOCK_CONV | LockFlags::BLOCK_GRANTED) {
                    inner.enqueue_on(id, QueueKind::Converting, key, new_mode);
                } else {
                    inner.grant(id, &mut batch);
                }
            } else {
                inner.enqueue_on(id, QueueKind::Converting, key, new_mode);
                inner.reprocess(res_id, &mut batch);
            }
            key
        };
        self.grant_cv.notify_all();
        dispatch::flush(&*self.transport, batch);
        Ok(key)
    }

    /// Cancel a lock: unlink it from its queue, destroy it, and reprocess
    /// the resource. The caller must not hold the lock or its resource in
    /// any way; the structural mutex is acquired internally.
    ///
    /// The caller's structural reference survives cancellation and is
    /// dropped with [`Self::release`].
    pub fn cancel(&self, handle: LockHandle) -> Result<()> {
        let mut batch = AstBatch::new();
        {
            let mut inner = self.inner.lock();
            let id = inner.locks.lookup(handle).ok_or(CorralError::StaleHandle)?;

            {
                let lock = inner.locks.get(id);
                if lock.readers > 0 || lock.writers > 0 {
                    debug!(
                        %handle,
                        readers = lock.readers,
                        writers = lock.writers,
                        "cancelling a lock that still has active users"
                    );
                }
            }

            let res_id = inner.locks.get(id).resource;
            let key = inner.resources.get(res_id).key;
            // Keep the resource alive across destroy so it can be
            // reprocessed even if this was its last lock.
            inner.resources.getref(res_id);

            inner.unlink(id);
            inner.destroy_lock(id);
            inner
                .observer
                .on_event(&LockEvent::Cancelled { key, lock: u64::from(id.0) });

            inner.reprocess(res_id, &mut batch);
            inner.resources.put(res_id);
        }
        self.grant_cv.notify_all();
        dispatch::flush(&*self.transport, batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use corral_observability::{LockObserver, RecordingObserver};
    use corral_types::{AstKind, LockPayload, OutboundMessage, ResourceType};

    use super::*;
    use crate::dispatch::{AstTransport, CollectingTransport};
    use crate::lock::{BlockingAst, CompletionAst};
    use crate::namespace::NamespaceRole;

    fn plain_key(n: u64) -> ResourceKey {
        ResourceKey::new([n, 0, 0], ResourceType::Plain)
    }

    fn authority_with_transport() -> (Namespace, Arc<CollectingTransport>) {
        let transport = Arc::new(CollectingTransport::new());
        let ns = Namespace::new(NamespaceRole::Authority)
            .with_transport(Arc::clone(&transport) as Arc<dyn AstTransport>);
        (ns, transport)
    }

    fn revoke_cb() -> BlockingAst {
        Arc::new(|handle, desc, _data| {
            Some(OutboundMessage {
                target: handle,
                kind: AstKind::Blocking,
                desc: desc.copied(),
                flags: LockFlags::empty(),
            })
        })
    }

    fn granted_cb() -> CompletionAst {
        Arc::new(|handle, flags, _data| {
            Some(OutboundMessage {
                target: handle,
                kind: AstKind::Completion,
                desc: None,
                flags,
            })
        })
    }

    fn enqueue_simple(
        ns: &Namespace,
        key: ResourceKey,
        mode: LockMode,
        blocking: Option<BlockingAst>,
        completion: Option<CompletionAst>,
    ) -> (LockHandle, LockFlags) {
        let handle = ns.create(None, key, mode, None).expect("create");
        let mut flags = LockFlags::empty();
        ns.enqueue(handle, LockPayload::None, &mut flags, completion, blocking, None)
            .expect("enqueue");
        (handle, flags)
    }

    // -----------------------------------------------------------------------
    // test_cancel_grants_the_waiter
    // -----------------------------------------------------------------------

    #[test]
    fn test_cancel_grants_the_waiter() {
        let (ns, transport) = authority_with_transport();
        let key = plain_key(1);

        let (holder, _) = enqueue_simple(&ns, key, LockMode::PR, Some(revoke_cb()), None);
        let (writer, flags) = enqueue_simple(&ns, key, LockMode::EX, None, Some(granted_cb()));
        assert!(flags.contains(LockFlags::BLOCK_GRANTED));
        let sent = transport.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, holder);

        // The holder complies with the blocking AST by cancelling.
        ns.cancel(holder).expect("cancel holder");
        ns.release(holder).expect("release holder");

        assert_eq!(ns.lock_modes(writer), Ok((LockMode::EX, Some(LockMode::EX))));
        ns.wait_for_grant(writer).expect("already granted, returns at once");
        let stats = ns.resource_stats(&key).expect("resource");
        assert_eq!((stats.granted, stats.waiting), (1, 0));
        assert_eq!(stats.most_restrictive, LockMode::EX);

        let sent = transport.drain();
        assert_eq!(sent.len(), 1, "the regrant fires the completion callback");
        assert_eq!(sent[0].kind, AstKind::Completion);
        assert_eq!(sent[0].target, writer);
    }

    // -----------------------------------------------------------------------
    // test_reprocess_regrants_in_fifo_order
    // -----------------------------------------------------------------------

    #[test]
    fn test_reprocess_regrants_in_fifo_order() {
        let observer = Arc::new(RecordingObserver::new());
        let ns = Namespace::new(NamespaceRole::Authority)
            .with_observer(Arc::clone(&observer) as Arc<dyn LockObserver>);
        let key = plain_key(1);

        let (writer, _) = enqueue_simple(&ns, key, LockMode::PW, None, None);
        let (r1, f1) = enqueue_simple(&ns, key, LockMode::PR, None, None);
        let (r2, f2) = enqueue_simple(&ns, key, LockMode::PR, None, None);
        assert!(f1.contains(LockFlags::BLOCK_GRANTED));
        assert!(f2.contains(LockFlags::BLOCK_WAIT));

        ns.cancel(writer).expect("cancel writer");

        let stats = ns.resource_stats(&key).expect("resource");
        assert_eq!((stats.granted, stats.waiting), (2, 0));
        assert_eq!(ns.lock_modes(r1), Ok((LockMode::PR, Some(LockMode::PR))));
        assert_eq!(ns.lock_modes(r2), Ok((LockMode::PR, Some(LockMode::PR))));

        // Grant events after the cancel come out in queue order.
        let grants: Vec<u64> = observer
            .events()
            .iter()
            .filter_map(|ev| match ev {
                LockEvent::Granted { lock, .. } => Some(*lock),
                _ => None,
            })
            .collect();
        assert_eq!(grants, vec![writer.id, r1.id, r2.id]);
    }

    // -----------------------------------------------------------------------
    // test_reprocess_stops_at_first_blocked_waiter
    // -----------------------------------------------------------------------

    #[test]
    fn test_reprocess_stops_at_first_blocked_waiter() {
        let (ns, _) = authority_with_transport();
        let key = plain_key(1);

        let (writer, _) = enqueue_simple(&ns, key, LockMode::EX, None, None);
        let (_, _) = enqueue_simple(&ns, key, LockMode::EX, None, None);
        let (reader, _) = enqueue_simple(&ns, key, LockMode::PR, None, None);

        ns.cancel(writer).expect("cancel first writer");

        // The second writer is granted; the walk stops at the reader it
        // blocks instead of skipping ahead.
        let stats = ns.resource_stats(&key).expect("resource");
        assert_eq!((stats.granted, stats.waiting), (1, 1));
        assert_eq!(ns.lock_modes(reader), Ok((LockMode::PR, None)));
    }

    // -----------------------------------------------------------------------
    // test_convert_on_authority_waits_for_conflicts
    // -----------------------------------------------------------------------

    #[test]
    fn test_convert_on_authority_waits_for_conflicts() {
        let (ns, transport) = authority_with_transport();
        let key = plain_key(1);

        let (a, _) = enqueue_simple(&ns, key, LockMode::CR, None, None);
        let (b, _) = enqueue_simple(&ns, key, LockMode::CR, Some(revoke_cb()), None);

        let mut flags = LockFlags::empty();
        let converted_key = ns.convert(a, LockMode::EX, &mut flags).expect("convert");
        assert_eq!(converted_key, key);

        // `b` still holds CR, so the conversion parks and `b` is asked to
        // release.
        assert_eq!(ns.lock_modes(a), Ok((LockMode::EX, Some(LockMode::CR))));
        assert_eq!(ns.resource_stats(&key).expect("resource").converting, 1);
        let sent = transport.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, b);
        assert!(
            ns.lock_flags(b).expect("b alive").contains(LockFlags::AST_SENT)
        );

        ns.cancel(b).expect("b complies");
        ns.release(b).expect("release b");

        assert_eq!(ns.lock_modes(a), Ok((LockMode::EX, Some(LockMode::EX))));
        let stats = ns.resource_stats(&key).expect("resource");
        assert_eq!((stats.granted, stats.converting), (1, 0));
        assert_eq!(stats.most_restrictive, LockMode::EX);
        assert!(
            !ns.lock_flags(a).expect("a alive").contains(LockFlags::AST_SENT),
            "a fresh grant resets the blocking-AST latch"
        );
    }

    // -----------------------------------------------------------------------
    // test_convert_on_participant_applies_immediately
    // -----------------------------------------------------------------------

    #[test]
    fn test_convert_on_participant_applies_immediately() {
        let ns = Namespace::new(NamespaceRole::Participant);
        let key = plain_key(1);

        let handle = ns.create(None, key, LockMode::PR, None).expect("create");
        let mut flags = LockFlags::empty();
        ns.enqueue(handle, LockPayload::None, &mut flags, None, None, None)
            .expect("enqueue");

        let mut flags = LockFlags::empty();
        ns.convert(handle, LockMode::CW, &mut flags).expect("convert");
        assert_eq!(ns.lock_modes(handle), Ok((LockMode::CW, Some(LockMode::CW))));
        let stats = ns.resource_stats(&key).expect("resource");
        assert_eq!((stats.granted, stats.converting), (1, 0));
    }

    // -----------------------------------------------------------------------
    // test_convert_on_participant_honors_block_flags
    // -----------------------------------------------------------------------

    #[test]
    fn test_convert_on_participant_honors_block_flags() {
        let ns = Namespace::new(NamespaceRole::Participant);
        let key = plain_key(1);

        let handle = ns.create(None, key, LockMode::PR, None).expect("create");
        let mut flags = LockFlags::empty();
        ns.enqueue(handle, LockPayload::None, &mut flags, None, None, None)
            .expect("enqueue");

        // Server reported the conversion is blocked: mirror that locally.
        let mut flags = LockFlags::BLOCK_CONV;
        ns.convert(handle, LockMode::EX, &mut flags).expect("convert");
        assert_eq!(ns.lock_modes(handle), Ok((LockMode::EX, Some(LockMode::PR))));
        assert_eq!(ns.resource_stats(&key).expect("resource").converting, 1);
    }

    // -----------------------------------------------------------------------
    // test_most_restrictive_only_tightens
    // -----------------------------------------------------------------------

    #[test]
    fn test_most_restrictive_only_tightens() {
        let (ns, _) = authority_with_transport();
        let key = plain_key(1);

        let (cw, _) = enqueue_simple(&ns, key, LockMode::CW, None, None);
        assert_eq!(
            ns.resource_stats(&key).expect("resource").most_restrictive,
            LockMode::CW
        );

        // A weaker compatible grant does not lower the cache.
        let (cr, _) = enqueue_simple(&ns, key, LockMode::CR, None, None);
        assert_eq!(
            ns.resource_stats(&key).expect("resource").most_restrictive,
            LockMode::CW
        );

        // Nor does releasing the strongest holder.
        ns.cancel(cw).expect("cancel");
        ns.release(cw).expect("release");
        assert_eq!(
            ns.resource_stats(&key).expect("resource").most_restrictive,
            LockMode::CW
        );

        ns.cancel(cr).expect("cancel");
        ns.release(cr).expect("release");
        let (_, flags) = enqueue_simple(&ns, key, LockMode::EX, None, None);
        assert!(!flags.intersects(LockFlags::BLOCK_MASK));
        assert_eq!(
            ns.resource_stats(&key).expect("resource").most_restrictive,
            LockMode::EX
        );
    }

    // -----------------------------------------------------------------------
    // test_stale_handles_rejected
    // -----------------------------------------------------------------------

    #[test]
    fn test_stale_handles_rejected() {
        let (ns, _) = authority_with_transport();
        let (handle, _) = enqueue_simple(&ns, plain_key(1), LockMode::PR, None, None);

        let forged = LockHandle {
            id: handle.id,
            cookie: handle.cookie.wrapping_add(1),
        };
        let mut flags = LockFlags::empty();
        assert_eq!(
            ns.convert(forged, LockMode::EX, &mut flags),
            Err(CorralError::StaleHandle)
        );
        assert_eq!(ns.cancel(forged), Err(CorralError::StaleHandle));
    }
}
