//! The refcounted lock object.
//!
//! A [`Lock`] lives in the namespace's [`LockArena`](crate::arena::LockArena)
//! and is mutated only under the namespace structural mutex. Its identity
//! outside the manager is a [`LockHandle`]: the arena slot index plus the
//! random cookie generated at creation, so stale handles are detected
//! instead of dereferenced.
//!
//! # Reference counting
//!
//! During creation a lock carries:
//! - one reference for existing at all, dropped only by `destroy`;
//! - one reference for being handed back to the caller.
//!
//! Every live reference also pins the lock's resource, and a child lock
//! holds one reference on its parent for its whole lifetime. `addref_use`
//! and `decref_use` track active readers/writers on top of that and each
//! take/release one structural reference.

use std::fmt;
use std::sync::Arc;

use corral_types::{LockDesc, LockFlags, LockHandle, LockMode, LockPayload, OutboundMessage};

use crate::resource::ResourceId;

/// Index of a lock slot in the namespace arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LockId(pub(crate) u32);

impl LockId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l#{}", self.0)
    }
}

/// Which queue a lock currently occupies. A lock is on at most one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    /// Not on any queue (freshly created, or between unlink and requeue).
    Unqueued,
    Granted,
    Converting,
    Waiting,
    /// Terminal: destroyed and unlinked; the slot frees when the refcount
    /// reaches zero.
    Destroyed,
}

/// Blocking AST callback: the holder is asked to release or downgrade.
///
/// Arguments: the holder's handle, the descriptor of the conflicting
/// candidate (absent for the deferred-cancellation invocation out of
/// `decref_use`), and the holder's opaque client data. An implementation
/// may return an outbound message for the dispatcher to transmit once the
/// structural mutex is released; it must not call back into the namespace.
pub type BlockingAst =
    Arc<dyn Fn(LockHandle, Option<&LockDesc>, Option<&[u8]>) -> Option<OutboundMessage> + Send + Sync>;

/// Completion AST callback: a queued request reached its granted mode.
///
/// Same re-entrancy and dispatch rules as [`BlockingAst`].
pub type CompletionAst =
    Arc<dyn Fn(LockHandle, LockFlags, Option<&[u8]>) -> Option<OutboundMessage> + Send + Sync>;

/// A single lock in the namespace.
pub(crate) struct Lock {
    /// Random validation token; part of the exported handle.
    pub(crate) cookie: u64,
    /// Owning resource (may change via intent retargeting).
    pub(crate) resource: ResourceId,
    pub(crate) requested_mode: LockMode,
    /// `None` until first granted.
    pub(crate) granted_mode: Option<LockMode>,
    pub(crate) payload: LockPayload,
    pub(crate) flags: LockFlags,
    /// Active users in reader modes (NL/CR/PR).
    pub(crate) readers: u32,
    /// Active users in writer modes.
    pub(crate) writers: u32,
    /// Structural reference count; the slot frees at zero.
    pub(crate) refcount: u32,
    pub(crate) parent: Option<LockId>,
    pub(crate) children: Vec<LockId>,
    pub(crate) queue: QueueKind,
    pub(crate) blocking_ast: Option<BlockingAst>,
    pub(crate) completion_ast: Option<CompletionAst>,
    /// Opaque caller data handed to both callbacks.
    pub(crate) client_data: Option<Arc<[u8]>>,
}

impl Lock {
    pub(crate) fn new(
        cookie: u64,
        resource: ResourceId,
        requested_mode: LockMode,
        parent: Option<LockId>,
        client_data: Option<Arc<[u8]>>,
    ) -> Self {
        Self {
            cookie,
            resource,
            requested_mode,
            granted_mode: None,
            payload: LockPayload::None,
            flags: LockFlags::empty(),
            readers: 0,
            writers: 0,
            // The "exists" reference; dropped by destroy.
            refcount: 1,
            parent,
            children: Vec::new(),
            queue: QueueKind::Unqueued,
            blocking_ast: None,
            completion_ast: None,
            client_data,
        }
    }

    /// Exportable handle for this lock at slot `id`.
    #[must_use]
    pub(crate) fn handle(&self, id: LockId) -> LockHandle {
        LockHandle {
            id: u64::from(id.0),
            cookie: self.cookie,
        }
    }

    /// Wire descriptor of this lock's current state.
    #[must_use]
    pub(crate) fn desc(&self, key: corral_types::ResourceKey) -> LockDesc {
        LockDesc {
            key,
            requested_mode: self.requested_mode,
            granted_mode: self.granted_mode,
            payload: self.payload,
        }
    }

    /// Whether the lock has reached its requested mode.
    #[must_use]
    pub(crate) fn is_granted(&self) -> bool {
        self.granted_mode == Some(self.requested_mode)
    }

    /// Mode used when testing this lock against a candidate: the granted
    /// mode if any, otherwise NL (a never-granted lock constrains nothing).
    #[must_use]
    pub(crate) fn held_mode(&self) -> LockMode {
        self.granted_mode.unwrap_or(LockMode::NL)
    }

    #[must_use]
    pub(crate) fn destroyed(&self) -> bool {
        self.flags.contains(LockFlags::DESTROYED)
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("cookie", &format_args!("{:#x}", self.cookie))
            .field("resource", &self.resource)
            .field("requested_mode", &self.requested_mode)
            .field("granted_mode", &self.granted_mode)
            .field("payload", &self.payload)
            .field("flags", &self.flags)
            .field("readers", &self.readers)
            .field("writers", &self.writers)
            .field("refcount", &self.refcount)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
