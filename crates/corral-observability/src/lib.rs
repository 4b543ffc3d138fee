//! Lock manager event observation infrastructure.
//!
//! Provides shared types for grant/queue/AST analytics across the corral
//! core.
//!
//! # Design Principles
//!
//! - **Zero-cost when unused:** observation is opt-in via the
//!   [`LockObserver`] trait; the default [`NoOpObserver`] is inlined away.
//! - **Non-blocking:** observers are called while the namespace structural
//!   mutex is held and MUST NOT call back into the namespace or block.
//!   Event emission is purely diagnostic.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use corral_types::{LockMode, ResourceKey};

// ---------------------------------------------------------------------------
// LockEvent — the core event type
// ---------------------------------------------------------------------------

/// Which queue a lock was placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueueName {
    Granted,
    Converting,
    Waiting,
}

/// A single event emitted by the lock manager core.
///
/// Each variant carries enough context to reconstruct what happened without
/// access to internal namespace state. `lock` is the arena id of the lock
/// involved (not a validated handle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LockEvent {
    /// A resource entry was created in the namespace.
    ResourceCreated { key: ResourceKey },

    /// An enqueue placed a lock on a queue.
    Enqueued {
        key: ResourceKey,
        lock: u64,
        mode: LockMode,
        queue: QueueName,
    },

    /// A lock reached its requested mode.
    Granted {
        key: ResourceKey,
        lock: u64,
        mode: LockMode,
    },

    /// A blocking AST was batched for a conflicting holder.
    BlockingAstQueued { key: ResourceKey, holder: u64 },

    /// A completion AST was batched for a granted lock.
    CompletionAstQueued { key: ResourceKey, lock: u64 },

    /// A lock changed its requested mode and re-entered the queues.
    Converted {
        key: ResourceKey,
        lock: u64,
        new_mode: LockMode,
    },

    /// A lock was cancelled and destroyed.
    Cancelled { key: ResourceKey, lock: u64 },

    /// A reprocess pass finished over one resource.
    Reprocessed {
        key: ResourceKey,
        /// Number of queued locks promoted to granted during the pass.
        granted: usize,
    },
}

// ---------------------------------------------------------------------------
// LockObserver — trait for zero-cost opt-in observation
// ---------------------------------------------------------------------------

/// Observer trait for lock manager events.
///
/// Implementations MUST be non-blocking and MUST NOT re-enter the
/// namespace; they run under its structural mutex.
pub trait LockObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &LockEvent);
}

/// No-op observer that compiles to nothing. Default when observability is
/// not configured.
#[derive(Debug, Clone, Copy)]
pub struct NoOpObserver;

impl LockObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &LockEvent) {}
}

// ---------------------------------------------------------------------------
// CountingObserver — cheap per-kind counters
// ---------------------------------------------------------------------------

/// Observer that maintains atomic per-kind counters.
///
/// Suitable for production metrics scraping and for asserting AST/grant
/// counts in tests.
#[derive(Debug, Default)]
pub struct CountingObserver {
    grants: AtomicU64,
    enqueues: AtomicU64,
    blocking_asts: AtomicU64,
    completion_asts: AtomicU64,
    cancels: AtomicU64,
    reprocess_passes: AtomicU64,
}

impl CountingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn grants(&self) -> u64 {
        self.grants.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn enqueues(&self) -> u64 {
        self.enqueues.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn blocking_asts(&self) -> u64 {
        self.blocking_asts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn completion_asts(&self) -> u64 {
        self.completion_asts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cancels(&self) -> u64 {
        self.cancels.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reprocess_passes(&self) -> u64 {
        self.reprocess_passes.load(Ordering::Relaxed)
    }
}

impl LockObserver for CountingObserver {
    fn on_event(&self, event: &LockEvent) {
        let counter = match event {
            LockEvent::Granted { .. } => &self.grants,
            LockEvent::Enqueued { .. } => &self.enqueues,
            LockEvent::BlockingAstQueued { .. } => &self.blocking_asts,
            LockEvent::CompletionAstQueued { .. } => &self.completion_asts,
            LockEvent::Cancelled { .. } => &self.cancels,
            LockEvent::Reprocessed { .. } => &self.reprocess_passes,
            LockEvent::ResourceCreated { .. } | LockEvent::Converted { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// RecordingObserver — full event capture for tests
// ---------------------------------------------------------------------------

/// Observer that records every event in order. Test/diagnostic use only;
/// unbounded.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LockEvent>>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<LockEvent> {
        self.events.lock().clone()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl LockObserver for RecordingObserver {
    fn on_event(&self, event: &LockEvent) {
        self.events.lock().push(event.clone());
    }
}
