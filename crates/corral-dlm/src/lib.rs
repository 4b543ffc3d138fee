//! Lock/resource state machine core of the corral distributed lock
//! manager.
//!
//! A [`Namespace`] tracks named lockable resources, grants/queues/converts/
//! cancels locks against them under the mode-compatibility algebra in
//! `corral_types`, and coordinates revocation of conflicting locks via
//! asynchronous callback ("AST") messages.
//!
//! # Locking discipline
//!
//! All structural state in a namespace is guarded by one mutex. Blocking
//! and completion callbacks run under that mutex and only *build* outbound
//! messages; the messages are batched and transmitted through the
//! registered [`AstTransport`] strictly after the mutex is released, so no
//! network call ever happens under the lock. The single exception is the
//! deferred-cancellation callback fired by the final `decref_use` of a
//! `CB_PENDING` lock, which runs synchronously but outside the mutex.
//!
//! # Errors vs. invariants
//!
//! Environmental failures (capacity, stale handles, policy rejection)
//! return [`corral_error::CorralError`]. Violations of structural
//! invariants — refcount underflow, destroying a lock with children or
//! active users, queue corruption — panic: they indicate a defect, and
//! continuing would corrupt state for every user of the namespace.

mod arena;
mod config;
mod dispatch;
mod enqueue;
mod lock;
mod namespace;
mod policy;
mod reprocess;
mod resource;

pub use config::{DlmConfig, DEFAULT_MAX_LOCKS, DEFAULT_MAX_RESOURCES};
pub use dispatch::{AstTransport, CollectingTransport, NoOpTransport};
pub use lock::{BlockingAst, CompletionAst};
pub use namespace::{Namespace, NamespaceRole, ResourceStats};
pub use policy::{IntentPolicy, PolicyOutcome};
