//! Foundation types for the corral distributed lock manager.
//!
//! This crate defines (or re-exports) the cross-cutting types referenced
//! throughout the lock manager: lock modes and their compatibility algebra,
//! resource identities, lock flags, and the wire-facing handle/descriptor
//! types exchanged with remote peers.

mod flags;
mod key;
mod mode;
mod wire;

pub use flags::LockFlags;
pub use key::{Extent, LockPayload, ResourceKey, ResourceType};
pub use mode::LockMode;
pub use wire::{AstKind, LockDesc, LockHandle, OutboundMessage};
