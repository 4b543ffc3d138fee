//! Handle and descriptor types that cross the process boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{LockFlags, LockMode, LockPayload, ResourceKey};

/// Opaque, validity-checked reference to a lock.
///
/// `id` names a slot in the owning namespace's lock arena; `cookie` is the
/// random token generated when the lock was created. A handle resolves only
/// while the slot is live, the cookie matches, and the lock is not
/// destroyed, so a stale or forged handle yields `None` rather than a
/// dangling reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHandle {
    pub id: u64,
    pub cookie: u64,
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lh#{}:{:#x}", self.id, self.cookie)
    }
}

/// Wire descriptor of a lock, sent to remote holders inside blocking ASTs
/// so they can see what is conflicting with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDesc {
    pub key: ResourceKey,
    pub requested_mode: LockMode,
    pub granted_mode: Option<LockMode>,
    pub payload: LockPayload,
}

/// Which callback an outbound message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AstKind {
    /// Ask the holder to release or downgrade.
    Blocking,
    /// Report that a queued request was granted.
    Completion,
}

/// A callback message produced under the structural mutex and transmitted
/// by the caller only after the mutex is released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// The lock the message is about, as known to the remote peer.
    pub target: LockHandle,
    pub kind: AstKind,
    /// Conflicting-lock descriptor (blocking ASTs only).
    pub desc: Option<LockDesc>,
    /// Flag word snapshot accompanying the message.
    pub flags: LockFlags,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceType;

    // -----------------------------------------------------------------------
    // test_handle_serde_round_trip
    // -----------------------------------------------------------------------

    #[test]
    fn test_handle_serde_round_trip() {
        // Handles must survive serialization across a process boundary.
        let handle = LockHandle {
            id: 42,
            cookie: 0xDEAD_BEEF_CAFE_F00D,
        };
        let json = serde_json::to_string(&handle).expect("handle serializes");
        let back: LockHandle = serde_json::from_str(&json).expect("handle deserializes");
        assert_eq!(back, handle);
    }

    // -----------------------------------------------------------------------
    // test_outbound_message_desc_presence
    // -----------------------------------------------------------------------

    #[test]
    fn test_outbound_message_desc_presence() {
        let desc = LockDesc {
            key: ResourceKey::new([1, 2, 3], ResourceType::Plain),
            requested_mode: LockMode::EX,
            granted_mode: None,
            payload: LockPayload::None,
        };
        let msg = OutboundMessage {
            target: LockHandle { id: 1, cookie: 7 },
            kind: AstKind::Blocking,
            desc: Some(desc),
            flags: LockFlags::AST_SENT,
        };
        assert_eq!(msg.kind, AstKind::Blocking);
        assert!(msg.desc.is_some(), "blocking ASTs carry the conflict desc");
    }
}
