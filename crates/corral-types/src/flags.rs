//! Lock state flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Bit set of per-lock state flags.
///
/// The same representation is used for the in/out flag word passed through
/// `enqueue`/`convert` and for the flags stored on the lock itself, so a
/// server reply can be applied to a client lock without translation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct LockFlags(u32);

impl LockFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Request blocked by an incompatible granted lock.
    pub const BLOCK_GRANTED: Self = Self(1 << 0);
    /// Request blocked behind a non-empty converting queue.
    pub const BLOCK_CONV: Self = Self(1 << 1);
    /// Request blocked behind a non-empty waiting queue.
    pub const BLOCK_WAIT: Self = Self(1 << 2);
    /// A blocking AST arrived while the lock was in use; release is owed.
    pub const CB_PENDING: Self = Self(1 << 3);
    /// A blocking AST has been sent for this lock (at most once).
    pub const AST_SENT: Self = Self(1 << 4);
    /// The lock has been destroyed and must not be resolved again.
    pub const DESTROYED: Self = Self(1 << 5);
    /// The policy hook retargeted the lock to a different resource.
    pub const LOCK_CHANGED: Self = Self(1 << 6);
    /// The lock value block is valid. Carried for wire compatibility; the
    /// core never reads it.
    pub const VALUE_BLOCK_READY: Self = Self(1 << 7);

    /// Union of the three "you must queue" flags.
    pub const BLOCK_MASK: Self =
        Self(Self::BLOCK_GRANTED.0 | Self::BLOCK_CONV.0 | Self::BLOCK_WAIT.0);

    #[must_use]
    pub const fn empty() -> Self {
        Self::NONE
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag in `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl BitOr for LockFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LockFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for LockFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
