//! Resource identity, resource types, and lock payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of lockable resource.
///
/// The type selects the per-type compatibility hook and the payload shape a
/// lock against the resource may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// Whole-resource locking; mode matrix only.
    Plain,
    /// Byte-range locking; non-overlapping extents never conflict.
    Extent,
    /// Attribute-bit locking with an intent policy hook on the server.
    IntentBits,
}

impl ResourceType {
    /// Three-letter diagnostic name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLN",
            Self::Extent => "EXT",
            Self::IntentBits => "INT",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a lockable resource within one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Three-part numeric name (e.g. inode, generation, stripe).
    pub name: [u64; 3],
    /// Resource kind; part of the identity.
    pub rtype: ResourceType,
}

impl ResourceKey {
    #[must_use]
    pub const fn new(name: [u64; 3], rtype: ResourceType) -> Self {
        Self { name, rtype }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}/{}",
            self.name[0], self.name[1], self.name[2], self.rtype
        )
    }
}

/// Inclusive byte range carried by locks on [`ResourceType::Extent`]
/// resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Whether the two ranges share at least one byte.
    #[must_use]
    pub const fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Whether `self` fully contains `other`.
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        self.start <= other.start && self.end >= other.end
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.start, self.end)
    }
}

/// Type-specific payload attached to a lock request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockPayload {
    /// No payload ([`ResourceType::Plain`]).
    #[default]
    None,
    /// Byte range ([`ResourceType::Extent`]).
    Extent(Extent),
    /// Attribute bit set ([`ResourceType::IntentBits`]).
    Bits(u64),
}

impl LockPayload {
    /// Whether this payload shape is legal for a resource of `rtype`.
    #[must_use]
    pub const fn matches_type(self, rtype: ResourceType) -> bool {
        matches!(
            (self, rtype),
            (Self::None, ResourceType::Plain)
                | (Self::Extent(_), ResourceType::Extent)
                | (Self::Bits(_), ResourceType::IntentBits)
        )
    }

    /// Whether a held lock with this payload satisfies a request for
    /// `wanted` (extent containment, bit superset).
    #[must_use]
    pub const fn covers(self, wanted: Self) -> bool {
        match (self, wanted) {
            (Self::None, Self::None) => true,
            (Self::Extent(held), Self::Extent(req)) => held.covers(req),
            (Self::Bits(held), Self::Bits(req)) => held & req == req,
            _ => false,
        }
    }

    /// Whether two payloads touch the same part of the resource.
    ///
    /// Disjoint payloads are what the per-type compat hooks treat as
    /// conflict-free regardless of mode.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        match (self, other) {
            (Self::Extent(a), Self::Extent(b)) => a.overlaps(b),
            (Self::Bits(a), Self::Bits(b)) => a & b != 0,
            // Payload-less locks span the whole resource.
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // test_extent_overlap
    // -----------------------------------------------------------------------

    #[test]
    fn test_extent_overlap() {
        let a = Extent::new(0, 99);
        let b = Extent::new(100, 199);
        let c = Extent::new(50, 149);

        assert!(!a.overlaps(b), "adjacent disjoint ranges do not overlap");
        assert!(!b.overlaps(a));
        assert!(a.overlaps(c) && c.overlaps(a));
        assert!(b.overlaps(c) && c.overlaps(b));
        assert!(a.overlaps(a), "a range overlaps itself");
    }

    // -----------------------------------------------------------------------
    // test_extent_covers
    // -----------------------------------------------------------------------

    #[test]
    fn test_extent_covers() {
        let outer = Extent::new(0, 1000);
        let inner = Extent::new(10, 20);
        assert!(outer.covers(inner));
        assert!(!inner.covers(outer));
        assert!(outer.covers(outer));
    }

    // -----------------------------------------------------------------------
    // test_payload_covers_and_intersects
    // -----------------------------------------------------------------------

    #[test]
    fn test_payload_covers_and_intersects() {
        let held = LockPayload::Bits(0b1110);
        assert!(held.covers(LockPayload::Bits(0b0110)));
        assert!(!held.covers(LockPayload::Bits(0b0001)));
        assert!(held.intersects(LockPayload::Bits(0b1000)));
        assert!(!held.intersects(LockPayload::Bits(0b0001)));

        let e = LockPayload::Extent(Extent::new(0, 9));
        assert!(!e.intersects(LockPayload::Extent(Extent::new(10, 19))));
        // A payload-less lock conflicts with everything on the resource.
        assert!(LockPayload::None.intersects(e));
    }

    // -----------------------------------------------------------------------
    // test_payload_type_check
    // -----------------------------------------------------------------------

    #[test]
    fn test_payload_type_check() {
        assert!(LockPayload::None.matches_type(ResourceType::Plain));
        assert!(LockPayload::Extent(Extent::new(0, 0)).matches_type(ResourceType::Extent));
        assert!(LockPayload::Bits(1).matches_type(ResourceType::IntentBits));
        assert!(!LockPayload::None.matches_type(ResourceType::Extent));
        assert!(!LockPayload::Bits(1).matches_type(ResourceType::Plain));
    }

    // -----------------------------------------------------------------------
    // test_key_display
    // -----------------------------------------------------------------------

    #[test]
    fn test_key_display() {
        let key = ResourceKey::new([7, 0, 3], ResourceType::Extent);
        assert_eq!(key.to_string(), "7:0:3/EXT");
    }
}
