//! Per-resource-type compatibility hooks and the intent policy seam.
//!
//! Resource types carry two pieces of pluggable behavior:
//!
//! - a *compat hook*, an additional compatibility test beyond the mode
//!   matrix (e.g. non-overlapping extents never conflict regardless of
//!   mode) — fixed per type, implemented here;
//! - an *intent policy*, server-side business logic invoked once per
//!   enqueue that may retarget the request to a different resource or
//!   abort it — supplied by the embedding server via [`IntentPolicy`].

use corral_types::{LockDesc, LockMode, LockPayload, ResourceKey, ResourceType};

/// Result of running the intent policy for one enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// Proceed with the enqueue unchanged.
    Continue,
    /// The composite request resolved to a different resource; retarget the
    /// lock there and continue. Informational for the caller, not an error.
    ResourceChanged(ResourceKey),
    /// Refuse the request. The half-built lock is destroyed and the reason
    /// is returned to the caller.
    Aborted(String),
}

/// Server-side policy executed during enqueue on the authority side only.
///
/// `desc` is a snapshot of the candidate lock, `context` the opaque request
/// context supplied by the caller of `enqueue` (typically the serialized
/// composite request), and `mode` the requested mode. Implementations run
/// outside the namespace structural mutex and must not call back into the
/// namespace for the lock being enqueued.
pub trait IntentPolicy: Send + Sync {
    fn apply(&self, desc: &LockDesc, context: Option<&[u8]>, mode: LockMode) -> PolicyOutcome;
}

/// Per-type compat hook: `true` means the two locks are compatible no
/// matter what their modes say.
///
/// Plain resources have no hook (the matrix decides alone). Extent and
/// attribute-bit resources treat locks that touch disjoint parts of the
/// resource as compatible.
#[must_use]
pub(crate) fn hook_compatible(rtype: ResourceType, a: LockPayload, b: LockPayload) -> bool {
    match rtype {
        ResourceType::Plain => false,
        ResourceType::Extent | ResourceType::IntentBits => !a.intersects(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_types::Extent;

    // -----------------------------------------------------------------------
    // test_extent_hook_disjoint_ranges
    // -----------------------------------------------------------------------

    #[test]
    fn test_extent_hook_disjoint_ranges() {
        let a = LockPayload::Extent(Extent::new(0, 99));
        let b = LockPayload::Extent(Extent::new(100, 199));
        let c = LockPayload::Extent(Extent::new(50, 150));

        assert!(hook_compatible(ResourceType::Extent, a, b));
        assert!(!hook_compatible(ResourceType::Extent, a, c));
    }

    // -----------------------------------------------------------------------
    // test_plain_hook_never_overrides
    // -----------------------------------------------------------------------

    #[test]
    fn test_plain_hook_never_overrides() {
        assert!(!hook_compatible(
            ResourceType::Plain,
            LockPayload::None,
            LockPayload::None
        ));
    }

    // -----------------------------------------------------------------------
    // test_bits_hook_disjoint_sets
    // -----------------------------------------------------------------------

    #[test]
    fn test_bits_hook_disjoint_sets() {
        let a = LockPayload::Bits(0b0011);
        let b = LockPayload::Bits(0b1100);
        let c = LockPayload::Bits(0b0110);

        assert!(hook_compatible(ResourceType::IntentBits, a, b));
        assert!(!hook_compatible(ResourceType::IntentBits, a, c));
    }
}
