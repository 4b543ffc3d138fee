//! Primary error type for corral lock manager operations.
//!
//! Only environmental, caller-recoverable conditions are represented here.
//! Violations of the manager's structural invariants (negative refcounts,
//! destroying a lock that still has children or active users, queue
//! corruption) are programming defects: they panic rather than return an
//! error, because continuing would corrupt shared state for every other
//! user of the namespace.

use corral_types::{ResourceKey, ResourceType};
use thiserror::Error;

/// Recoverable, caller-visible lock manager error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorralError {
    /// A configured capacity limit (locks or resources) was reached and the
    /// allocation could not be satisfied.
    #[error("out of memory: cannot allocate {what}")]
    OutOfMemory {
        /// What failed to allocate ("lock" or "resource").
        what: &'static str,
    },

    /// The intent policy hook rejected the request during enqueue. The
    /// half-built lock has already been destroyed; the caller must not
    /// assume any lock exists.
    #[error("enqueue aborted by policy: {reason}")]
    EnqueueAborted { reason: String },

    /// A handle passed to an operation no longer resolves to a live lock.
    /// (`resolve` itself reports staleness as `None`, not as this error.)
    #[error("stale lock handle")]
    StaleHandle,

    /// The request payload shape does not match the resource type.
    #[error("payload does not match resource type {expected} for {key}")]
    InvalidPayload {
        expected: ResourceType,
        key: ResourceKey,
    },
}

impl CorralError {
    /// Shorthand for lock-allocation failure.
    #[must_use]
    pub const fn no_locks() -> Self {
        Self::OutOfMemory { what: "lock" }
    }

    /// Shorthand for resource-allocation failure.
    #[must_use]
    pub const fn no_resources() -> Self {
        Self::OutOfMemory { what: "resource" }
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CorralError>;

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // test_error_display
    // -----------------------------------------------------------------------

    #[test]
    fn test_error_display() {
        assert_eq!(
            CorralError::no_locks().to_string(),
            "out of memory: cannot allocate lock"
        );
        let err = CorralError::EnqueueAborted {
            reason: "unlink intent".into(),
        };
        assert_eq!(err.to_string(), "enqueue aborted by policy: unlink intent");
    }
}
