//! Namespace capacity configuration.

/// Default lock arena capacity per namespace.
pub const DEFAULT_MAX_LOCKS: usize = 1 << 20;

/// Default resource table capacity per namespace.
pub const DEFAULT_MAX_RESOURCES: usize = 1 << 18;

/// Capacity limits for one namespace.
///
/// Allocation beyond these limits surfaces as the recoverable
/// `CorralError::OutOfMemory`, so callers see a deterministic failure
/// instead of unbounded growth under runaway lock traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlmConfig {
    /// Maximum live locks in the namespace arena.
    pub max_locks: usize,
    /// Maximum live resources in the namespace table.
    pub max_resources: usize,
}

impl Default for DlmConfig {
    fn default() -> Self {
        Self {
            max_locks: DEFAULT_MAX_LOCKS,
            max_resources: DEFAULT_MAX_RESOURCES,
        }
    }
}
