//! Lock modes and the mode-compatibility matrix.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Access mode requested or held by a lock.
///
/// Ordered by restrictiveness: `NL` constrains nothing, `EX` excludes
/// everything but `NL`. The derived `Ord` follows that ordering, so a
/// resource's most-restrictive granted mode is the `max` over its granted
/// queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LockMode {
    /// No lock: placeholder mode, compatible with everything.
    NL,
    /// Concurrent read.
    CR,
    /// Concurrent write.
    CW,
    /// Protected read.
    PR,
    /// Protected write.
    PW,
    /// Exclusive.
    EX,
}

impl LockMode {
    /// All modes, in restrictiveness order.
    pub const ALL: [Self; 6] = [Self::NL, Self::CR, Self::CW, Self::PR, Self::PW, Self::EX];

    /// Bit mask of modes compatible with `self`.
    ///
    /// Bit `i` corresponds to `LockMode::ALL[i]`. The table is the classic
    /// VMS-style DLM matrix; `compatible` checks membership in it.
    const fn compat_bits(self) -> u8 {
        match self {
            Self::NL => 0b11_1111,
            Self::CR => 0b01_1111,
            Self::CW => 0b00_0111,
            Self::PR => 0b00_1011,
            Self::PW => 0b00_0011,
            Self::EX => 0b00_0001,
        }
    }

    /// Whether two locks with these modes may be granted simultaneously.
    ///
    /// Symmetric: `a.compatible(b) == b.compatible(a)` for every pair.
    #[must_use]
    pub const fn compatible(self, other: Self) -> bool {
        self.compat_bits() & (1 << other as u8) != 0
    }

    /// Whether this mode counts as a reader for use-count accounting.
    ///
    /// `NL`, `CR`, and `PR` holders are readers; everything else is a
    /// writer.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::NL | Self::CR | Self::PR)
    }

    /// Two-letter diagnostic name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NL => "NL",
            Self::CR => "CR",
            Self::CW => "CW",
            Self::PR => "PR",
            Self::PW => "PW",
            Self::EX => "EX",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
