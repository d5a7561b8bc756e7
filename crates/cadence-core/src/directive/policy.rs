//! Blocking and cancel policies.

use std::collections::BTreeSet;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::NamespaceAndName;

bitflags! {
    /// Coarse conflict domains. `ANY` covers every medium, so it intersects
    /// (and therefore conflicts with) everything.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Medium: u8 {
        const AUDIO = 1;
        const VISUAL = 1 << 1;
        const ANY = Self::AUDIO.bits() | Self::VISUAL.bits();
    }
}

/// How a directive interacts with other tracked directives.
///
/// - `blocked_by`: mediums that must be free before this directive runs.
/// - `blocking`: mediums this directive holds while it is tracked.
///
/// An empty set means "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockingPolicy {
    blocked_by: Medium,
    blocking: Medium,
}

impl BlockingPolicy {
    pub const fn new(blocked_by: Medium, blocking: Medium) -> Self {
        Self {
            blocked_by,
            blocking,
        }
    }

    /// Neither blocked nor blocking.
    pub const fn non_blocking() -> Self {
        Self::new(Medium::empty(), Medium::empty())
    }

    pub const fn blocked_by(&self) -> Medium {
        self.blocked_by
    }

    pub const fn blocking(&self) -> Medium {
        self.blocking
    }

    /// Whether a directive with this policy must wait for one holding `other`.
    pub fn is_blocked_by(&self, other: &Self) -> bool {
        self.blocked_by.intersects(other.blocking)
    }
}

impl Default for BlockingPolicy {
    fn default() -> Self {
        Self::non_blocking()
    }
}

/// Blast radius of a directive failure within its dialog turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelPolicy {
    cancel_all: bool,
    partial_targets: BTreeSet<NamespaceAndName>,
}

impl CancelPolicy {
    /// Cancel every other directive of the dialog turn.
    pub const fn all() -> Self {
        Self {
            cancel_all: true,
            partial_targets: BTreeSet::new(),
        }
    }

    /// Cancel nothing else.
    pub const fn none() -> Self {
        Self {
            cancel_all: false,
            partial_targets: BTreeSet::new(),
        }
    }

    /// Cancel only the named directives of the dialog turn.
    pub fn partial(targets: impl IntoIterator<Item = NamespaceAndName>) -> Self {
        Self {
            cancel_all: false,
            partial_targets: targets.into_iter().collect(),
        }
    }

    pub const fn cancel_all(&self) -> bool {
        self.cancel_all
    }

    pub const fn partial_targets(&self) -> &BTreeSet<NamespaceAndName> {
        &self.partial_targets
    }

    /// Whether a sibling directive with this key must be cancelled.
    pub fn covers(&self, key: &NamespaceAndName) -> bool {
        self.cancel_all || self.partial_targets.contains(key)
    }
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self::all()
    }
}
