use serde::{Deserialize, Serialize};
use std::fmt;

use super::ShutdownState;

/// Classification of a dependent module's entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Mutates branch state (open, borrow, withdraw, adjust...)
    StateChanging,
    /// Pure read with no side effects
    Read,
    /// Cleanup that is itself part of unwinding (e.g. queued liquidations)
    Unwind,
    /// Not declared by the branch policy
    Unclassified,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::StateChanging => "state_changing",
            OperationKind::Read => "read",
            OperationKind::Unwind => "unwind",
            OperationKind::Unclassified => "unclassified",
        }
    }

    /// Kinds that may be allowlisted while a branch is shut down.
    pub fn is_allowlistable(&self) -> bool {
        matches!(self, OperationKind::Read | OperationKind::Unwind)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why the gate refused an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Branch is not active
    Shutdown(ShutdownState),
    /// Branch is not known to the registry
    UnknownBranch,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Shutdown(state) => write!(f, "{}", state),
            DenyReason::UnknownBranch => write!(f, "unknown branch"),
        }
    }
}

/// Result of a gate check. Computed per call; callers must not cache it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a gate decision that is not inspected does not guard anything"]
pub enum GateDecision {
    Allow,
    Deny { reason: DenyReason },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }

    pub fn is_denied(&self) -> bool {
        !self.is_allowed()
    }
}
