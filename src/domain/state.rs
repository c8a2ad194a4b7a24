use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a branch left the active state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum ShutdownCause {
    /// The branch's price oracle failed a probe
    OracleFailure,
    /// Governance or operator decision
    Governance(String),
    /// Raised by an embedding system for its own reasons
    External(String),
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::OracleFailure => write!(f, "oracle failure"),
            ShutdownCause::Governance(reason) => write!(f, "governance: {}", reason),
            ShutdownCause::External(reason) => write!(f, "external: {}", reason),
        }
    }
}

/// Severity level of a shutdown state, without its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownKind {
    Active,
    Temporary,
    Permanent,
}

impl ShutdownKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownKind::Active => "active",
            ShutdownKind::Temporary => "temporary",
            ShutdownKind::Permanent => "permanent",
        }
    }

    /// Check if this state can transition to another state.
    ///
    /// Severity only ever increases, except for `Temporary -> Active` which is
    /// reserved for an authorized recovery.
    pub fn can_transition_to(&self, target: ShutdownKind) -> bool {
        use ShutdownKind::*;

        match (self, target) {
            (Active, Temporary) => true,
            (Active, Permanent) => true,

            // Refresh of an ongoing episode
            (Temporary, Temporary) => true,
            (Temporary, Permanent) => true,
            // Recovery only
            (Temporary, Active) => true,

            // Re-stamping an already terminal state
            (Permanent, Permanent) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<ShutdownKind> {
        use ShutdownKind::*;

        match self {
            Active => vec![Temporary, Permanent],
            Temporary => vec![Temporary, Permanent, Active],
            Permanent => vec![Permanent],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShutdownKind::Permanent)
    }
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-branch shutdown state, owned by the shutdown registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ShutdownState {
    Active,
    TemporaryShutdown {
        since: DateTime<Utc>,
        cause: ShutdownCause,
    },
    PermanentShutdown {
        since: DateTime<Utc>,
        cause: ShutdownCause,
    },
}

impl Default for ShutdownState {
    fn default() -> Self {
        ShutdownState::Active
    }
}

impl ShutdownState {
    pub fn kind(&self) -> ShutdownKind {
        match self {
            ShutdownState::Active => ShutdownKind::Active,
            ShutdownState::TemporaryShutdown { .. } => ShutdownKind::Temporary,
            ShutdownState::PermanentShutdown { .. } => ShutdownKind::Permanent,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ShutdownState::Active)
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, ShutdownState::TemporaryShutdown { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ShutdownState::PermanentShutdown { .. })
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            ShutdownState::Active => None,
            ShutdownState::TemporaryShutdown { since, .. }
            | ShutdownState::PermanentShutdown { since, .. } => Some(*since),
        }
    }

    pub fn cause(&self) -> Option<&ShutdownCause> {
        match self {
            ShutdownState::Active => None,
            ShutdownState::TemporaryShutdown { cause, .. }
            | ShutdownState::PermanentShutdown { cause, .. } => Some(cause),
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownState::Active => write!(f, "active"),
            ShutdownState::TemporaryShutdown { since, cause } => {
                write!(f, "temporary shutdown since {} ({})", since.to_rfc3339(), cause)
            }
            ShutdownState::PermanentShutdown { since, cause } => {
                write!(f, "permanent shutdown since {} ({})", since.to_rfc3339(), cause)
            }
        }
    }
}
