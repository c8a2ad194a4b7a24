use thiserror::Error;

use crate::domain::{BranchId, DenyReason, OperationKind, ShutdownKind};

/// Main error type for the sentinel engine
#[derive(Error, Debug)]
pub enum SentinelError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Shutdown state errors
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    GateDenied(#[from] GateDenied),

    #[error("Unknown branch: {0}")]
    UnknownBranch(BranchId),

    // Price data errors
    #[error("No price recorded for branch {0}")]
    PriceUnavailable(BranchId),

    #[error("Stale data: {0}")]
    StaleData(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SentinelError
pub type Result<T> = std::result::Result<T, SentinelError>;

/// Reasons a single probe attempt did not produce a usable price.
///
/// These are steady-state events: they drive the supervisor's state machine
/// and are never propagated as crashes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("Timeout after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Stale quote: published {age_secs}s ago")]
    Stale { age_secs: i64 },
}

/// Illegal or failed shutdown state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Branch {branch} is permanently shut down")]
    AlreadyPermanent { branch: BranchId },

    #[error("Branch {branch} is {state}, not in temporary shutdown")]
    NotTemporary { branch: BranchId, state: ShutdownKind },

    #[error("Invalid authorization for branch {branch}: {reason}")]
    InvalidAuthorization { branch: BranchId, reason: String },

    #[error("Unknown branch: {0}")]
    UnknownBranch(BranchId),

    #[error("Write lock on branch {branch} contended for {waited_ms}ms")]
    Contended { branch: BranchId, waited_ms: u64 },

    #[error("Failed to persist state for branch {branch}: {reason}")]
    Storage { branch: BranchId, reason: String },
}

impl RegistryError {
    /// Transient failures that may succeed if the write is attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RegistryError::Contended { .. } | RegistryError::Storage { .. }
        )
    }
}

/// Rejection returned to a dependent module's caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} operation on branch {branch} denied: {reason}")]
pub struct GateDenied {
    pub branch: BranchId,
    pub operation: OperationKind,
    pub reason: DenyReason,
}

impl GateDenied {
    /// Permanent shutdown: the caller must not retry.
    pub fn is_terminal(&self) -> bool {
        match &self.reason {
            DenyReason::Shutdown(state) => state.is_permanent(),
            DenyReason::UnknownBranch => true,
        }
    }

    /// Temporary shutdown: the operation may succeed after recovery.
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }
}
