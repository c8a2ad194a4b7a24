use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BranchId;

/// Capability handed to the registry when clearing a temporary shutdown.
///
/// The surrounding system decides who may mint one (a governance vote, an
/// operator on call). The registry only checks that the capability is scoped
/// to the branch being recovered and names an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAuthorization {
    pub id: Uuid,
    pub branch: BranchId,
    pub operator: String,
    pub issued_at: DateTime<Utc>,
}

impl RecoveryAuthorization {
    pub fn new(branch: BranchId, operator: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            branch,
            operator: operator.into(),
            issued_at: Utc::now(),
        }
    }

    /// Why this capability cannot recover `branch`, if it cannot.
    pub fn rejection_for(&self, branch: &BranchId) -> Option<String> {
        if &self.branch != branch {
            return Some(format!("authorization is scoped to branch {}", self.branch));
        }
        if self.operator.trim().is_empty() {
            return Some("authorization names no operator".to_string());
        }
        None
    }
}
