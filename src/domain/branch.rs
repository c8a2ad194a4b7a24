use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an isolated unit of dependent modules sharing one oracle
/// and one shutdown state (e.g. a single collateral market).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(String);

impl BranchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BranchId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for BranchId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
