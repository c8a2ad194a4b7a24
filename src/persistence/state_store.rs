//! Shutdown State Store
//!
//! Persists the `(branch_id, state, cause, since)` tuple for every branch so a
//! restarted engine resumes with the same shutdown states before any probe
//! runs. Records are written before a transition is committed in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{BranchId, ShutdownCause, ShutdownKind, ShutdownState};
use crate::error::{Result, SentinelError};

/// Persisted layout of one branch's shutdown state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBranchState {
    pub branch_id: BranchId,
    pub state: ShutdownKind,
    #[serde(default)]
    pub cause: Option<ShutdownCause>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

impl PersistedBranchState {
    pub fn from_state(branch_id: &BranchId, state: &ShutdownState) -> Self {
        Self {
            branch_id: branch_id.clone(),
            state: state.kind(),
            cause: state.cause().cloned(),
            since: state.since(),
        }
    }

    /// Rebuild the in-memory state, rejecting records that lost their payload.
    pub fn to_state(&self) -> Result<ShutdownState> {
        match self.state {
            ShutdownKind::Active => Ok(ShutdownState::Active),
            ShutdownKind::Temporary | ShutdownKind::Permanent => {
                let (since, cause) = match (self.since, self.cause.clone()) {
                    (Some(since), Some(cause)) => (since, cause),
                    _ => {
                        return Err(SentinelError::Persistence(format!(
                            "{} record for branch {} is missing cause or since",
                            self.state, self.branch_id
                        )))
                    }
                };
                Ok(if self.state == ShutdownKind::Temporary {
                    ShutdownState::TemporaryShutdown { since, cause }
                } else {
                    ShutdownState::PermanentShutdown { since, cause }
                })
            }
        }
    }
}

/// Backing store for shutdown states
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load every persisted record
    async fn load_all(&self) -> Result<Vec<PersistedBranchState>>;

    /// Insert or replace the record for `record.branch_id`
    async fn save(&self, record: &PersistedBranchState) -> Result<()>;
}

/// Process-local store. State does not survive restarts.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<BranchId, PersistedBranchState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_all(&self) -> Result<Vec<PersistedBranchState>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn save(&self, record: &PersistedBranchState) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.branch_id.clone(), record.clone());
        Ok(())
    }
}

/// JSON document holding all branches; rewritten atomically on each save.
#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_records(&self) -> Result<BTreeMap<BranchId, PersistedBranchState>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(BTreeMap::new());
        }

        let records: Vec<PersistedBranchState> = serde_json::from_slice(&raw)?;
        Ok(records
            .into_iter()
            .map(|r| (r.branch_id.clone(), r))
            .collect())
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load_all(&self) -> Result<Vec<PersistedBranchState>> {
        Ok(self.read_records().await?.into_values().collect())
    }

    async fn save(&self, record: &PersistedBranchState) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.read_records().await?;
        records.insert(record.branch_id.clone(), record.clone());
        let body = serde_json::to_vec_pretty(&records.into_values().collect::<Vec<_>>())?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            "Persisted {} state for branch {} to {}",
            record.state,
            record.branch_id,
            self.path.display()
        );
        Ok(())
    }
}
