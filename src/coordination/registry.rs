//! Shutdown Registry
//!
//! Single source of truth for per-branch shutdown state. Every dependent
//! module reads its branch state from here through the dependent gate, so no
//! module can keep operating on a local flag that diverged from another's.
//!
//! Each branch owns its own locks; the branch set is fixed at construction and
//! no lock spans branches. Transitions are persisted before they are
//! committed in memory. Writers on one branch are serialized by a writer
//! token held across the store write, while the state lock itself is only
//! taken to apply the new state, so readers never wait on storage.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::domain::{BranchId, RecoveryAuthorization, ShutdownCause, ShutdownKind, ShutdownState};
use crate::error::{RegistryError, Result};
use crate::persistence::{MemoryStateStore, PersistedBranchState, StateStore};

/// Configuration for the shutdown registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum time to wait for a branch's write lock before reporting contention
    pub write_timeout_ms: u64,
    /// Maximum time one store write may take before it counts as a storage failure
    pub store_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 500,
            store_timeout_ms: 2000,
        }
    }
}

/// What a temporary trigger did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Branch moved from active into a new shutdown episode
    Entered,
    /// Branch was already in temporary shutdown; cause and timestamp refreshed
    Refreshed,
}

/// Broadcast whenever a branch changes shutdown kind
#[derive(Debug, Clone)]
pub struct ShutdownEvent {
    pub branch: BranchId,
    pub from: ShutdownKind,
    pub to: ShutdownState,
    pub at: DateTime<Utc>,
}

struct BranchSlot {
    state: RwLock<ShutdownState>,
    // Held for a whole transition, store write included
    writer: Mutex<()>,
}

impl BranchSlot {
    fn new() -> Self {
        Self {
            state: RwLock::new(ShutdownState::Active),
            writer: Mutex::new(()),
        }
    }
}

/// Authoritative per-branch shutdown state
pub struct ShutdownRegistry {
    config: RegistryConfig,
    branches: HashMap<BranchId, BranchSlot>,
    store: Arc<dyn StateStore>,
    event_tx: broadcast::Sender<ShutdownEvent>,
}

impl ShutdownRegistry {
    /// Create a registry with every branch active
    pub fn new(
        branches: impl IntoIterator<Item = BranchId>,
        store: Arc<dyn StateStore>,
        config: RegistryConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            branches: branches
                .into_iter()
                .map(|b| (b, BranchSlot::new()))
                .collect(),
            store,
            event_tx,
        }
    }

    /// Registry backed by a process-local store, with default configuration
    pub fn in_memory(branches: impl IntoIterator<Item = BranchId>) -> Self {
        Self::new(
            branches,
            Arc::new(MemoryStateStore::new()),
            RegistryConfig::default(),
        )
    }

    /// Create a registry and reload persisted states before anything else runs
    pub async fn restore(
        branches: impl IntoIterator<Item = BranchId>,
        store: Arc<dyn StateStore>,
        config: RegistryConfig,
    ) -> Result<Self> {
        let registry = Self::new(branches, store, config);
        let records = registry.store.load_all().await?;

        for record in records {
            let Some(slot) = registry.branches.get(&record.branch_id) else {
                warn!(
                    "Ignoring persisted state for unconfigured branch {}",
                    record.branch_id
                );
                continue;
            };
            let state = record.to_state()?;
            if !state.is_active() {
                warn!(
                    branch = %record.branch_id,
                    "Restored shutdown state: {}", state
                );
            }
            *slot.state.write().await = state;
        }

        info!("Shutdown registry restored ({} branches)", registry.branches.len());
        Ok(registry)
    }

    /// Subscribe to shutdown state changes
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownEvent> {
        self.event_tx.subscribe()
    }

    /// All registered branches, sorted
    pub fn branches(&self) -> Vec<BranchId> {
        let mut ids: Vec<BranchId> = self.branches.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, branch: &BranchId) -> bool {
        self.branches.contains_key(branch)
    }

    /// Current shutdown state of a branch
    pub async fn current_state(
        &self,
        branch: &BranchId,
    ) -> std::result::Result<ShutdownState, RegistryError> {
        Ok(self.slot(branch)?.state.read().await.clone())
    }

    /// Consistent per-branch view of every state
    pub async fn snapshot(&self) -> Vec<(BranchId, ShutdownState)> {
        let mut states = Vec::with_capacity(self.branches.len());
        for branch in self.branches() {
            if let Some(slot) = self.branches.get(&branch) {
                let state = slot.state.read().await.clone();
                states.push((branch, state));
            }
        }
        states
    }

    /// Put a branch into temporary shutdown.
    ///
    /// Repeated triggers while already temporary only refresh the cause and
    /// timestamp. Fails with `AlreadyPermanent` once the branch is terminal.
    pub async fn trigger_temporary(
        &self,
        branch: &BranchId,
        cause: ShutdownCause,
    ) -> std::result::Result<TriggerOutcome, RegistryError> {
        let slot = self.slot(branch)?;
        let _writer = self.lock_for_write(branch, slot).await?;

        let current = slot.state.read().await.clone();
        let outcome = match current {
            ShutdownState::PermanentShutdown { .. } => {
                return Err(RegistryError::AlreadyPermanent {
                    branch: branch.clone(),
                })
            }
            ShutdownState::TemporaryShutdown { .. } => TriggerOutcome::Refreshed,
            ShutdownState::Active => TriggerOutcome::Entered,
        };

        let next = ShutdownState::TemporaryShutdown {
            since: Utc::now(),
            cause,
        };
        self.commit(branch, slot, next).await?;

        match outcome {
            TriggerOutcome::Entered => warn!(branch = %branch, "Branch entered TEMPORARY shutdown"),
            TriggerOutcome::Refreshed => debug!(branch = %branch, "Temporary shutdown refreshed"),
        }
        Ok(outcome)
    }

    /// Put a branch into permanent shutdown. Irreversible.
    pub async fn trigger_permanent(
        &self,
        branch: &BranchId,
        cause: ShutdownCause,
    ) -> std::result::Result<(), RegistryError> {
        let slot = self.slot(branch)?;
        let _writer = self.lock_for_write(branch, slot).await?;

        let next = ShutdownState::PermanentShutdown {
            since: Utc::now(),
            cause,
        };
        self.commit(branch, slot, next).await?;

        warn!(branch = %branch, "Branch entered PERMANENT shutdown");
        Ok(())
    }

    /// Clear a temporary shutdown. The only way back to `Active`.
    pub async fn recover(
        &self,
        branch: &BranchId,
        authorization: &RecoveryAuthorization,
    ) -> std::result::Result<(), RegistryError> {
        let slot = self.slot(branch)?;

        if let Some(reason) = authorization.rejection_for(branch) {
            return Err(RegistryError::InvalidAuthorization {
                branch: branch.clone(),
                reason,
            });
        }

        let _writer = self.lock_for_write(branch, slot).await?;
        let current = slot.state.read().await.kind();
        if current != ShutdownKind::Temporary {
            return Err(RegistryError::NotTemporary {
                branch: branch.clone(),
                state: current,
            });
        }

        self.commit(branch, slot, ShutdownState::Active).await?;

        info!(
            branch = %branch,
            operator = %authorization.operator,
            authorization = %authorization.id,
            "Branch recovered to ACTIVE"
        );
        Ok(())
    }

    fn slot(&self, branch: &BranchId) -> std::result::Result<&BranchSlot, RegistryError> {
        self.branches
            .get(branch)
            .ok_or_else(|| RegistryError::UnknownBranch(branch.clone()))
    }

    async fn lock_for_write<'a>(
        &self,
        branch: &BranchId,
        slot: &'a BranchSlot,
    ) -> std::result::Result<MutexGuard<'a, ()>, RegistryError> {
        let timeout = Duration::from_millis(self.config.write_timeout_ms);
        tokio::time::timeout(timeout, slot.writer.lock())
            .await
            .map_err(|_| RegistryError::Contended {
                branch: branch.clone(),
                waited_ms: self.config.write_timeout_ms,
            })
    }

    /// Persist then apply `next`. Caller holds the branch writer token.
    /// On storage failure or timeout the state is unchanged.
    async fn commit(
        &self,
        branch: &BranchId,
        slot: &BranchSlot,
        next: ShutdownState,
    ) -> std::result::Result<(), RegistryError> {
        let from = slot.state.read().await.kind();
        debug_assert!(from.can_transition_to(next.kind()));

        let record = PersistedBranchState::from_state(branch, &next);
        let store_timeout = Duration::from_millis(self.config.store_timeout_ms);
        match tokio::time::timeout(store_timeout, self.store.save(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(RegistryError::Storage {
                    branch: branch.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(RegistryError::Storage {
                    branch: branch.clone(),
                    reason: format!(
                        "store did not answer within {}ms",
                        self.config.store_timeout_ms
                    ),
                })
            }
        }

        *slot.state.write().await = next.clone();

        if from != next.kind() {
            let _ = self.event_tx.send(ShutdownEvent {
                branch: branch.clone(),
                from,
                to: next,
                at: Utc::now(),
            });
        }
        Ok(())
    }
}
