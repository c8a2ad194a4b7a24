//! Dependent Gate
//!
//! Every dependent module's state-changing entry point passes through here
//! before it executes. The gate reads the registry on every call and fails
//! closed: anything not explicitly allowed while a branch is shut down is
//! denied, and so is any branch the registry does not know.

use chrono::Duration;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::registry::ShutdownRegistry;
use crate::domain::{BranchId, DenyReason, GateDecision, OperationKind, ShutdownState};
use crate::error::{GateDenied, Result, SentinelError};
use crate::oracle::{FrozenPrice, PriceCache};

/// Per-branch policy for operations during shutdown
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatePolicy {
    /// Kinds still allowed while in temporary shutdown
    #[serde(default)]
    pub allow_during_temporary: BTreeSet<OperationKind>,
    /// Kinds still allowed while in permanent shutdown
    #[serde(default)]
    pub allow_during_permanent: BTreeSet<OperationKind>,
    /// Named entry points and their classification
    #[serde(default)]
    pub operations: HashMap<String, OperationKind>,
}

impl GatePolicy {
    /// Policy allowing reads and unwinds during temporary shutdown and reads
    /// during permanent shutdown
    pub fn reads_and_unwind() -> Self {
        Self {
            allow_during_temporary: [OperationKind::Read, OperationKind::Unwind]
                .into_iter()
                .collect(),
            allow_during_permanent: [OperationKind::Read].into_iter().collect(),
            operations: HashMap::new(),
        }
    }

    pub fn with_operation(mut self, name: impl Into<String>, kind: OperationKind) -> Self {
        self.operations.insert(name.into(), kind);
        self
    }

    /// Classification of a named operation; unknown names are unclassified
    pub fn classify(&self, name: &str) -> OperationKind {
        self.operations
            .get(name)
            .copied()
            .unwrap_or(OperationKind::Unclassified)
    }

    fn allows(&self, state: &ShutdownState, kind: OperationKind) -> bool {
        // State-changing and unclassified kinds are never allowlisted
        if !kind.is_allowlistable() {
            return state.is_active();
        }
        match state {
            ShutdownState::Active => true,
            ShutdownState::TemporaryShutdown { .. } => self.allow_during_temporary.contains(&kind),
            ShutdownState::PermanentShutdown { .. } => self.allow_during_permanent.contains(&kind),
        }
    }

    /// Problems with this policy, if any
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for kind in self
            .allow_during_temporary
            .iter()
            .chain(self.allow_during_permanent.iter())
        {
            if !kind.is_allowlistable() {
                errors.push(format!("{} operations cannot be allowlisted", kind));
            }
        }
        errors
    }
}

/// Gate counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub allowed: u64,
    pub denied: u64,
}

#[derive(Debug, Default)]
struct GateCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
}

/// Guard consulted by dependent modules.
///
/// Cloning is cheap; every clone reads the same registry, so two modules
/// holding separate gates always observe the same branch state.
#[derive(Clone)]
pub struct DependentGate {
    registry: Arc<ShutdownRegistry>,
    policies: Arc<HashMap<BranchId, GatePolicy>>,
    counters: Arc<GateCounters>,
}

impl DependentGate {
    pub fn new(registry: Arc<ShutdownRegistry>, policies: HashMap<BranchId, GatePolicy>) -> Self {
        Self {
            registry,
            policies: Arc::new(policies),
            counters: Arc::new(GateCounters::default()),
        }
    }

    /// Gate with the default (strictest) policy on every branch
    pub fn strict(registry: Arc<ShutdownRegistry>) -> Self {
        Self::new(registry, HashMap::new())
    }

    pub fn registry(&self) -> &Arc<ShutdownRegistry> {
        &self.registry
    }

    /// Decide whether `operation` may run on `branch` right now
    pub async fn check(&self, branch: &BranchId, operation: OperationKind) -> GateDecision {
        let state = match self.registry.current_state(branch).await {
            Ok(state) => state,
            // The registry only fails reads for branches it was not built with
            Err(e) => {
                warn!(branch = %branch, "Denying {} operation: {}", operation, e);
                return self.deny(DenyReason::UnknownBranch);
            }
        };

        let policy = self.policies.get(branch);
        let allowed = match policy {
            Some(policy) => policy.allows(&state, operation),
            None => GatePolicy::default().allows(&state, operation),
        };

        if allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
            debug!(branch = %branch, "Allowed {} operation ({})", operation, state.kind());
            GateDecision::Allow
        } else {
            debug!(branch = %branch, "Denied {} operation: {}", operation, state);
            self.deny(DenyReason::Shutdown(state))
        }
    }

    /// Check a named entry point, classified by the branch policy
    pub async fn check_named(&self, branch: &BranchId, name: &str) -> GateDecision {
        self.check(branch, self.classify(branch, name)).await
    }

    pub fn classify(&self, branch: &BranchId, name: &str) -> OperationKind {
        self.policies
            .get(branch)
            .map(|p| p.classify(name))
            .unwrap_or(OperationKind::Unclassified)
    }

    /// `check` as a `Result`, for `?` at the top of an entry point
    pub async fn guard(
        &self,
        branch: &BranchId,
        operation: OperationKind,
    ) -> std::result::Result<(), GateDenied> {
        match self.check(branch, operation).await {
            GateDecision::Allow => Ok(()),
            GateDecision::Deny { reason } => Err(GateDenied {
                branch: branch.clone(),
                operation,
                reason,
            }),
        }
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
        }
    }

    fn deny(&self, reason: DenyReason) -> GateDecision {
        self.counters.denied.fetch_add(1, Ordering::Relaxed);
        GateDecision::Deny { reason }
    }
}

/// Price consumer that only reads the cache after passing the gate
#[derive(Clone)]
pub struct GuardedPriceReader {
    gate: DependentGate,
    cache: Arc<PriceCache>,
}

impl GuardedPriceReader {
    pub fn new(gate: DependentGate, cache: Arc<PriceCache>) -> Self {
        Self { gate, cache }
    }

    /// Gate check, then cache read, then optional staleness ceiling
    pub async fn price(
        &self,
        branch: &BranchId,
        operation: OperationKind,
        max_age: Option<Duration>,
    ) -> Result<FrozenPrice> {
        self.gate.guard(branch, operation).await?;

        let frozen = self
            .cache
            .read(branch)
            .await
            .ok_or_else(|| SentinelError::PriceUnavailable(branch.clone()))?;

        if let Some(max_age) = max_age {
            frozen.ensure_fresh(max_age)?;
        }
        Ok(frozen)
    }
}
