//! Operator commands acting on the persisted state file.
//!
//! These build a registry straight from the store, so they are meant for a
//! stopped engine: a running engine only reads the file at startup.

use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use tabled::Tabled;

use super::output::{print_items, OutputMode};
use crate::config::AppConfig;
use crate::coordination::{ShutdownRegistry, TriggerOutcome};
use crate::domain::{BranchId, RecoveryAuthorization, ShutdownCause, ShutdownState};
use crate::persistence::JsonFileStateStore;

#[derive(Debug, Tabled, Serialize)]
pub struct StatusRow {
    pub branch: String,
    pub state: String,
    pub cause: String,
    pub since: String,
}

impl StatusRow {
    pub fn new(branch: &BranchId, state: &ShutdownState) -> Self {
        Self {
            branch: branch.to_string(),
            state: state.kind().to_string(),
            cause: state.cause().map(|c| c.to_string()).unwrap_or_default(),
            since: state.since().map(|t| t.to_rfc3339()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Tabled, Serialize)]
pub struct BranchRow {
    pub branch: String,
    pub source: String,
    pub during_temporary: String,
    pub during_permanent: String,
    pub named_operations: usize,
}

async fn open_registry(config: &AppConfig) -> anyhow::Result<ShutdownRegistry> {
    let path = config
        .persistence
        .state_file
        .as_ref()
        .context("persistence.state_file is not configured")?;
    let store = Arc::new(JsonFileStateStore::new(path.clone()));
    let registry = ShutdownRegistry::restore(
        config.branch_ids(),
        store,
        config.registry.to_registry_config(),
    )
    .await
    .with_context(|| format!("loading shutdown state from {}", path.display()))?;
    Ok(registry)
}

pub async fn show_status(config: &AppConfig, mode: OutputMode) -> anyhow::Result<()> {
    let registry = open_registry(config).await?;
    let rows: Vec<StatusRow> = registry
        .snapshot()
        .await
        .iter()
        .map(|(branch, state)| StatusRow::new(branch, state))
        .collect();
    print_items(&rows, mode)
}

pub async fn recover(config: &AppConfig, branch: &str, operator: &str) -> anyhow::Result<()> {
    let registry = open_registry(config).await?;
    let branch = BranchId::new(branch);
    let auth = RecoveryAuthorization::new(branch.clone(), operator);

    registry.recover(&branch, &auth).await?;
    println!("Branch {} recovered (authorization {})", branch, auth.id);
    Ok(())
}

pub async fn halt(config: &AppConfig, branch: &str, reason: &str) -> anyhow::Result<()> {
    let registry = open_registry(config).await?;
    let branch = BranchId::new(branch);

    registry
        .trigger_permanent(&branch, ShutdownCause::Governance(reason.to_string()))
        .await?;
    println!("Branch {} permanently shut down", branch);
    Ok(())
}

pub async fn trip(config: &AppConfig, branch: &str, reason: &str) -> anyhow::Result<()> {
    let registry = open_registry(config).await?;
    let branch = BranchId::new(branch);

    let outcome = registry
        .trigger_temporary(&branch, ShutdownCause::Governance(reason.to_string()))
        .await?;
    match outcome {
        TriggerOutcome::Entered => println!("Branch {} in temporary shutdown", branch),
        TriggerOutcome::Refreshed => {
            println!("Branch {} was already in temporary shutdown; cause updated", branch)
        }
    }
    Ok(())
}

pub fn check_config(config: &AppConfig, mode: OutputMode) -> anyhow::Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("  - {}", e);
        }
        anyhow::bail!("configuration has {} problem(s)", errors.len());
    }

    let join = |kinds: &std::collections::BTreeSet<crate::domain::OperationKind>| {
        kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",")
    };
    let rows: Vec<BranchRow> = config
        .branches
        .iter()
        .map(|b| BranchRow {
            branch: b.id.clone(),
            source: b.source.url.clone(),
            during_temporary: join(&b.policy.allow_during_temporary),
            during_permanent: join(&b.policy.allow_during_permanent),
            named_operations: b.policy.operations.len(),
        })
        .collect();
    print_items(&rows, mode)
}
