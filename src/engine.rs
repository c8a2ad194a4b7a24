//! Engine assembly
//!
//! Builds the registry, price cache, gate and supervisor from configuration.
//! Persisted shutdown states are restored before the first probe runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::config::{AppConfig, PersistenceConfig};
use crate::coordination::{DependentGate, GuardedPriceReader, ShutdownRegistry};
use crate::domain::BranchId;
use crate::error::{Result, SentinelError};
use crate::oracle::{HealthProbe, HttpPriceSource, PriceCache, PriceSource};
use crate::persistence::{JsonFileStateStore, MemoryStateStore, StateStore};
use crate::supervisor::{OracleSupervisor, SupervisorEvent, SupervisorHandle};

// Lets the probe's own timeout fire first and classify the failure as a timeout
const REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_millis(500);

/// HTTP request timeout for a given probe timeout
pub fn request_timeout(probe_timeout: Duration) -> Duration {
    probe_timeout + REQUEST_TIMEOUT_MARGIN
}

/// Store selected by the persistence section
pub fn open_state_store(config: &PersistenceConfig) -> Arc<dyn StateStore> {
    match &config.state_file {
        Some(path) => Arc::new(JsonFileStateStore::new(path.clone())),
        None => {
            warn!("No persistence.state_file configured; shutdown state will not survive restarts");
            Arc::new(MemoryStateStore::new())
        }
    }
}

/// All shared components for one deployment
pub struct SentinelEngine {
    registry: Arc<ShutdownRegistry>,
    cache: Arc<PriceCache>,
    gate: DependentGate,
    supervisor: Arc<OracleSupervisor>,
}

impl SentinelEngine {
    /// Build from configuration with HTTP sources and the configured store
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let mut sources: HashMap<BranchId, Arc<dyn PriceSource>> = HashMap::new();
        let request_timeout =
            request_timeout(Duration::from_millis(config.supervisor.probe_timeout_ms));

        for branch in &config.branches {
            let source = HttpPriceSource::new(
                branch.source.url.clone(),
                branch.source.price_pointer.clone(),
                branch.source.published_at_pointer.clone(),
                request_timeout,
            )?;
            sources.insert(branch.branch_id(), Arc::new(source));
        }

        Self::with_sources(config, sources, open_state_store(&config.persistence)).await
    }

    /// Build with caller-provided sources and store
    pub async fn with_sources(
        config: &AppConfig,
        mut sources: HashMap<BranchId, Arc<dyn PriceSource>>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate().map_err(SentinelError::InvalidConfig)?;

        let branch_ids = config.branch_ids();
        let registry = Arc::new(
            ShutdownRegistry::restore(
                branch_ids.clone(),
                store,
                config.registry.to_registry_config(),
            )
            .await?,
        );
        let cache = Arc::new(PriceCache::new(branch_ids));

        let policies = config
            .branches
            .iter()
            .map(|b| (b.branch_id(), b.policy.clone()))
            .collect();
        let gate = DependentGate::new(registry.clone(), policies);

        let supervisor_config = config.supervisor.to_supervisor_config();
        let mut probes = HashMap::with_capacity(config.branches.len());
        for branch in &config.branches {
            let id = branch.branch_id();
            let source = sources
                .remove(&id)
                .ok_or_else(|| SentinelError::Internal(format!("no price source for branch {}", id)))?;
            let probe = HealthProbe::new(source, supervisor_config.probe_timeout)
                .with_validation(branch.source.quote_validation());
            probes.insert(id, probe);
        }

        let supervisor = Arc::new(
            OracleSupervisor::new(supervisor_config, registry.clone(), cache.clone(), probes)
                .await?,
        );

        info!("Engine ready ({} branches)", config.branches.len());
        Ok(Self {
            registry,
            cache,
            gate,
            supervisor,
        })
    }

    pub fn registry(&self) -> &Arc<ShutdownRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.cache
    }

    /// Gate handle for dependent modules; clones share counters
    pub fn gate(&self) -> DependentGate {
        self.gate.clone()
    }

    pub fn price_reader(&self) -> GuardedPriceReader {
        GuardedPriceReader::new(self.gate.clone(), self.cache.clone())
    }

    pub fn supervisor(&self) -> &Arc<OracleSupervisor> {
        &self.supervisor
    }

    /// Start probing every branch. Fails if the supervisor is already running.
    pub fn start(&self) -> Result<SupervisorHandle> {
        self.supervisor.start()
    }

    /// Run until SIGINT/SIGTERM, logging shutdown and supervisor events
    pub async fn run_until_signal(&self) -> Result<()> {
        let mut shutdown_events = self.registry.subscribe();
        let mut supervisor_events = self.supervisor.subscribe();
        let handle = self.start()?;

        let signal = wait_for_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                result = &mut signal => {
                    result?;
                    break;
                }
                event = shutdown_events.recv() => match event {
                    Ok(event) => warn!(
                        branch = %event.branch,
                        "Shutdown state changed: {} -> {}", event.from, event.to
                    ),
                    Err(RecvError::Lagged(n)) => warn!("Missed {} shutdown events", n),
                    Err(RecvError::Closed) => break,
                },
                event = supervisor_events.recv() => match event {
                    Ok(SupervisorEvent::OracleFailed { branch, episode, reason, .. }) => error!(
                        branch = %branch,
                        episode = %episode,
                        "Oracle failure, branch halted: {}", reason
                    ),
                    Ok(SupervisorEvent::CommitRetriesExhausted { branch, error }) => error!(
                        branch = %branch,
                        "Oracle failure not yet recorded: {}", error
                    ),
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("Missed {} supervisor events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Stopping engine");
        handle.shutdown().await;
        Ok(())
    }
}

/// Resolve on the first SIGINT or SIGTERM
pub async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
