//! Oracle Supervisor
//!
//! Drives each branch through `Polling -> Disabling -> Disabled`: probes the
//! oracle, feeds healthy readings to the price cache and turns failed
//! readings into a temporary shutdown in the registry. It never clears a
//! shutdown on its own; recovery is an explicit operator action. Once the
//! registry reports a branch recovered, probing on it resumes.
//!
//! One worker task per branch. Probes run without any registry lock held;
//! the registry lock is taken only to commit an already-resolved reading.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coordination::{ShutdownEvent, ShutdownRegistry, TriggerOutcome};
use crate::domain::{BranchId, FailedReading, OracleReading, ShutdownCause, ShutdownKind};
use crate::error::{ProbeFailure, RegistryError, Result, SentinelError};
use crate::oracle::{HealthProbe, PriceCache};

/// Backoff schedule for registry writes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per cycle, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Configuration for the oracle supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between probes of one branch (default: 5s)
    pub poll_interval: Duration,
    /// Upper bound on a single probe (default: 2s)
    pub probe_timeout: Duration,
    /// Retry schedule for committing a failure to the registry
    pub write_retry: RetryPolicy,
    /// A last good price older than this is not used for the deviation check
    pub reference_max_age: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            write_retry: RetryPolicy::default(),
            reference_max_age: Duration::from_secs(30),
        }
    }
}

/// Probing state of a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeMode {
    /// Probing on every tick
    Polling,
    /// A failed reading has not been committed to the registry yet
    Disabling { pending: FailedReading },
    /// Probing stopped until re-enabled
    Disabled,
}

impl std::fmt::Display for ProbeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeMode::Polling => write!(f, "polling"),
            ProbeMode::Disabling { .. } => write!(f, "disabling"),
            ProbeMode::Disabled => write!(f, "disabled"),
        }
    }
}

/// How a failed reading landed in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCommit {
    /// Started a new shutdown episode
    Entered,
    /// Branch was already in temporary shutdown
    Refreshed,
    /// Branch was already permanently shut down
    AlreadyPermanent,
}

/// Result of one supervisor cycle on one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Healthy { value: Decimal, accepted: bool },
    Failed { reason: ProbeFailure, commit: FailureCommit },
    /// Branch is disabled; nothing was probed
    Skipped,
}

/// Notifications emitted by the supervisor
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Oracle failure that opened a new shutdown episode. Emitted once per episode.
    OracleFailed {
        branch: BranchId,
        episode: Uuid,
        reason: ProbeFailure,
        at: DateTime<Utc>,
    },
    /// Probing stopped for a branch
    ProbingDisabled { branch: BranchId },
    /// Probing resumed by an external action
    ProbingReenabled { branch: BranchId },
    /// A failure could not be committed this cycle; retried next cycle
    CommitRetriesExhausted {
        branch: BranchId,
        error: RegistryError,
    },
}

/// Per-branch statistics for monitoring
#[derive(Debug, Clone)]
pub struct BranchStats {
    pub branch: BranchId,
    pub mode: ProbeMode,
    pub polls: u64,
    pub healthy: u64,
    pub failed: u64,
    pub rejected_records: u64,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub episode: Option<Uuid>,
}

#[derive(Debug, Default)]
struct BranchCounters {
    polls: AtomicU64,
    healthy: AtomicU64,
    failed: AtomicU64,
    rejected_records: AtomicU64,
}

struct BranchWorker {
    probe: HealthProbe,
    mode: watch::Sender<ProbeMode>,
    counters: BranchCounters,
    last_reading_at: Mutex<Option<DateTime<Utc>>>,
    episode: Mutex<Option<Uuid>>,
    // Next probe runs without a deviation reference
    discard_reference: AtomicBool,
    // Serializes cycles on one branch
    cycle: Mutex<()>,
}

/// Orchestrates probe -> cache -> registry for every branch
pub struct OracleSupervisor {
    config: SupervisorConfig,
    registry: Arc<ShutdownRegistry>,
    cache: Arc<PriceCache>,
    workers: HashMap<BranchId, BranchWorker>,
    event_tx: broadcast::Sender<SupervisorEvent>,
    started: AtomicBool,
}

impl OracleSupervisor {
    /// Create a supervisor for the given probes.
    ///
    /// Branches the registry already holds in shutdown (e.g. restored from
    /// storage) start disabled.
    pub async fn new(
        config: SupervisorConfig,
        registry: Arc<ShutdownRegistry>,
        cache: Arc<PriceCache>,
        probes: HashMap<BranchId, HealthProbe>,
    ) -> Result<Self> {
        let mut workers = HashMap::with_capacity(probes.len());

        for (branch, probe) in probes {
            let state = registry.current_state(&branch).await?;
            let mode = if state.is_active() {
                ProbeMode::Polling
            } else {
                info!(branch = %branch, "Branch starts with probing disabled ({})", state);
                ProbeMode::Disabled
            };
            let (mode_tx, _) = watch::channel(mode);

            workers.insert(
                branch,
                BranchWorker {
                    probe,
                    mode: mode_tx,
                    counters: BranchCounters::default(),
                    last_reading_at: Mutex::new(None),
                    episode: Mutex::new(None),
                    discard_reference: AtomicBool::new(false),
                    cycle: Mutex::new(()),
                },
            );
        }

        let (event_tx, _) = broadcast::channel(64);
        Ok(Self {
            config,
            registry,
            cache,
            workers,
            event_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Subscribe to supervisor events
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }

    pub fn branches(&self) -> Vec<BranchId> {
        let mut ids: Vec<BranchId> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn mode(&self, branch: &BranchId) -> Option<ProbeMode> {
        self.workers.get(branch).map(|w| w.mode.borrow().clone())
    }

    /// Run one cycle on one branch
    pub async fn poll_once(&self, branch: &BranchId) -> Result<CycleOutcome> {
        let worker = self.worker(branch)?;
        let _cycle = worker.cycle.lock().await;

        let mode = worker.mode.borrow().clone();
        match mode {
            ProbeMode::Disabled => {
                if !self.resume_if_recovered(branch, worker).await? {
                    return Ok(CycleOutcome::Skipped);
                }
            }
            ProbeMode::Disabling { pending } => {
                // Unresolved failure: commit it before anything else
                debug!(branch = %branch, "Retrying commit of pending failure");
                let commit = self.commit_failure(branch, worker, &pending).await?;
                return Ok(CycleOutcome::Failed {
                    reason: pending.reason,
                    commit,
                });
            }
            ProbeMode::Polling => {}
        }

        worker.counters.polls.fetch_add(1, Ordering::Relaxed);
        let reference = self.deviation_reference(branch, worker).await;
        let reading = worker.probe.probe(reference).await;
        *worker.last_reading_at.lock().await = Some(reading.observed_at());

        match reading {
            OracleReading::Healthy(healthy) => {
                worker.counters.healthy.fetch_add(1, Ordering::Relaxed);
                let accepted = self.cache.record(branch, &healthy).await;
                if !accepted {
                    worker.counters.rejected_records.fetch_add(1, Ordering::Relaxed);
                }
                debug!(branch = %branch, "Healthy price {}", healthy.value);
                Ok(CycleOutcome::Healthy {
                    value: healthy.value,
                    accepted,
                })
            }
            OracleReading::Failed(failed) => {
                worker.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(branch = %branch, "Oracle probe failed: {}", failed.reason);

                worker.mode.send_replace(ProbeMode::Disabling {
                    pending: failed.clone(),
                });
                let commit = self.commit_failure(branch, worker, &failed).await?;
                Ok(CycleOutcome::Failed {
                    reason: failed.reason,
                    commit,
                })
            }
        }
    }

    /// Commit a failed reading as a temporary shutdown, retrying transient
    /// registry errors with backoff. Leaves the branch `Disabling` if the
    /// retries run out.
    async fn commit_failure(
        &self,
        branch: &BranchId,
        worker: &BranchWorker,
        failed: &FailedReading,
    ) -> Result<FailureCommit> {
        let policy = &self.config.write_retry;
        let mut attempt = 0;

        let commit = loop {
            attempt += 1;
            match self
                .registry
                .trigger_temporary(branch, ShutdownCause::OracleFailure)
                .await
            {
                Ok(TriggerOutcome::Entered) => {
                    let episode = Uuid::new_v4();
                    *worker.episode.lock().await = Some(episode);
                    let _ = self.event_tx.send(SupervisorEvent::OracleFailed {
                        branch: branch.clone(),
                        episode,
                        reason: failed.reason.clone(),
                        at: failed.observed_at,
                    });
                    break FailureCommit::Entered;
                }
                Ok(TriggerOutcome::Refreshed) => break FailureCommit::Refreshed,
                Err(RegistryError::AlreadyPermanent { .. }) => {
                    break FailureCommit::AlreadyPermanent
                }
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        branch = %branch,
                        "Registry write failed (attempt {}/{}): {}, retrying in {:?}",
                        attempt, policy.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        branch = %branch,
                        "Could not commit oracle failure after {} attempts: {}", attempt, e
                    );
                    let _ = self.event_tx.send(SupervisorEvent::CommitRetriesExhausted {
                        branch: branch.clone(),
                        error: e.clone(),
                    });
                    return Err(e.into());
                }
            }
        };

        worker.mode.send_replace(ProbeMode::Disabled);
        let _ = self.event_tx.send(SupervisorEvent::ProbingDisabled {
            branch: branch.clone(),
        });
        info!(branch = %branch, "Probing disabled until re-enabled");
        Ok(commit)
    }

    /// Resume probing a disabled branch.
    ///
    /// Does not touch the shutdown state: a branch in temporary shutdown
    /// stays there until it is recovered through the registry.
    pub async fn reenable(&self, branch: &BranchId) -> Result<()> {
        let worker = self.worker(branch)?;
        let _cycle = worker.cycle.lock().await;

        if self.registry.current_state(branch).await?.is_permanent() {
            return Err(RegistryError::AlreadyPermanent {
                branch: branch.clone(),
            }
            .into());
        }

        let mode = worker.mode.borrow().clone();
        match mode {
            ProbeMode::Polling => Ok(()),
            ProbeMode::Disabling { .. } => Err(SentinelError::InvalidState(format!(
                "branch {} has an uncommitted oracle failure",
                branch
            ))),
            ProbeMode::Disabled => {
                self.resume(branch, worker);
                info!(branch = %branch, "Probing re-enabled");
                Ok(())
            }
        }
    }

    /// Last good price for the deviation check, if it is recent enough.
    ///
    /// The first probe after probing resumes runs without one, so a price
    /// that moved during an outage can become healthy again.
    async fn deviation_reference(
        &self,
        branch: &BranchId,
        worker: &BranchWorker,
    ) -> Option<Decimal> {
        if worker.discard_reference.swap(false, Ordering::AcqRel) {
            return None;
        }
        let cached = self.cache.get(branch).await?;
        let fresh = match Utc::now().signed_duration_since(cached.last_good_at).to_std() {
            Ok(age) => age <= self.config.reference_max_age,
            // Recorded slightly ahead of our clock
            Err(_) => true,
        };
        if !fresh {
            debug!(branch = %branch, "Last good price too old for the deviation check");
        }
        fresh.then_some(cached.last_good_value)
    }

    fn resume(&self, branch: &BranchId, worker: &BranchWorker) {
        worker.discard_reference.store(true, Ordering::Release);
        worker.mode.send_replace(ProbeMode::Polling);
        let _ = self.event_tx.send(SupervisorEvent::ProbingReenabled {
            branch: branch.clone(),
        });
    }

    /// Move a disabled branch back to polling once the registry holds it
    /// active again. Caller holds the branch cycle lock.
    async fn resume_if_recovered(
        &self,
        branch: &BranchId,
        worker: &BranchWorker,
    ) -> Result<bool> {
        if !matches!(*worker.mode.borrow(), ProbeMode::Disabled) {
            return Ok(false);
        }
        if !self.registry.current_state(branch).await?.is_active() {
            return Ok(false);
        }
        self.resume(branch, worker);
        info!(branch = %branch, "Branch recovered, probing resumed");
        Ok(true)
    }

    async fn resume_after_recovery(&self, branch: &BranchId) {
        let Some(worker) = self.workers.get(branch) else {
            return;
        };
        let _cycle = worker.cycle.lock().await;
        if let Err(e) = self.resume_if_recovered(branch, worker).await {
            warn!(branch = %branch, "Could not check recovery: {}", e);
        }
    }

    /// Resume every disabled branch the registry reports recovered
    async fn watch_recoveries(&self, mut events: broadcast::Receiver<ShutdownEvent>) {
        // Recoveries that happened before the subscription
        for branch in self.branches() {
            self.resume_after_recovery(&branch).await;
        }

        loop {
            match events.recv().await {
                Ok(event) if event.from == ShutdownKind::Temporary && event.to.is_active() => {
                    self.resume_after_recovery(&event.branch).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("Missed {} shutdown events, rechecking every branch", n);
                    for branch in self.branches() {
                        self.resume_after_recovery(&branch).await;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    pub async fn stats(&self, branch: &BranchId) -> Option<BranchStats> {
        let worker = self.workers.get(branch)?;
        let mode = worker.mode.borrow().clone();
        Some(BranchStats {
            branch: branch.clone(),
            mode,
            polls: worker.counters.polls.load(Ordering::Relaxed),
            healthy: worker.counters.healthy.load(Ordering::Relaxed),
            failed: worker.counters.failed.load(Ordering::Relaxed),
            rejected_records: worker.counters.rejected_records.load(Ordering::Relaxed),
            last_reading_at: *worker.last_reading_at.lock().await,
            episode: *worker.episode.lock().await,
        })
    }

    /// Spawn one polling task per branch plus a task resuming recovered
    /// branches. Fails while a previous handle is still running.
    pub fn start(self: &Arc<Self>) -> Result<SupervisorHandle> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SentinelError::InvalidState(
                "oracle supervisor already started".to_string(),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.workers.len() + 1);

        {
            let supervisor = Arc::clone(self);
            let events = self.registry.subscribe();
            let mut stop_rx = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = supervisor.watch_recoveries(events) => {}
                    _ = stop_rx.changed() => {}
                }
            }));
        }

        for (branch, worker) in &self.workers {
            let supervisor = Arc::clone(self);
            let branch = branch.clone();
            let mut mode_rx = worker.mode.subscribe();
            let mut stop_rx = stop_rx.clone();

            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(supervisor.config.poll_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    let disabled = matches!(*mode_rx.borrow_and_update(), ProbeMode::Disabled);
                    if disabled {
                        tokio::select! {
                            changed = mode_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                                continue;
                            }
                            _ = stop_rx.changed() => break,
                        }
                    }

                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = supervisor.poll_once(&branch).await {
                                warn!(branch = %branch, "Supervisor cycle failed: {}", e);
                            }
                        }
                        _ = stop_rx.changed() => break,
                    }
                }

                debug!(branch = %branch, "Branch worker stopped");
            }));
        }

        info!("Oracle supervisor started ({} branches)", self.workers.len());
        Ok(SupervisorHandle {
            supervisor: Arc::clone(self),
            stop_tx,
            tasks,
        })
    }

    fn worker(&self, branch: &BranchId) -> Result<&BranchWorker> {
        self.workers
            .get(branch)
            .ok_or_else(|| SentinelError::UnknownBranch(branch.clone()))
    }
}

/// Handle to the running branch workers
pub struct SupervisorHandle {
    supervisor: Arc<OracleSupervisor>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Stop every worker and wait for it to finish its current cycle
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Branch worker panicked: {}", e);
            }
        }
        self.supervisor.started.store(false, Ordering::Release);
        info!("Oracle supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HealthyReading, RecoveryAuthorization, ShutdownState};
    use crate::oracle::{PriceSource, Quote, QuoteValidation, SourceError};
    use crate::persistence::{MemoryStateStore, PersistedBranchState, StateStore};
    use crate::coordination::RegistryConfig;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    /// Source replaying a fixed script, then repeating its last answer
    struct ScriptedSource {
        script: std::sync::Mutex<VecDeque<std::result::Result<Quote, SourceError>>>,
        calls: AtomicU64,
    }

    impl ScriptedSource {
        fn new(script: Vec<std::result::Result<Quote, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                calls: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        async fn fetch_quote(&self) -> std::result::Result<Quote, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    /// Store that fails while `failing` is set
    #[derive(Default)]
    struct FlakyStore {
        failing: AtomicBool,
        failures_left: AtomicU64,
        inner: MemoryStateStore,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn load_all(&self) -> Result<Vec<PersistedBranchState>> {
            self.inner.load_all().await
        }

        async fn save(&self, record: &PersistedBranchState) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SentinelError::Persistence("unavailable".to_string()));
            }
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(SentinelError::Persistence("busy".to_string()));
            }
            self.inner.save(record).await
        }
    }

    fn eth() -> BranchId {
        BranchId::new("eth-usd")
    }

    fn upstream_down() -> std::result::Result<Quote, SourceError> {
        Err(SourceError::Upstream("execution reverted".to_string()))
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(50),
            write_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            reference_max_age: Duration::from_secs(30),
        }
    }

    async fn supervisor_with_probe(
        probe: HealthProbe,
        store: Arc<dyn StateStore>,
    ) -> (Arc<ShutdownRegistry>, Arc<PriceCache>, OracleSupervisor) {
        let registry = Arc::new(ShutdownRegistry::new(
            [eth()],
            store,
            RegistryConfig::default(),
        ));
        let cache = Arc::new(PriceCache::new([eth()]));
        let probes = HashMap::from([(eth(), probe)]);
        let supervisor =
            OracleSupervisor::new(fast_config(), registry.clone(), cache.clone(), probes)
                .await
                .unwrap();
        (registry, cache, supervisor)
    }

    async fn supervisor_with(
        source: Arc<ScriptedSource>,
        store: Arc<dyn StateStore>,
    ) -> (Arc<ShutdownRegistry>, Arc<PriceCache>, OracleSupervisor) {
        let probe = HealthProbe::new(source, fast_config().probe_timeout);
        supervisor_with_probe(probe, store).await
    }

    /// Supervisor whose probe rejects moves above 50% of the last good price
    async fn deviation_guarded(
        source: Arc<ScriptedSource>,
    ) -> (Arc<ShutdownRegistry>, Arc<PriceCache>, OracleSupervisor) {
        let probe = HealthProbe::new(source, fast_config().probe_timeout).with_validation(
            QuoteValidation {
                max_quote_age: None,
                max_deviation: Some(dec!(0.5)),
            },
        );
        supervisor_with_probe(probe, Arc::new(MemoryStateStore::new())).await
    }

    async fn next_oracle_failure(events: &mut broadcast::Receiver<SupervisorEvent>) -> Uuid {
        loop {
            if let Ok(SupervisorEvent::OracleFailed { episode, .. }) = events.recv().await {
                break episode;
            }
        }
    }

    fn ops_approval() -> RecoveryAuthorization {
        RecoveryAuthorization::new(eth(), "ops")
    }

    async fn supervisor(
        source: Arc<ScriptedSource>,
    ) -> (Arc<ShutdownRegistry>, Arc<PriceCache>, OracleSupervisor) {
        supervisor_with(source, Arc::new(MemoryStateStore::new())).await
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_healthy_reading_updates_cache() {
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(2000)))]);
        let (registry, cache, supervisor) = supervisor(source).await;

        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Healthy {
                value: dec!(2000),
                accepted: true
            }
        );
        assert_eq!(cache.read(&eth()).await.unwrap().value, dec!(2000));
        assert!(registry.current_state(&eth()).await.unwrap().is_active());
        assert_eq!(supervisor.mode(&eth()), Some(ProbeMode::Polling));
    }

    #[tokio::test]
    async fn test_failure_enters_shutdown_and_disables_probing() {
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(2000))), upstream_down()]);
        let (registry, cache, supervisor) = supervisor(source.clone()).await;
        let mut events = supervisor.subscribe();

        supervisor.poll_once(&eth()).await.unwrap();
        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                commit: FailureCommit::Entered,
                ..
            }
        ));

        let state = registry.current_state(&eth()).await.unwrap();
        assert_eq!(state.cause(), Some(&ShutdownCause::OracleFailure));
        assert!(state.is_temporary());
        assert_eq!(cache.read(&eth()).await.unwrap().value, dec!(2000));
        assert_eq!(supervisor.mode(&eth()), Some(ProbeMode::Disabled));

        assert!(matches!(
            events.try_recv().unwrap(),
            SupervisorEvent::OracleFailed { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SupervisorEvent::ProbingDisabled { .. }
        ));

        // Disabled: the source is not queried again
        assert_eq!(supervisor.poll_once(&eth()).await.unwrap(), CycleOutcome::Skipped);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_healthy_reading_never_clears_shutdown() {
        let source = ScriptedSource::new(vec![upstream_down(), Ok(Quote::new(dec!(1990)))]);
        let (registry, cache, supervisor) = supervisor(source).await;

        supervisor.poll_once(&eth()).await.unwrap();
        supervisor.reenable(&eth()).await.unwrap();
        let outcome = supervisor.poll_once(&eth()).await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Healthy { .. }));
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());
        assert_eq!(cache.read(&eth()).await.unwrap().value, dec!(1990));
    }

    #[tokio::test]
    async fn test_repeated_failure_in_same_episode_is_not_renotified() {
        let source = ScriptedSource::new(vec![upstream_down()]);
        let (_, _, supervisor) = supervisor(source).await;

        supervisor.poll_once(&eth()).await.unwrap();
        let first_episode = supervisor.stats(&eth()).await.unwrap().episode;
        supervisor.reenable(&eth()).await.unwrap();

        let mut events = supervisor.subscribe();
        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                commit: FailureCommit::Refreshed,
                ..
            }
        ));

        // Only the disable notification, no second OracleFailed
        assert!(matches!(
            events.try_recv().unwrap(),
            SupervisorEvent::ProbingDisabled { .. }
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(supervisor.stats(&eth()).await.unwrap().episode, first_episode);
    }

    #[tokio::test]
    async fn test_repeated_failures_leave_cached_price_untouched() {
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(2000))), upstream_down()]);
        let (_, cache, supervisor) = supervisor(source).await;

        supervisor.poll_once(&eth()).await.unwrap();
        let before = cache.read(&eth()).await.unwrap();

        for _ in 0..3 {
            let outcome = supervisor.poll_once(&eth()).await.unwrap();
            assert!(matches!(outcome, CycleOutcome::Failed { .. }));

            let after = cache.read(&eth()).await.unwrap();
            assert_eq!(after.value, before.value);
            assert_eq!(after.observed_at, before.observed_at);

            supervisor.reenable(&eth()).await.unwrap();
        }
        assert_eq!(supervisor.stats(&eth()).await.unwrap().failed, 3);
    }

    #[tokio::test]
    async fn test_recovery_resumes_probing_and_catches_the_next_failure() {
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(2000))), upstream_down()]);
        let (registry, _, supervisor) = supervisor(source.clone()).await;

        supervisor.poll_once(&eth()).await.unwrap();
        supervisor.poll_once(&eth()).await.unwrap();
        let first_episode = supervisor.stats(&eth()).await.unwrap().episode;
        assert_eq!(supervisor.mode(&eth()), Some(ProbeMode::Disabled));

        registry.recover(&eth(), &ops_approval()).await.unwrap();
        let mut events = supervisor.subscribe();

        // Oracle is still down: the next cycle probes and shuts the branch again
        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                commit: FailureCommit::Entered,
                ..
            }
        ));
        assert_eq!(source.calls(), 3);
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());
        assert_ne!(supervisor.stats(&eth()).await.unwrap().episode, first_episode);

        assert!(matches!(
            events.try_recv().unwrap(),
            SupervisorEvent::ProbingReenabled { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SupervisorEvent::OracleFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_disabled_branch_still_in_shutdown_is_skipped() {
        let source = ScriptedSource::new(vec![upstream_down()]);
        let (registry, _, supervisor) = supervisor(source.clone()).await;

        supervisor.poll_once(&eth()).await.unwrap();
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());

        assert_eq!(supervisor.poll_once(&eth()).await.unwrap(), CycleOutcome::Skipped);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_large_move_against_recent_price_is_rejected() {
        let source = ScriptedSource::new(vec![
            Ok(Quote::new(dec!(2000))),
            Ok(Quote::new(dec!(900))),
        ]);
        let (_, cache, supervisor) = deviation_guarded(source).await;

        supervisor.poll_once(&eth()).await.unwrap();
        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                reason: ProbeFailure::Malformed(_),
                ..
            }
        ));
        assert_eq!(cache.read(&eth()).await.unwrap().value, dec!(2000));
    }

    #[tokio::test]
    async fn test_price_that_moved_during_outage_is_accepted_after_reenable() {
        let source = ScriptedSource::new(vec![
            Ok(Quote::new(dec!(2000))),
            upstream_down(),
            Ok(Quote::new(dec!(900))),
        ]);
        let (registry, cache, supervisor) = deviation_guarded(source).await;

        supervisor.poll_once(&eth()).await.unwrap();
        supervisor.poll_once(&eth()).await.unwrap();
        supervisor.reenable(&eth()).await.unwrap();

        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Healthy {
                value: dec!(900),
                accepted: true
            }
        );
        assert_eq!(cache.read(&eth()).await.unwrap().value, dec!(900));
        // Healthy readings never clear the shutdown
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());

        // The new price is the reference from here on
        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Healthy { .. }));
    }

    #[tokio::test]
    async fn test_old_reference_is_not_used_for_deviation() {
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(900)))]);
        let (_, cache, supervisor) = deviation_guarded(source).await;
        cache
            .record(
                &eth(),
                &HealthyReading {
                    value: dec!(2000),
                    observed_at: Utc::now() - chrono::Duration::hours(1),
                },
            )
            .await;

        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Healthy { accepted: true, .. }));
        assert_eq!(cache.read(&eth()).await.unwrap().value, dec!(900));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected_until_shutdown() {
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(2000)))]);
        let (_, _, supervisor) = supervisor(source).await;
        let supervisor = Arc::new(supervisor);

        let handle = supervisor.start().unwrap();
        assert!(matches!(
            supervisor.start(),
            Err(SentinelError::InvalidState(_))
        ));
        handle.shutdown().await;

        let handle = supervisor.start().unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried() {
        let source = ScriptedSource::new(vec![upstream_down()]);
        let store = Arc::new(FlakyStore::default());
        store.failures_left.store(2, Ordering::SeqCst);
        let (registry, _, supervisor) = supervisor_with(source, store).await;

        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                commit: FailureCommit::Entered,
                ..
            }
        ));
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());
    }

    #[tokio::test]
    async fn test_unresolved_failure_is_committed_before_probing_again() {
        let source = ScriptedSource::new(vec![upstream_down(), Ok(Quote::new(dec!(2000)))]);
        let store = Arc::new(FlakyStore::default());
        store.failing.store(true, Ordering::SeqCst);
        let (registry, cache, supervisor) = supervisor_with(source.clone(), store.clone()).await;

        let err = supervisor.poll_once(&eth()).await.unwrap_err();
        assert!(matches!(
            err,
            SentinelError::Registry(RegistryError::Storage { .. })
        ));
        assert!(matches!(
            supervisor.mode(&eth()),
            Some(ProbeMode::Disabling { .. })
        ));
        assert!(supervisor.reenable(&eth()).await.is_err());

        store.failing.store(false, Ordering::SeqCst);
        let outcome = supervisor.poll_once(&eth()).await.unwrap();

        // The pending failure was committed; the healthy answer was never fetched
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                commit: FailureCommit::Entered,
                ..
            }
        ));
        assert_eq!(source.calls(), 1);
        assert!(cache.read(&eth()).await.is_none());
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());
        assert_eq!(supervisor.mode(&eth()), Some(ProbeMode::Disabled));
    }

    #[tokio::test]
    async fn test_failure_on_permanent_branch() {
        let source = ScriptedSource::new(vec![upstream_down()]);
        let (registry, _, supervisor) = supervisor(source).await;
        registry
            .trigger_permanent(&eth(), ShutdownCause::Governance("sunset".to_string()))
            .await
            .unwrap();

        let outcome = supervisor.poll_once(&eth()).await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                commit: FailureCommit::AlreadyPermanent,
                ..
            }
        ));
        assert!(supervisor.reenable(&eth()).await.is_err());
        assert!(registry.current_state(&eth()).await.unwrap().is_permanent());
    }

    #[tokio::test]
    async fn test_restored_shutdown_starts_disabled() {
        let store = Arc::new(MemoryStateStore::new());
        let state = ShutdownState::TemporaryShutdown {
            since: Utc::now(),
            cause: ShutdownCause::OracleFailure,
        };
        store
            .save(&PersistedBranchState::from_state(&eth(), &state))
            .await
            .unwrap();
        let registry = Arc::new(
            ShutdownRegistry::restore([eth()], store, RegistryConfig::default())
                .await
                .unwrap(),
        );
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(2000)))]);
        let probes = HashMap::from([(
            eth(),
            HealthProbe::new(source, Duration::from_millis(50)),
        )]);

        let supervisor = OracleSupervisor::new(
            fast_config(),
            registry,
            Arc::new(PriceCache::new([eth()])),
            probes,
        )
        .await
        .unwrap();
        assert_eq!(supervisor.mode(&eth()), Some(ProbeMode::Disabled));
    }

    #[tokio::test]
    async fn test_unknown_probe_branch_is_rejected() {
        let registry = Arc::new(ShutdownRegistry::in_memory([eth()]));
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(1)))]);
        let probes = HashMap::from([(
            BranchId::new("btc-usd"),
            HealthProbe::new(source, Duration::from_millis(50)),
        )]);

        let result = OracleSupervisor::new(
            fast_config(),
            registry,
            Arc::new(PriceCache::new([eth()])),
            probes,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_workers_poll_until_failure_then_wait_for_reenable() {
        let source = ScriptedSource::new(vec![
            Ok(Quote::new(dec!(2000))),
            Ok(Quote::new(dec!(2001))),
            upstream_down(),
        ]);
        let (registry, _, supervisor) = supervisor(source.clone()).await;
        let supervisor = Arc::new(supervisor);
        let mut events = supervisor.subscribe();

        let handle = supervisor.start().unwrap();
        let disabled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SupervisorEvent::ProbingDisabled { branch }) = events.recv().await {
                    break branch;
                }
            }
        })
        .await
        .expect("branch was never disabled");
        assert_eq!(disabled, eth());
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());

        // Workers idle while disabled
        let calls = source.calls();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), calls);

        // Re-enabling resumes probing but keeps the shutdown
        supervisor.reenable(&eth()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(source.calls() > calls);
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());

        assert!(handle.is_running());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_workers_resume_after_recovery() {
        let source = ScriptedSource::new(vec![Ok(Quote::new(dec!(2000))), upstream_down()]);
        let (registry, _, supervisor) = supervisor(source).await;
        let supervisor = Arc::new(supervisor);
        let mut events = supervisor.subscribe();
        let handle = supervisor.start().unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), next_oracle_failure(&mut events))
            .await
            .expect("oracle failure was never reported");

        // Recovered by the operator while the oracle is still down
        registry.recover(&eth(), &ops_approval()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), next_oracle_failure(&mut events))
            .await
            .expect("workers did not resume after recovery");

        assert_ne!(first, second);
        assert!(registry.current_state(&eth()).await.unwrap().is_temporary());
        handle.shutdown().await;
    }
}
