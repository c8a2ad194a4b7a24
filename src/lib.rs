pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod oracle;
pub mod persistence;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{
    DependentGate, GatePolicy, GateStats, GuardedPriceReader, RegistryConfig, ShutdownEvent,
    ShutdownRegistry, TriggerOutcome,
};
pub use domain::{
    BranchId, DenyReason, GateDecision, OperationKind, OracleReading, RecoveryAuthorization,
    ShutdownCause, ShutdownKind, ShutdownState,
};
pub use engine::SentinelEngine;
pub use error::{GateDenied, ProbeFailure, RegistryError, Result, SentinelError};
pub use oracle::{FrozenPrice, HealthProbe, HttpPriceSource, PriceCache, PriceSource, Quote};
pub use persistence::{JsonFileStateStore, MemoryStateStore, StateStore};
pub use supervisor::{
    BranchStats, CycleOutcome, OracleSupervisor, SupervisorConfig, SupervisorEvent,
    SupervisorHandle,
};
