//! Supervisor Layer for Oracle Health
//!
//! Periodically probes every branch's oracle and routes the result:
//! healthy readings to the price cache, failures to the shutdown registry.

pub mod oracle_supervisor;

pub use oracle_supervisor::{
    BranchStats, CycleOutcome, FailureCommit, OracleSupervisor, ProbeMode, RetryPolicy,
    SupervisorConfig, SupervisorEvent, SupervisorHandle,
};
