//! Coordination Layer for Shutdown Consistency
//!
//! This module provides the shared shutdown state every dependent module consults:
//! - Shutdown registry, the single source of truth per branch
//! - Dependent gate, the fail-closed guard in front of entry points
//! - Guarded price reads that combine the gate with the frozen price cache

pub mod gate;
pub mod registry;

pub use gate::{DependentGate, GatePolicy, GateStats, GuardedPriceReader};
pub use registry::{RegistryConfig, ShutdownEvent, ShutdownRegistry, TriggerOutcome};
