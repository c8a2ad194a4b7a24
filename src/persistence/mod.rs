//! Persistence Layer for Shutdown State
//!
//! Keeps per-branch shutdown states durable across restarts. The registry
//! reloads every record before the supervisor resumes probing.

pub mod state_store;

pub use state_store::{JsonFileStateStore, MemoryStateStore, PersistedBranchState, StateStore};
