//! Worker lifecycle: out-of-process model servers, one per alias.
//!
//! Workers run as separate processes so that:
//! - Memory reclaim: stopping the process frees everything the model held
//! - Crash isolation: a model crash doesn't take the manager down

pub mod budget;
pub mod health;
pub mod health_monitor;
pub mod orchestrator;
pub mod process_manager;
pub mod registry;
mod spawner;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use orchestrator::{EvictOutcome, Orchestrator, OrchestratorSettings, StatusSnapshot, WorkerLease};
pub use registry::{InstanceKey, WorkerInfo, WorkerState};
