//! Orchestrator subsystem.
//!
//! Manages the population of concurrently running probe instances: admits
//! new sessions against a global packet-rate budget, assigns durable
//! sequential identifiers, launches and stops instances, and reconciles
//! completed sessions into the history log.
//!
//! Components:
//! - `counter`: the durable rotating test-id counter.
//! - `launcher`: the [`ProbeLauncher`] seam with process-based and
//!   in-process implementations.
//! - `manager`: [`ProbeManager`], the lifecycle contract exposed to the
//!   surrounding system.

pub mod counter;
pub mod launcher;
pub mod manager;

pub use counter::TestIdCounter;
pub use launcher::{ProbeHandle, ProbeLauncher, ProcessLauncher, TaskLauncher};
pub use manager::{ProbeManager, StatusEntry};
