//! Test harnesses for the Go-Back-N engine: a deterministic virtual-time
//! simulator with scripted scenarios, and an in-process link for running two
//! threaded endpoints against each other.

pub mod engine;
pub mod link;
pub mod memory;
pub mod scenario_runner;
pub mod trace;

pub use engine::{LinkEventSummary, NodeId, Simulator};
pub use link::SimPort;
pub use memory::{MemoryLink, MemorySubstrate};
pub use trace::SimulationReport;
