//! Synchronized multi-core measurement
//!
//! - [`counters`]: wrap-safe counter deltas
//! - [`state`]: shared and per-core round state
//! - [`validity`]: redo decisions
//! - [`orchestrator`]: round execution and retries

pub mod counters;
pub mod orchestrator;
pub mod state;
pub mod validity;

pub use counters::{counter_delta, CounterDelta};
pub use orchestrator::Orchestrator;
pub use validity::{evaluate_round, Violation};
