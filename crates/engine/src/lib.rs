//! Assignment layer - eligibility lookup, rebalancing, and the engine that
//! binds work items to workers.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod index;
pub mod rebalance;
pub mod engine;

pub use config::{AssignmentPolicy, ConfigError, EngineConfig, SameWorkerPolicy};
pub use error::EngineError;
pub use index::EligibilityIndex;
pub use rebalance::{RebalancePass, Transfer};
pub use engine::{AssignmentEngine, ReassignOutcome};
