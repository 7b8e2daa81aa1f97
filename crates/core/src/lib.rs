//! Leadflow core data models.
//!
//! This crate defines the entities the assignment engine works on: work
//! items arriving from intake, the workers that can take them, and the
//! assignments (plus their history) binding one to the other.

#![warn(missing_docs)]

// Core identities
mod id;

// Eligibility
mod range;
mod worker;

// Work and assignment
mod work_item;
mod assignment;
mod history;

// Re-exports
pub use id::*;

pub use range::CapacityRange;
pub use worker::{Worker, WorkerLoad};
pub use work_item::WorkItem;
pub use assignment::{Assignment, AssignmentResult, AssignmentStatus};
pub use history::{ChangeReason, HistoryEntry};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

/// Current time, truncated to microseconds.
///
/// Every timestamp the system stores goes through here so that backends
/// with microsecond resolution round-trip values exactly.
pub fn now() -> Time {
    use chrono::SubsecRound;
    chrono::Utc::now().trunc_subsecs(6)
}

/// Errors raised when constructing core values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// Range bounds are not finite or are inverted.
    #[error("invalid capacity range [{min}, {max}]")]
    InvalidRange {
        /// Lower bound as given
        min: f64,
        /// Upper bound as given
        max: f64,
    },

    /// Sort key is NaN or infinite.
    #[error("invalid sort key: {0}")]
    InvalidSortKey(f64),

    /// Status string not recognised.
    #[error("unknown assignment status: {0}")]
    UnknownStatus(String),

    /// Change reason string not recognised.
    #[error("unknown change reason: {0}")]
    UnknownReason(String),
}
