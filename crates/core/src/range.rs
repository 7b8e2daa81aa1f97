//! Capacity range - the eligibility predicate of a worker.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Inclusive numeric bounds `[min, max]` on the sort keys a worker accepts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityRange {
    /// Lower bound (inclusive)
    pub min: f64,
    /// Upper bound (inclusive)
    pub max: f64,
}

impl CapacityRange {
    /// Create a range, rejecting non-finite or inverted bounds.
    pub fn new(min: f64, max: f64) -> Result<Self, CoreError> {
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(CoreError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Whether `sort_key` falls inside the range.
    pub fn contains(&self, sort_key: f64) -> bool {
        self.min <= sort_key && sort_key <= self.max
    }
}

impl std::fmt::Display for CapacityRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
