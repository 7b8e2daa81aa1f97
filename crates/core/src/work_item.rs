//! Work item model - a lead awaiting assignment.

use serde::{Deserialize, Serialize};

use crate::{CoreError, Time, WorkItemId};

/// A unit of work produced by intake. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier
    pub id: WorkItemId,

    /// Free-form label supplied by intake (e.g. the lead's name)
    pub label: String,

    /// Numeric key evaluated against worker capacity ranges
    pub sort_key: f64,

    /// When the item was stored
    pub created_at: Time,
}

impl WorkItem {
    /// Create a new work item. The sort key must be finite.
    pub fn new(label: impl Into<String>, sort_key: f64) -> Result<Self, CoreError> {
        if !sort_key.is_finite() {
            return Err(CoreError::InvalidSortKey(sort_key));
        }
        Ok(Self {
            id: WorkItemId::new(),
            label: label.into(),
            sort_key,
            created_at: crate::now(),
        })
    }
}
