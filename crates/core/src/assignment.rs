//! Assignment model - the binding of a work item to a worker.

use serde::{Deserialize, Serialize};

use crate::{AssignmentId, CoreError, Time, WorkItemId, WorkerId};

/// A (current or historical) binding of a work item to a worker.
///
/// At most one `Active` assignment exists per work item at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Unique identifier
    pub id: AssignmentId,

    /// The assigned work item
    pub work_item_id: WorkItemId,

    /// The worker holding it
    pub worker_id: WorkerId,

    /// Lifecycle state
    pub status: AssignmentStatus,

    /// When the item was bound to `worker_id`
    pub assigned_at: Time,
}

impl Assignment {
    /// Create a new active assignment.
    pub fn active(work_item_id: WorkItemId, worker_id: WorkerId, assigned_at: Time) -> Self {
        Self {
            id: AssignmentId::new(),
            work_item_id,
            worker_id,
            status: AssignmentStatus::Active,
            assigned_at,
        }
    }

    /// Whether the assignment counts toward its worker's load.
    pub fn is_active(&self) -> bool {
        self.status == AssignmentStatus::Active
    }
}

/// Assignment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    /// Currently held by the worker
    Active,
    /// Closed by the worker (terminal)
    Completed,
}

impl AssignmentStatus {
    /// Stable string form, used by storage backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Active => "active",
            AssignmentStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AssignmentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AssignmentStatus::Active),
            "completed" => Ok(AssignmentStatus::Completed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Outcome of an automatic assignment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignmentResult {
    /// The item is held by this worker
    Assigned(WorkerId),
    /// No eligible worker exists; the item needs manual assignment
    Unassigned,
}

impl AssignmentResult {
    /// The assigned worker, if any.
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            AssignmentResult::Assigned(id) => Some(*id),
            AssignmentResult::Unassigned => None,
        }
    }
}
