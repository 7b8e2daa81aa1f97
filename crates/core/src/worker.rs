//! Worker model - an assignment target.

use serde::{Deserialize, Serialize};

use crate::{CapacityRange, Time, WorkerId};

/// A worker that work items can be assigned to.
///
/// Workers are created and edited by the admin side; the engine only reads
/// the capacity range and derives load from active assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier
    pub id: WorkerId,

    /// Display name
    pub name: String,

    /// Sort keys this worker is eligible for
    pub capacity_range: CapacityRange,

    /// When the worker was registered; oldest wins load ties
    pub created_at: Time,
}

impl Worker {
    /// Create a new worker.
    pub fn new(name: impl Into<String>, capacity_range: CapacityRange) -> Self {
        Self {
            id: WorkerId::new(),
            name: name.into(),
            capacity_range,
            created_at: crate::now(),
        }
    }

    /// Whether this worker may hold an item with `sort_key`.
    pub fn accepts(&self, sort_key: f64) -> bool {
        self.capacity_range.contains(sort_key)
    }
}

/// A worker annotated with its current number of active assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLoad {
    /// The worker
    pub worker: Worker,

    /// Count of active assignments referencing the worker
    pub active_load: u64,
}

impl WorkerLoad {
    /// Shorthand for the worker's id.
    pub fn worker_id(&self) -> WorkerId {
        self.worker.id
    }
}
