//! Engine error taxonomy.

use leadflow_core::{CapacityRange, WorkItemId, WorkerId};
use leadflow_storage::StorageError;

/// Errors returned by [`crate::AssignmentEngine`].
///
/// "No eligible worker" is not an error: it is reported as
/// [`leadflow_core::AssignmentResult::Unassigned`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unknown work item
    #[error("work item not found: {0}")]
    WorkItemNotFound(WorkItemId),

    /// Unknown worker
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    /// Reassignment target does not accept the item's sort key
    #[error("sort key {sort_key} is outside range {range} of worker {worker_id}")]
    EligibilityMismatch {
        /// The item's sort key
        sort_key: f64,
        /// The rejected target
        worker_id: WorkerId,
        /// The target's capacity range
        range: CapacityRange,
    },

    /// The item's assignment has been completed; nothing may move it
    #[error("work item {0} is already completed")]
    AlreadyCompleted(WorkItemId),

    /// The item is not actively assigned to the given worker
    #[error("work item {work_item_id} is not actively assigned to worker {worker_id}")]
    NotAssigned {
        /// The work item
        work_item_id: WorkItemId,
        /// The worker that tried to act on it
        worker_id: WorkerId,
    },

    /// Sort key is NaN or infinite
    #[error("invalid sort key: {0}")]
    InvalidSortKey(f64),

    /// Invalid input value
    #[error(transparent)]
    Invalid(#[from] leadflow_core::CoreError),

    /// Lock wait, timeout, or serialization conflict. Retry with backoff.
    #[error("transient store failure: {0}")]
    TransientStoreFailure(String),

    /// Non-transient storage failure
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl EngineError {
    /// Whether the caller should retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientStoreFailure(_))
    }

    /// Whether this is a serialization conflict the engine may retry itself.
    pub(crate) fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Storage(StorageError::Conflict(_)))
    }

    /// Final form handed to callers: transient storage failures collapse
    /// into [`EngineError::TransientStoreFailure`].
    pub(crate) fn surface(self) -> Self {
        match self {
            EngineError::Storage(e) if e.is_transient() => {
                EngineError::TransientStoreFailure(e.to_string())
            }
            other => other,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e)
    }
}
