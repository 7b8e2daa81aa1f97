//! Storage trait abstraction.

use async_trait::async_trait;
use leadflow_core::{
    Assignment, AssignmentStatus, CapacityRange, HistoryEntry, WorkItem, WorkItemId, Worker,
    WorkerId, WorkerLoad,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another transaction touched the same rows; retrying may succeed
    #[error("Serialization conflict: {0}")]
    Conflict(String),

    /// The store did not respond in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A stored value could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Conflict(_) | StorageError::Timeout(_))
    }
}

/// Storage abstraction for Leadflow data.
///
/// All reads and writes go through a [`Transaction`]. A backend must make
/// transactions serializable: while one is open, no other transaction may
/// interleave a read-then-write over the same workers or assignments.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Transaction handle type.
    type Tx: Transaction;

    /// Open a transaction, waiting for any in-flight one to finish.
    async fn begin(&self) -> Result<Self::Tx>;
}

/// A unit of atomic work against the store.
///
/// Dropping a transaction without calling [`Transaction::commit`] discards
/// every write made through it.
#[async_trait]
pub trait Transaction: Send + Sized {
    // === Worker operations ===

    /// Save a worker (create or update).
    async fn save_worker(&mut self, worker: &Worker) -> Result<()>;

    /// Load a worker by ID.
    async fn load_worker(&mut self, id: WorkerId) -> Result<Option<Worker>>;

    /// Workers whose capacity range contains `sort_key`, with active load.
    ///
    /// Order is unspecified; callers sort.
    async fn eligible_workers(&mut self, sort_key: f64) -> Result<Vec<WorkerLoad>>;

    /// Every worker with its active load. Order is unspecified.
    async fn worker_loads(&mut self) -> Result<Vec<WorkerLoad>>;

    // === Work item operations ===

    /// Store a new work item. Fails if the ID already exists.
    async fn insert_work_item(&mut self, item: &WorkItem) -> Result<()>;

    /// Load a work item by ID.
    async fn load_work_item(&mut self, id: WorkItemId) -> Result<Option<WorkItem>>;

    // === Assignment operations ===

    /// The active assignment of a work item, if any.
    async fn active_assignment(&mut self, work_item_id: WorkItemId) -> Result<Option<Assignment>>;

    /// The most recently assigned row of a work item, whatever its status.
    async fn latest_assignment(&mut self, work_item_id: WorkItemId) -> Result<Option<Assignment>>;

    /// Up to `limit` of `worker_id`'s active assignments, oldest first,
    /// restricted to items whose sort key lies inside `range`.
    async fn movable_assignments(
        &mut self,
        worker_id: WorkerId,
        range: CapacityRange,
        limit: u64,
    ) -> Result<Vec<Assignment>>;

    /// Assignments of a worker with the given status, oldest first.
    async fn assignments_for_worker(
        &mut self,
        worker_id: WorkerId,
        status: AssignmentStatus,
    ) -> Result<Vec<Assignment>>;

    /// Save an assignment (create or update).
    async fn save_assignment(&mut self, assignment: &Assignment) -> Result<()>;

    // === History operations ===

    /// Append an entry to the history log.
    async fn append_history(&mut self, entry: &HistoryEntry) -> Result<()>;

    /// History of a work item, newest first.
    async fn history(&mut self, work_item_id: WorkItemId) -> Result<Vec<HistoryEntry>>;

    // === Transaction control ===

    /// Make every write visible atomically.
    async fn commit(self) -> Result<()>;

    /// Discard every write.
    async fn rollback(self) -> Result<()>;
}
