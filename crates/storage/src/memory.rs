//! In-process storage implementation.
//!
//! All state lives behind one async mutex. A transaction owns the lock guard
//! for its whole lifetime and writes in place, recording an undo entry for
//! every change. This makes the store a single writer: transactions run one
//! at a time, and an abandoned transaction (dropped, cancelled, timed out)
//! replays its undo log and leaves no trace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use leadflow_core::{
    Assignment, AssignmentId, AssignmentStatus, CapacityRange, HistoryEntry, WorkItem,
    WorkItemId, Worker, WorkerId, WorkerLoad,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use super::{Result, Storage, StorageError, Transaction};

#[derive(Debug, Default)]
struct State {
    workers: HashMap<WorkerId, Worker>,
    work_items: HashMap<WorkItemId, WorkItem>,
    assignments: HashMap<AssignmentId, Assignment>,
    // Append order is the tie-break for equal timestamps.
    history: Vec<HistoryEntry>,
}

impl State {
    fn load_of(&self, worker_id: WorkerId) -> u64 {
        self.assignments
            .values()
            .filter(|a| a.worker_id == worker_id && a.is_active())
            .count() as u64
    }

    fn with_load(&self, worker: &Worker) -> WorkerLoad {
        WorkerLoad {
            worker: worker.clone(),
            active_load: self.load_of(worker.id),
        }
    }
}

/// In-memory storage backend.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let guard = self.state.clone().lock_owned().await;
        let history_len = guard.history.len();
        trace!("memory transaction opened");
        Ok(MemoryTransaction {
            guard,
            undo: Vec::new(),
            history_len,
        })
    }
}

/// A change to roll back, holding the value it replaced.
enum Undo {
    Worker(WorkerId, Option<Worker>),
    WorkItem(WorkItemId),
    Assignment(AssignmentId, Option<Assignment>),
}

/// Transaction over [`MemoryStorage`].
///
/// Writes go straight to the shared state; dropping the transaction without
/// [`Transaction::commit`] undoes them.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    undo: Vec<Undo>,
    // History is append-only, so rolling it back is a truncate.
    history_len: usize,
}

impl MemoryTransaction {
    fn undo_all(&mut self) {
        let state = &mut *self.guard;
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Worker(id, Some(prev)) => {
                    state.workers.insert(id, prev);
                }
                Undo::Worker(id, None) => {
                    state.workers.remove(&id);
                }
                Undo::WorkItem(id) => {
                    state.work_items.remove(&id);
                }
                Undo::Assignment(id, Some(prev)) => {
                    state.assignments.insert(id, prev);
                }
                Undo::Assignment(id, None) => {
                    state.assignments.remove(&id);
                }
            }
        }
        state.history.truncate(self.history_len);
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.undo.is_empty() || self.guard.history.len() != self.history_len {
            self.undo_all();
            trace!("memory transaction discarded");
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn save_worker(&mut self, worker: &Worker) -> Result<()> {
        let prev = self.guard.workers.insert(worker.id, worker.clone());
        self.undo.push(Undo::Worker(worker.id, prev));
        Ok(())
    }

    async fn load_worker(&mut self, id: WorkerId) -> Result<Option<Worker>> {
        Ok(self.guard.workers.get(&id).cloned())
    }

    async fn eligible_workers(&mut self, sort_key: f64) -> Result<Vec<WorkerLoad>> {
        let state = &*self.guard;
        Ok(state
            .workers
            .values()
            .filter(|w| w.accepts(sort_key))
            .map(|w| state.with_load(w))
            .collect())
    }

    async fn worker_loads(&mut self) -> Result<Vec<WorkerLoad>> {
        let state = &*self.guard;
        Ok(state.workers.values().map(|w| state.with_load(w)).collect())
    }

    async fn insert_work_item(&mut self, item: &WorkItem) -> Result<()> {
        if self.guard.work_items.contains_key(&item.id) {
            return Err(StorageError::Other(format!("work item {} already exists", item.id)));
        }
        self.guard.work_items.insert(item.id, item.clone());
        self.undo.push(Undo::WorkItem(item.id));
        Ok(())
    }

    async fn load_work_item(&mut self, id: WorkItemId) -> Result<Option<WorkItem>> {
        Ok(self.guard.work_items.get(&id).cloned())
    }

    async fn active_assignment(&mut self, work_item_id: WorkItemId) -> Result<Option<Assignment>> {
        Ok(self
            .guard
            .assignments
            .values()
            .find(|a| a.work_item_id == work_item_id && a.is_active())
            .cloned())
    }

    async fn latest_assignment(&mut self, work_item_id: WorkItemId) -> Result<Option<Assignment>> {
        Ok(self
            .guard
            .assignments
            .values()
            .filter(|a| a.work_item_id == work_item_id)
            .max_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then_with(|| a.id.cmp(&b.id)))
            .cloned())
    }

    async fn movable_assignments(
        &mut self,
        worker_id: WorkerId,
        range: CapacityRange,
        limit: u64,
    ) -> Result<Vec<Assignment>> {
        let state = &*self.guard;
        let mut movable: Vec<Assignment> = state
            .assignments
            .values()
            .filter(|a| a.worker_id == worker_id && a.is_active())
            .filter(|a| {
                state
                    .work_items
                    .get(&a.work_item_id)
                    .is_some_and(|item| range.contains(item.sort_key))
            })
            .cloned()
            .collect();
        movable.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then_with(|| a.id.cmp(&b.id)));
        movable.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(movable)
    }

    async fn assignments_for_worker(
        &mut self,
        worker_id: WorkerId,
        status: AssignmentStatus,
    ) -> Result<Vec<Assignment>> {
        let mut rows: Vec<Assignment> = self
            .guard
            .assignments
            .values()
            .filter(|a| a.worker_id == worker_id && a.status == status)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn save_assignment(&mut self, assignment: &Assignment) -> Result<()> {
        // Mirror the SQLite partial unique index: one active row per item.
        if assignment.is_active() {
            let clash = self.guard.assignments.values().any(|a| {
                a.work_item_id == assignment.work_item_id && a.is_active() && a.id != assignment.id
            });
            if clash {
                return Err(StorageError::Other(format!(
                    "work item {} already has an active assignment",
                    assignment.work_item_id
                )));
            }
        }
        let prev = self.guard.assignments.insert(assignment.id, assignment.clone());
        self.undo.push(Undo::Assignment(assignment.id, prev));
        Ok(())
    }

    async fn append_history(&mut self, entry: &HistoryEntry) -> Result<()> {
        self.guard.history.push(entry.clone());
        Ok(())
    }

    async fn history(&mut self, work_item_id: WorkItemId) -> Result<Vec<HistoryEntry>> {
        let mut entries: Vec<(usize, HistoryEntry)> = self
            .guard
            .history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.work_item_id == work_item_id)
            .map(|(seq, e)| (seq, e.clone()))
            .collect();
        entries.sort_by(|(sa, a), (sb, b)| b.recorded_at.cmp(&a.recorded_at).then_with(|| sb.cmp(sa)));
        Ok(entries.into_iter().map(|(_, e)| e).collect())
    }

    async fn commit(mut self) -> Result<()> {
        self.undo.clear();
        self.history_len = self.guard.history.len();
        trace!("memory transaction committed");
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.undo_all();
        trace!("memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::{ChangeReason, HistoryEntry};

    fn worker(name: &str, min: f64, max: f64) -> Worker {
        Worker::new(name, CapacityRange::new(min, max).unwrap())
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let storage = MemoryStorage::new();
        let w = worker("alice", 0.0, 100.0);

        let mut tx = storage.begin().await.unwrap();
        tx.save_worker(&w).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        assert_eq!(tx.load_worker(w.id).await.unwrap(), Some(w));
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let storage = MemoryStorage::new();
        let w = worker("bob", 0.0, 100.0);

        {
            let mut tx = storage.begin().await.unwrap();
            tx.save_worker(&w).await.unwrap();
            // dropped without commit
        }

        let mut tx = storage.begin().await.unwrap();
        assert!(tx.load_worker(w.id).await.unwrap().is_none());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_transactions_are_exclusive() {
        let storage = MemoryStorage::new();
        let tx = storage.begin().await.unwrap();

        let second = tokio::time::timeout(std::time::Duration::from_millis(50), storage.begin()).await;
        assert!(second.is_err(), "second transaction must wait for the first");

        tx.rollback().await.unwrap();
        assert!(storage.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_eligible_workers_counts_active_only() {
        let storage = MemoryStorage::new();
        let a = worker("a", 1000.0, 5000.0);
        let b = worker("b", 6000.0, 9000.0);
        let item = WorkItem::new("lead", 2000.0).unwrap();
        let done = WorkItem::new("done", 2500.0).unwrap();

        let mut tx = storage.begin().await.unwrap();
        tx.save_worker(&a).await.unwrap();
        tx.save_worker(&b).await.unwrap();
        tx.insert_work_item(&item).await.unwrap();
        tx.insert_work_item(&done).await.unwrap();
        tx.save_assignment(&Assignment::active(item.id, a.id, leadflow_core::now()))
            .await
            .unwrap();
        let mut closed = Assignment::active(done.id, a.id, leadflow_core::now());
        closed.status = AssignmentStatus::Completed;
        tx.save_assignment(&closed).await.unwrap();

        let eligible = tx.eligible_workers(2000.0).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].worker_id(), a.id);
        assert_eq!(eligible[0].active_load, 1);
    }

    #[tokio::test]
    async fn test_second_active_assignment_rejected() {
        let storage = MemoryStorage::new();
        let a = worker("a", 0.0, 10.0);
        let item = WorkItem::new("lead", 5.0).unwrap();

        let mut tx = storage.begin().await.unwrap();
        tx.save_worker(&a).await.unwrap();
        tx.insert_work_item(&item).await.unwrap();
        tx.save_assignment(&Assignment::active(item.id, a.id, leadflow_core::now()))
            .await
            .unwrap();
        let dup = Assignment::active(item.id, a.id, leadflow_core::now());
        assert!(tx.save_assignment(&dup).await.is_err());
    }

    #[tokio::test]
    async fn test_movable_assignments_oldest_first_within_range() {
        let storage = MemoryStorage::new();
        let donor = worker("donor", 0.0, 10_000.0);
        let base = leadflow_core::now();

        let mut tx = storage.begin().await.unwrap();
        tx.save_worker(&donor).await.unwrap();
        let mut ids = Vec::new();
        for (i, key) in [500.0, 7000.0, 600.0, 700.0].into_iter().enumerate() {
            let item = WorkItem::new(format!("lead-{i}"), key).unwrap();
            tx.insert_work_item(&item).await.unwrap();
            let at = base + chrono::Duration::seconds(i as i64);
            tx.save_assignment(&Assignment::active(item.id, donor.id, at)).await.unwrap();
            ids.push(item.id);
        }

        let range = CapacityRange::new(0.0, 1000.0).unwrap();
        let movable = tx.movable_assignments(donor.id, range, 2).await.unwrap();
        let moved: Vec<_> = movable.iter().map(|a| a.work_item_id).collect();
        assert_eq!(moved, vec![ids[0], ids[2]]);
    }

    #[tokio::test]
    async fn test_history_newest_first_with_stable_ties() {
        let storage = MemoryStorage::new();
        let item = WorkItemId::new();
        let (w1, w2) = (WorkerId::new(), WorkerId::new());
        let at = leadflow_core::now();

        let mut tx = storage.begin().await.unwrap();
        let first = HistoryEntry::new(item, w1, None, ChangeReason::Assigned, at);
        let second = HistoryEntry::new(item, w2, Some(w1), ChangeReason::Rebalanced, at);
        tx.append_history(&first).await.unwrap();
        tx.append_history(&second).await.unwrap();

        let history = tx.history(item).await.unwrap();
        assert_eq!(history, vec![second, first]);
    }

    #[tokio::test]
    async fn test_abandoned_transaction_restores_overwritten_rows() {
        let storage = MemoryStorage::new();
        let original = worker("carol", 0.0, 10.0);
        let item = WorkItem::new("lead", 5.0).unwrap();
        let assignment = Assignment::active(item.id, original.id, leadflow_core::now());
        let entry = HistoryEntry::new(item.id, original.id, None, ChangeReason::Assigned, assignment.assigned_at);

        let mut tx = storage.begin().await.unwrap();
        tx.save_worker(&original).await.unwrap();
        tx.insert_work_item(&item).await.unwrap();
        tx.save_assignment(&assignment).await.unwrap();
        tx.append_history(&entry).await.unwrap();
        tx.commit().await.unwrap();

        {
            let mut tx = storage.begin().await.unwrap();
            let mut widened = original.clone();
            widened.capacity_range = CapacityRange::new(0.0, 100.0).unwrap();
            tx.save_worker(&widened).await.unwrap();

            let mut done = assignment.clone();
            done.status = AssignmentStatus::Completed;
            tx.save_assignment(&done).await.unwrap();

            let other = worker("dave", 0.0, 10.0);
            tx.save_worker(&other).await.unwrap();
            let closing = HistoryEntry::new(item.id, original.id, None, ChangeReason::Completed, leadflow_core::now());
            tx.append_history(&closing).await.unwrap();
            // dropped without commit
        }

        let mut tx = storage.begin().await.unwrap();
        assert_eq!(tx.load_worker(original.id).await.unwrap(), Some(original.clone()));
        assert_eq!(tx.active_assignment(item.id).await.unwrap(), Some(assignment));
        assert_eq!(tx.worker_loads().await.unwrap().len(), 1);
        assert_eq!(tx.history(item.id).await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn test_explicit_rollback_undoes_in_place_writes() {
        let storage = MemoryStorage::new();
        let w = worker("erin", 0.0, 10.0);

        let mut tx = storage.begin().await.unwrap();
        tx.save_worker(&w).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = storage.begin().await.unwrap();
        assert!(tx.worker_loads().await.unwrap().is_empty());
    }
}
