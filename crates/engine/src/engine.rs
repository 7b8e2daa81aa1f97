//! The assignment engine.
//!
//! Every public operation is one storage transaction, bounded by the
//! configured timeout and retried once on a serialization conflict:
//! ```text
//! begin → read loads → (rebalance) → write assignment + history → commit
//! ```
//! Any failure before commit drops the transaction, so no half-applied
//! rebalance or reassignment is ever visible.

use std::future::Future;

use leadflow_core::{
    Assignment, AssignmentResult, AssignmentStatus, CapacityRange, ChangeReason, HistoryEntry,
    Time, WorkItem, WorkItemId, Worker, WorkerId, WorkerLoad,
};
use leadflow_storage::{Storage, Transaction};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    AssignmentPolicy, EligibilityIndex, EngineConfig, EngineError, RebalancePass,
    SameWorkerPolicy,
};

type Result<T> = std::result::Result<T, EngineError>;

/// Result of [`AssignmentEngine::reassign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReassignOutcome {
    /// The active assignment moved between workers
    Moved {
        /// Previous holder
        from: WorkerId,
        /// New holder
        to: WorkerId,
    },
    /// Target already held the item; nothing changed
    Unchanged(WorkerId),
    /// Target already held the item; `assigned_at` was bumped
    Refreshed(WorkerId),
    /// The item had no active assignment and went through auto-assignment
    AutoAssigned(AssignmentResult),
}

/// Capacity-constrained assignment and rebalancing engine.
pub struct AssignmentEngine<S: Storage> {
    storage: S,
    index: EligibilityIndex,
    config: EngineConfig,
}

impl<S: Storage> AssignmentEngine<S> {
    /// Create an engine with the default configuration.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            index: EligibilityIndex::new(),
            config: EngineConfig::default(),
        }
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get a reference to the storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    // === Assignment ===

    /// Assign a stored work item to the least-loaded eligible worker.
    ///
    /// Fails with [`EngineError::AlreadyCompleted`] once the item's
    /// assignment has been completed.
    pub async fn assign_greedy(
        &self,
        work_item_id: WorkItemId,
        sort_key: f64,
    ) -> Result<AssignmentResult> {
        self.assign_by(work_item_id, sort_key, AssignmentPolicy::Greedy).await
    }

    /// Even out eligible workers, then assign the work item to the
    /// least-loaded one.
    pub async fn assign_with_rebalance(
        &self,
        work_item_id: WorkItemId,
        sort_key: f64,
    ) -> Result<AssignmentResult> {
        self.assign_by(work_item_id, sort_key, AssignmentPolicy::Rebalance).await
    }

    /// Assign a work item using the configured policy.
    pub async fn assign(&self, work_item_id: WorkItemId, sort_key: f64) -> Result<AssignmentResult> {
        self.assign_by(work_item_id, sort_key, self.config.policy).await
    }

    async fn assign_by(
        &self,
        work_item_id: WorkItemId,
        sort_key: f64,
        policy: AssignmentPolicy,
    ) -> Result<AssignmentResult> {
        check_sort_key(sort_key)?;
        self.run("assign", move || self.assign_once(work_item_id, sort_key, policy))
            .await
    }

    async fn assign_once(
        &self,
        work_item_id: WorkItemId,
        sort_key: f64,
        policy: AssignmentPolicy,
    ) -> Result<AssignmentResult> {
        let mut tx = self.storage.begin().await?;
        let item = load_item(&mut tx, work_item_id).await?;
        if item.sort_key != sort_key {
            warn!(
                work_item = %item.id,
                given = sort_key,
                stored = item.sort_key,
                "sort key disagrees with stored work item; using stored value"
            );
        }

        let result = self.assign_in(&mut tx, &item, policy, leadflow_core::now()).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Place `item` inside an open transaction.
    async fn assign_in(
        &self,
        tx: &mut S::Tx,
        item: &WorkItem,
        policy: AssignmentPolicy,
        now: Time,
    ) -> Result<AssignmentResult> {
        if let Some(active) = tx.active_assignment(item.id).await? {
            debug!(work_item = %item.id, worker = %active.worker_id, "already assigned");
            return Ok(AssignmentResult::Assigned(active.worker_id));
        }
        // Completed is terminal.
        if let Some(latest) = tx.latest_assignment(item.id).await? {
            if latest.status == AssignmentStatus::Completed {
                return Err(EngineError::AlreadyCompleted(item.id));
            }
        }

        let mut eligible = self.index.find_eligible(tx, item.sort_key).await?;
        if eligible.is_empty() {
            info!(
                work_item = %item.id,
                sort_key = item.sort_key,
                "No eligible worker; left unassigned"
            );
            return Ok(AssignmentResult::Unassigned);
        }

        if policy == AssignmentPolicy::Rebalance {
            self.rebalance(tx, &mut eligible, now).await?;
        }

        let Some(chosen) = eligible.iter().min_by(|a, b| EligibilityIndex::compare(a, b)) else {
            return Ok(AssignmentResult::Unassigned);
        };
        let worker_id = chosen.worker_id();

        tx.save_assignment(&Assignment::active(item.id, worker_id, now)).await?;
        tx.append_history(&HistoryEntry::new(
            item.id,
            worker_id,
            None,
            ChangeReason::Assigned,
            now,
        ))
        .await?;

        info!(
            work_item = %item.id,
            worker = %worker_id,
            name = %chosen.worker.name,
            ?policy,
            "Work item assigned"
        );
        Ok(AssignmentResult::Assigned(worker_id))
    }

    /// One local rebalancing pass over `eligible` (in index order). Loads in
    /// `eligible` are updated to reflect the moves.
    async fn rebalance(&self, tx: &mut S::Tx, eligible: &mut [WorkerLoad], now: Time) -> Result<()> {
        let mut pass = RebalancePass::new(eligible.iter().map(|l| l.active_load).collect());
        debug!(target = pass.target(), workers = eligible.len(), "rebalancing");

        while let Some(transfer) = pass.next_transfer() {
            let donor = eligible[transfer.from].worker_id();
            let recipient = &eligible[transfer.to].worker;

            let batch = tx
                .movable_assignments(donor, recipient.capacity_range, transfer.count)
                .await?;
            let moved = batch.len() as u64;

            for mut assignment in batch {
                assignment.worker_id = recipient.id;
                assignment.assigned_at = now;
                tx.save_assignment(&assignment).await?;
                tx.append_history(&HistoryEntry::new(
                    assignment.work_item_id,
                    recipient.id,
                    Some(donor),
                    ChangeReason::Rebalanced,
                    now,
                ))
                .await?;
            }

            if moved > 0 {
                info!(
                    from = %donor,
                    to = %recipient.id,
                    moved,
                    requested = transfer.count,
                    "Moved work items"
                );
            }
            pass.settle(transfer, moved);
        }

        for (load, settled) in eligible.iter_mut().zip(pass.loads()) {
            load.active_load = *settled;
        }
        Ok(())
    }

    // === Reassignment ===

    /// Move a work item's active assignment to `target`.
    ///
    /// With no active assignment the configured policy places the item and
    /// `target` is not consulted.
    pub async fn reassign(&self, work_item_id: WorkItemId, target: WorkerId) -> Result<ReassignOutcome> {
        self.run("reassign", move || self.reassign_once(work_item_id, target))
            .await
    }

    async fn reassign_once(&self, work_item_id: WorkItemId, target: WorkerId) -> Result<ReassignOutcome> {
        let mut tx = self.storage.begin().await?;
        let item = load_item(&mut tx, work_item_id).await?;
        let worker = load_worker(&mut tx, target).await?;
        let now = leadflow_core::now();

        let outcome = match tx.active_assignment(item.id).await? {
            None => {
                let result = self.assign_in(&mut tx, &item, self.config.policy, now).await?;
                ReassignOutcome::AutoAssigned(result)
            }
            Some(active)
                if active.worker_id == target && self.config.same_worker == SameWorkerPolicy::NoOp =>
            {
                debug!(work_item = %item.id, worker = %target, "reassign onto current worker; no-op");
                ReassignOutcome::Unchanged(target)
            }
            Some(mut active) => {
                if !worker.accepts(item.sort_key) {
                    return Err(EngineError::EligibilityMismatch {
                        sort_key: item.sort_key,
                        worker_id: target,
                        range: worker.capacity_range,
                    });
                }

                let from = active.worker_id;
                active.worker_id = target;
                active.assigned_at = now;
                tx.save_assignment(&active).await?;
                tx.append_history(&HistoryEntry::new(
                    item.id,
                    target,
                    Some(from),
                    ChangeReason::Reassigned,
                    now,
                ))
                .await?;

                info!(work_item = %item.id, %from, to = %target, "Work item reassigned");
                if from == target {
                    ReassignOutcome::Refreshed(target)
                } else {
                    ReassignOutcome::Moved { from, to: target }
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    // === Worker-side ===

    /// Mark the item's active assignment, held by `worker_id`, completed.
    pub async fn complete(&self, work_item_id: WorkItemId, worker_id: WorkerId) -> Result<Assignment> {
        self.run("complete", move || self.complete_once(work_item_id, worker_id))
            .await
    }

    async fn complete_once(&self, work_item_id: WorkItemId, worker_id: WorkerId) -> Result<Assignment> {
        let mut tx = self.storage.begin().await?;
        let item = load_item(&mut tx, work_item_id).await?;

        let mut assignment = match tx.active_assignment(item.id).await? {
            Some(a) if a.worker_id == worker_id => a,
            _ => {
                return Err(EngineError::NotAssigned {
                    work_item_id,
                    worker_id,
                })
            }
        };

        let now = leadflow_core::now();
        assignment.status = AssignmentStatus::Completed;
        tx.save_assignment(&assignment).await?;
        tx.append_history(&HistoryEntry::new(
            item.id,
            worker_id,
            None,
            ChangeReason::Completed,
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(work_item = %item.id, worker = %worker_id, "Work item completed");
        Ok(assignment)
    }

    // === Intake & admin ===

    /// Store a new work item, then assign it with the configured policy.
    ///
    /// The item is durable even if assignment fails afterwards.
    pub async fn submit(
        &self,
        label: impl Into<String>,
        sort_key: f64,
    ) -> Result<(WorkItem, AssignmentResult)> {
        check_sort_key(sort_key)?;
        let item = WorkItem::new(label, sort_key)?;

        self.run("submit", || self.insert_item_once(&item)).await?;
        info!(work_item = %item.id, sort_key, "Work item stored");

        let result = self.assign(item.id, item.sort_key).await?;
        Ok((item, result))
    }

    async fn insert_item_once(&self, item: &WorkItem) -> Result<()> {
        let mut tx = self.storage.begin().await?;
        tx.insert_work_item(item).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Register a new worker.
    pub async fn register_worker(
        &self,
        name: impl Into<String>,
        capacity_range: CapacityRange,
    ) -> Result<Worker> {
        let worker = Worker::new(name, capacity_range);
        self.run("register_worker", || self.save_worker_once(&worker)).await?;
        info!(worker = %worker.id, name = %worker.name, range = %worker.capacity_range, "Worker registered");
        Ok(worker)
    }

    async fn save_worker_once(&self, worker: &Worker) -> Result<()> {
        let mut tx = self.storage.begin().await?;
        tx.save_worker(worker).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Change a worker's capacity range.
    ///
    /// Existing assignments are left as they are even when they fall outside
    /// the new range.
    pub async fn update_worker_range(
        &self,
        worker_id: WorkerId,
        capacity_range: CapacityRange,
    ) -> Result<Worker> {
        self.run("update_worker_range", move || {
            self.update_range_once(worker_id, capacity_range)
        })
        .await
    }

    async fn update_range_once(&self, worker_id: WorkerId, capacity_range: CapacityRange) -> Result<Worker> {
        let mut tx = self.storage.begin().await?;
        let mut worker = load_worker(&mut tx, worker_id).await?;
        worker.capacity_range = capacity_range;
        tx.save_worker(&worker).await?;

        let mut stale = 0usize;
        for assignment in tx.assignments_for_worker(worker_id, AssignmentStatus::Active).await? {
            if let Some(item) = tx.load_work_item(assignment.work_item_id).await? {
                if !capacity_range.contains(item.sort_key) {
                    stale += 1;
                }
            }
        }
        tx.commit().await?;

        info!(worker = %worker_id, range = %capacity_range, "Worker range updated");
        if stale > 0 {
            warn!(worker = %worker_id, stale, "active assignments now outside the worker's range");
        }
        Ok(worker)
    }

    // === Queries ===

    /// Look up a stored work item.
    pub async fn work_item(&self, work_item_id: WorkItemId) -> Result<WorkItem> {
        self.run("work_item", move || self.work_item_once(work_item_id)).await
    }

    async fn work_item_once(&self, work_item_id: WorkItemId) -> Result<WorkItem> {
        let mut tx = self.storage.begin().await?;
        let item = load_item(&mut tx, work_item_id).await?;
        tx.rollback().await?;
        Ok(item)
    }

    /// Eligible workers for `sort_key`, in index order.
    pub async fn find_eligible(&self, sort_key: f64) -> Result<Vec<WorkerLoad>> {
        check_sort_key(sort_key)?;
        self.run("find_eligible", move || self.find_eligible_once(sort_key))
            .await
    }

    async fn find_eligible_once(&self, sort_key: f64) -> Result<Vec<WorkerLoad>> {
        let mut tx = self.storage.begin().await?;
        let eligible = self.index.find_eligible(&mut tx, sort_key).await?;
        tx.rollback().await?;
        Ok(eligible)
    }

    /// Every worker with its active load, in index order.
    pub async fn worker_loads(&self) -> Result<Vec<WorkerLoad>> {
        self.run("worker_loads", || self.worker_loads_once()).await
    }

    async fn worker_loads_once(&self) -> Result<Vec<WorkerLoad>> {
        let mut tx = self.storage.begin().await?;
        let mut loads = tx.worker_loads().await?;
        tx.rollback().await?;
        EligibilityIndex::order(&mut loads);
        Ok(loads)
    }

    /// A worker's active assignments, oldest first.
    pub async fn active_assignments(&self, worker_id: WorkerId) -> Result<Vec<Assignment>> {
        self.run("active_assignments", move || self.active_assignments_once(worker_id))
            .await
    }

    async fn active_assignments_once(&self, worker_id: WorkerId) -> Result<Vec<Assignment>> {
        let mut tx = self.storage.begin().await?;
        load_worker(&mut tx, worker_id).await?;
        let rows = tx.assignments_for_worker(worker_id, AssignmentStatus::Active).await?;
        tx.rollback().await?;
        Ok(rows)
    }

    /// Assignment history of a work item, newest first.
    pub async fn history(&self, work_item_id: WorkItemId) -> Result<Vec<HistoryEntry>> {
        self.run("history", move || self.history_once(work_item_id)).await
    }

    async fn history_once(&self, work_item_id: WorkItemId) -> Result<Vec<HistoryEntry>> {
        let mut tx = self.storage.begin().await?;
        load_item(&mut tx, work_item_id).await?;
        let entries = tx.history(work_item_id).await?;
        tx.rollback().await?;
        Ok(entries)
    }

    // === Transaction discipline ===

    /// Run `attempt` under the operation timeout, retrying once on a
    /// serialization conflict.
    async fn run<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.operation_timeout();
        let retrying = async {
            match attempt().await {
                Err(e) if e.is_conflict() => {
                    warn!(op, error = %e, "serialization conflict, retrying once");
                    attempt().await
                }
                other => other,
            }
        };

        match tokio::time::timeout(timeout, retrying).await {
            Ok(result) => result.map_err(EngineError::surface),
            Err(_) => {
                warn!(op, ?timeout, "operation timed out; rolled back");
                Err(EngineError::TransientStoreFailure(format!(
                    "{op} timed out after {timeout:?}"
                )))
            }
        }
    }
}

fn check_sort_key(sort_key: f64) -> Result<()> {
    if sort_key.is_finite() {
        Ok(())
    } else {
        Err(EngineError::InvalidSortKey(sort_key))
    }
}

async fn load_item<T: Transaction>(tx: &mut T, id: WorkItemId) -> Result<WorkItem> {
    tx.load_work_item(id)
        .await?
        .ok_or(EngineError::WorkItemNotFound(id))
}

async fn load_worker<T: Transaction>(tx: &mut T, id: WorkerId) -> Result<Worker> {
    tx.load_worker(id).await?.ok_or(EngineError::WorkerNotFound(id))
}
