//! Eligibility & load index.
//!
//! Answers "which workers may take an item with this sort key, and how busy
//! is each of them", ordered the way the engine consumes the answer.

use std::cmp::Ordering;

use leadflow_core::WorkerLoad;
use leadflow_storage::{Result, Transaction};
use tracing::debug;

/// Ordering and lookup of eligible workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct EligibilityIndex;

impl EligibilityIndex {
    /// Create a new index.
    pub fn new() -> Self {
        Self
    }

    /// Workers whose range contains `sort_key`, fewest active assignments
    /// first, oldest worker first among equals.
    ///
    /// An empty result is a normal outcome. Reads only.
    pub async fn find_eligible<T: Transaction>(
        &self,
        tx: &mut T,
        sort_key: f64,
    ) -> Result<Vec<WorkerLoad>> {
        let mut eligible = tx.eligible_workers(sort_key).await?;
        // Backends filter already; this keeps the contract independent of them.
        eligible.retain(|load| load.worker.accepts(sort_key));
        Self::order(&mut eligible);
        debug!(sort_key, eligible = eligible.len(), "eligibility lookup");
        Ok(eligible)
    }

    /// Sort loads into index order.
    pub fn order(loads: &mut [WorkerLoad]) {
        loads.sort_by(Self::compare);
    }

    /// Index order: load ascending, then `created_at` ascending, then id.
    pub fn compare(a: &WorkerLoad, b: &WorkerLoad) -> Ordering {
        a.active_load
            .cmp(&b.active_load)
            .then_with(|| a.worker.created_at.cmp(&b.worker.created_at))
            .then_with(|| a.worker.id.cmp(&b.worker.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use leadflow_core::{Assignment, CapacityRange, WorkItem, Worker};
    use leadflow_storage::{MemoryStorage, Storage};

    fn worker_at(name: &str, min: f64, max: f64, age_secs: i64) -> Worker {
        let mut worker = Worker::new(name, CapacityRange::new(min, max).unwrap());
        worker.created_at = leadflow_core::now() - Duration::seconds(age_secs);
        worker
    }

    fn load(worker: &Worker, active_load: u64) -> WorkerLoad {
        WorkerLoad {
            worker: worker.clone(),
            active_load,
        }
    }

    #[test]
    fn test_order_by_load_then_age() {
        let old = worker_at("old", 0.0, 10.0, 100);
        let young = worker_at("young", 0.0, 10.0, 10);
        let busy = worker_at("busy", 0.0, 10.0, 1000);

        let mut loads = vec![load(&busy, 3), load(&young, 1), load(&old, 1)];
        EligibilityIndex::order(&mut loads);

        let names: Vec<_> = loads.iter().map(|l| l.worker.name.as_str()).collect();
        assert_eq!(names, vec!["old", "young", "busy"]);
    }

    #[tokio::test]
    async fn test_find_eligible_filters_by_range() {
        let storage = MemoryStorage::new();
        let a = worker_at("a", 1000.0, 5000.0, 30);
        let b = worker_at("b", 1000.0, 5000.0, 20);
        let c = worker_at("c", 5000.01, 9000.0, 10);

        let mut tx = storage.begin().await.unwrap();
        for w in [&a, &b, &c] {
            tx.save_worker(w).await.unwrap();
        }
        for _ in 0..2 {
            let item = WorkItem::new("lead", 1500.0).unwrap();
            tx.insert_work_item(&item).await.unwrap();
            tx.save_assignment(&Assignment::active(item.id, a.id, leadflow_core::now()))
                .await
                .unwrap();
        }

        let index = EligibilityIndex::new();
        let eligible = index.find_eligible(&mut tx, 2000.0).await.unwrap();
        let ids: Vec<_> = eligible.iter().map(|l| l.worker_id()).collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert_eq!(eligible[1].active_load, 2);

        for key in [1000.0, 2000.0, 5000.0, 5000.01, 9000.0] {
            for entry in index.find_eligible(&mut tx, key).await.unwrap() {
                let range = entry.worker.capacity_range;
                assert!(range.min <= key && key <= range.max);
            }
        }
    }

    #[tokio::test]
    async fn test_find_eligible_empty_is_ok() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin().await.unwrap();
        tx.save_worker(&worker_at("a", 1000.0, 5000.0, 1)).await.unwrap();

        let eligible = EligibilityIndex::new().find_eligible(&mut tx, 999_999.0).await.unwrap();
        assert!(eligible.is_empty());
    }
}
