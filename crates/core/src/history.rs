//! Assignment history - the append-only audit log.

use serde::{Deserialize, Serialize};

use crate::{CoreError, HistoryEntryId, Time, WorkItemId, WorkerId};

/// One change to a work item's assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unique identifier
    pub id: HistoryEntryId,

    /// The work item that changed
    pub work_item_id: WorkItemId,

    /// Worker holding the item after the change
    pub worker_id: WorkerId,

    /// Worker holding the item before the change, for moves
    pub previous_worker_id: Option<WorkerId>,

    /// What caused the change
    pub reason: ChangeReason,

    /// When the change was committed
    pub recorded_at: Time,
}

impl HistoryEntry {
    /// Create a new history entry.
    pub fn new(
        work_item_id: WorkItemId,
        worker_id: WorkerId,
        previous_worker_id: Option<WorkerId>,
        reason: ChangeReason,
        recorded_at: Time,
    ) -> Self {
        Self {
            id: HistoryEntryId::new(),
            work_item_id,
            worker_id,
            previous_worker_id,
            reason,
            recorded_at,
        }
    }
}

/// Cause of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeReason {
    /// First assignment of the item
    Assigned,
    /// Moved by a rebalancing pass
    Rebalanced,
    /// Moved by an explicit reassignment
    Reassigned,
    /// Closed by the worker
    Completed,
}

impl ChangeReason {
    /// Stable string form, used by storage backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::Assigned => "assigned",
            ChangeReason::Rebalanced => "rebalanced",
            ChangeReason::Reassigned => "reassigned",
            ChangeReason::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(ChangeReason::Assigned),
            "rebalanced" => Ok(ChangeReason::Rebalanced),
            "reassigned" => Ok(ChangeReason::Reassigned),
            "completed" => Ok(ChangeReason::Completed),
            other => Err(CoreError::UnknownReason(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        for reason in [
            ChangeReason::Assigned,
            ChangeReason::Rebalanced,
            ChangeReason::Reassigned,
            ChangeReason::Completed,
        ] {
            assert_eq!(reason.as_str().parse::<ChangeReason>().unwrap(), reason);
        }
        assert!("moved".parse::<ChangeReason>().is_err());
    }
}
