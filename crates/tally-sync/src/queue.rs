//! In-memory queue of deferred sync operations.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use tally_core::Task;

/// What kind of change a deferred operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

/// One deferred operation. `task` carries the record snapshot to push;
/// delete operations have none.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    pub task_id: String,
    pub action: SyncAction,
    pub task: Option<Task>,
}

impl PendingOp {
    pub fn create(task: Task) -> Self {
        Self {
            task_id: task.id.clone(),
            action: SyncAction::Create,
            task: Some(task),
        }
    }

    pub fn update(task: Task) -> Self {
        Self {
            task_id: task.id.clone(),
            action: SyncAction::Update,
            task: Some(task),
        }
    }

    pub fn delete(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            action: SyncAction::Delete,
            task: None,
        }
    }
}

/// FIFO queue deduplicated by `(task_id, action)`.
#[derive(Debug, Default)]
pub struct OpQueue {
    ops: VecDeque<PendingOp>,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an operation. An operation already queued under the same
    /// `(task_id, action)` pair is replaced in place (last value wins) and
    /// keeps its original queue position. The pair is the whole key: an
    /// `update` for an id never displaces a queued `create` for that id,
    /// so the create still flushes first.
    pub fn enqueue(&mut self, op: PendingOp) {
        if let Some(existing) = self
            .ops
            .iter_mut()
            .find(|e| e.task_id == op.task_id && e.action == op.action)
        {
            *existing = op;
        } else {
            self.ops.push_back(op);
        }
    }

    /// Take everything, grouped by action for batch processing. Groups
    /// appear in first-enqueue order, and operations keep their FIFO order
    /// within each group.
    pub fn drain_groups(&mut self) -> Vec<(SyncAction, Vec<PendingOp>)> {
        let mut order: Vec<SyncAction> = Vec::new();
        let mut buckets: HashMap<SyncAction, Vec<PendingOp>> = HashMap::new();
        for op in self.ops.drain(..) {
            if !buckets.contains_key(&op.action) {
                order.push(op.action);
            }
            buckets.entry(op.action).or_default().push(op);
        }
        order
            .into_iter()
            .map(|action| {
                let ops = buckets.remove(&action).unwrap_or_default();
                (action, ops)
            })
            .collect()
    }

    /// Put operations back at the front, preserving their order. Used when
    /// connectivity drops mid-drain.
    pub fn requeue_front(&mut self, ops: Vec<PendingOp>) {
        for op in ops.into_iter().rev() {
            self.ops.push_front(op);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
