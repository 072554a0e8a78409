use crate::error::EngineError;
use crate::types::{StandardEvent, Transition};
use std::collections::VecDeque;
use uuid::Uuid;

/// A pending state-machine step. Operations only carry ids; everything else
/// is resolved through the command context when they run.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Enter a waiting plan item: `Start`, or `Enable` under manual activation.
    /// Skipped if the item stopped waiting in the meantime.
    Activate { plan_item_id: Uuid },
    /// Internally scheduled transition. Skipped when no longer legal.
    Transition {
        plan_item_id: Uuid,
        transition: Transition,
    },
    /// Feed a standard event to the sentries listening for it.
    NotifyDependents {
        case_id: Uuid,
        source_plan_item_id: Uuid,
        source_definition_id: String,
        event: StandardEvent,
    },
    EvaluateStageCompletion { stage_id: Uuid },
    /// Re-check if-parts after the case variables changed.
    EvaluateVariableSentries { case_id: Uuid },
    /// Invoke the behavior bound to a synchronous service task.
    RunServiceTask { plan_item_id: Uuid },
}

impl Operation {
    /// Plan item this operation will act on, if any.
    pub fn target(&self) -> Option<Uuid> {
        match self {
            Operation::Activate { plan_item_id }
            | Operation::Transition { plan_item_id, .. }
            | Operation::RunServiceTask { plan_item_id } => Some(*plan_item_id),
            Operation::EvaluateStageCompletion { stage_id } => Some(*stage_id),
            Operation::NotifyDependents { .. } | Operation::EvaluateVariableSentries { .. } => {
                None
            }
        }
    }
}

/// FIFO of operations for one command, with a hard cap on how many run.
#[derive(Debug)]
pub struct Agenda {
    queue: VecDeque<Operation>,
    executed: usize,
    limit: usize,
}

impl Agenda {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            executed: 0,
            limit,
        }
    }

    pub fn push(&mut self, op: Operation) {
        self.queue.push_back(op);
    }

    pub fn next(&mut self) -> Result<Option<Operation>, EngineError> {
        let Some(op) = self.queue.pop_front() else {
            return Ok(None);
        };
        self.executed += 1;
        if self.executed > self.limit {
            return Err(EngineError::AgendaOverflow { limit: self.limit });
        }
        Ok(Some(op))
    }

    /// True while work that changes `plan_item_id`'s state is still queued.
    pub fn has_pending_for(&self, plan_item_id: Uuid) -> bool {
        self.queue.iter().any(|op| {
            !matches!(op, Operation::EvaluateStageCompletion { .. })
                && op.target() == Some(plan_item_id)
        })
    }
}
