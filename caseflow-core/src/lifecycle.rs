//! Transition tables, one per plan item kind.
//!
//! A row reads "`transition` is legal from any of `from` and leads to `to`".
//! `Resume` is listed with a placeholder target; the real target is the
//! state recorded when the item was suspended.

use crate::types::PlanItemKind;
use crate::types::PlanItemState::{self, *};
use crate::types::{PlanItemInstance, Transition};

pub type Row = (Transition, &'static [PlanItemState], PlanItemState);

const WAITING: &[PlanItemState] = &[Available, Unavailable, WaitingForRepetition];
const STARTABLE: &[PlanItemState] = &[Available, Unavailable, WaitingForRepetition, Enabled];
const LIVE: &[PlanItemState] = &[
    Available,
    Unavailable,
    Enabled,
    Active,
    Suspended,
    WaitingForRepetition,
];
const SUSPENDABLE: &[PlanItemState] = &[Active, Enabled];

/// Stages, human tasks and service tasks: work that completes.
const TASK_TABLE: &[Row] = &[
    (Transition::Enable, WAITING, Enabled),
    (Transition::Start, STARTABLE, Active),
    (Transition::Complete, &[Active], Completed),
    (Transition::Terminate, LIVE, Terminated),
    (Transition::Exit, LIVE, Terminated),
    (Transition::Suspend, SUSPENDABLE, Suspended),
    (Transition::Resume, &[Suspended], Active),
    (Transition::Fault, &[Active], Failed),
];

/// Stages cannot fault; a failing child faults instead.
const STAGE_TABLE: &[Row] = &[
    (Transition::Enable, WAITING, Enabled),
    (Transition::Start, STARTABLE, Active),
    (Transition::Complete, &[Active], Completed),
    (Transition::Terminate, LIVE, Terminated),
    (Transition::Exit, LIVE, Terminated),
    (Transition::Suspend, SUSPENDABLE, Suspended),
    (Transition::Resume, &[Suspended], Active),
];

/// Milestones and event listeners: they occur rather than complete.
const OCCURRENCE_TABLE: &[Row] = &[
    (Transition::Start, WAITING, Active),
    (Transition::Occur, &[Active], Completed),
    (Transition::Terminate, LIVE, Terminated),
    (Transition::Exit, LIVE, Terminated),
    (Transition::Suspend, &[Active], Suspended),
    (Transition::Resume, &[Suspended], Active),
];

pub fn table(kind: PlanItemKind) -> &'static [Row] {
    match kind {
        PlanItemKind::Stage => STAGE_TABLE,
        PlanItemKind::HumanTask | PlanItemKind::ServiceTask => TASK_TABLE,
        PlanItemKind::Milestone
        | PlanItemKind::EventListener
        | PlanItemKind::TimerEventListener => OCCURRENCE_TABLE,
    }
}

/// Target state of `transition` from `from`, or `None` if it is illegal.
pub fn target(kind: PlanItemKind, from: PlanItemState, transition: Transition) -> Option<PlanItemState> {
    table(kind)
        .iter()
        .find(|(t, sources, _)| *t == transition && sources.contains(&from))
        .map(|(_, _, to)| *to)
}

/// Like [`target`], resolving `Resume` to the state held before suspension.
pub fn next_state(item: &PlanItemInstance, transition: Transition) -> Option<PlanItemState> {
    let to = target(item.kind, item.state, transition)?;
    if transition == Transition::Resume {
        return Some(item.state_before_suspend.unwrap_or(to));
    }
    Some(to)
}
