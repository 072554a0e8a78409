//! Plan item state machine: creation, transitions, stage completion and
//! repetition. Every function takes the open command context; nothing here
//! touches the store directly.

use crate::agenda::Operation;
use crate::behavior;
use crate::context::CommandContext;
use crate::definition::{CaseDefinition, ParentCompletionRule, PlanItemDefinition, SentryRole};
use crate::error::EngineError;
use crate::events::{LifecycleEvent, TransitionRecord};
use crate::lifecycle;
use crate::sentry;
use crate::subscription;
use crate::types::*;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Instantiate `item_def` under `parent_id` (or as the case root).
///
/// The item starts `Available` when it has no entry sentries and is then
/// activated by the agenda; otherwise it waits in `Unavailable` (or
/// `WaitingForRepetition` for a repetition).
pub fn create(
    ctx: &mut CommandContext,
    case_id: Uuid,
    parent_id: Option<Uuid>,
    item_def: &PlanItemDefinition,
    repetition_index: u32,
) -> Result<Uuid, EngineError> {
    if let Some(parent_id) = parent_id {
        let parent = ctx.plan_item(parent_id)?;
        if parent.state != PlanItemState::Active {
            return Err(EngineError::InvalidParentState {
                parent_id,
                state: parent.state,
            });
        }
    }

    let state = if item_def.entry_criteria.is_empty() {
        PlanItemState::Available
    } else if repetition_index > 0 {
        PlanItemState::WaitingForRepetition
    } else {
        PlanItemState::Unavailable
    };
    let now = ctx.now();
    let item = PlanItemInstance {
        id: Uuid::now_v7(),
        case_id,
        parent_id,
        definition_id: item_def.id.clone(),
        kind: item_def.kind(),
        name: item_def.name.clone(),
        state,
        state_before_suspend: None,
        timestamps: PlanItemTimestamps {
            created: now,
            ..Default::default()
        },
        repetition_index,
        creation_seq: ctx.next_creation_seq(case_id),
    };
    ctx.plan_items.insert_new(item.clone());
    subscription::register_on_parts(ctx, &item, item_def);

    tracing::debug!(
        case_id = %case_id,
        plan_item_id = %item.id,
        definition_id = %item.definition_id,
        kind = ?item.kind,
        state = %state,
        repetition_index,
        "PlanItem created"
    );

    if state == PlanItemState::Available {
        ctx.push(Operation::Activate {
            plan_item_id: item.id,
        });
    }
    sentry::on_created(ctx, &item, item_def)?;
    Ok(item.id)
}

/// Agenda entry point for a waiting item whose turn has come.
pub(crate) fn activate(ctx: &mut CommandContext, plan_item_id: Uuid) -> Result<(), EngineError> {
    let item = ctx.plan_item(plan_item_id)?.clone();
    if !item.state.is_waiting() {
        tracing::trace!(plan_item_id = %plan_item_id, state = %item.state, "Activate skipped");
        return Ok(());
    }
    if ctx.case(item.case_id)?.state != CaseState::Active {
        tracing::debug!(plan_item_id = %plan_item_id, "Activate held until the case resumes");
        return Ok(());
    }
    let def = ctx.definition(item.case_id)?;
    let item_def = CommandContext::item_definition(&def, &item)?;
    let transition = if item_def.manual_activation {
        Transition::Enable
    } else {
        Transition::Start
    };
    transition_item(ctx, &def, item, transition)
}

/// Apply `transition` to a plan item. Fails with `IllegalStateTransition`
/// when the kind's table has no such row for the current state.
pub fn transition(
    ctx: &mut CommandContext,
    plan_item_id: Uuid,
    transition: Transition,
) -> Result<(), EngineError> {
    let item = ctx.plan_item(plan_item_id)?.clone();
    let def = ctx.definition(item.case_id)?;
    transition_item(ctx, &def, item, transition)
}

/// Agenda variant of [`transition`]: a transition that became illegal while
/// it was queued is dropped.
pub(crate) fn transition_if_allowed(
    ctx: &mut CommandContext,
    plan_item_id: Uuid,
    transition: Transition,
) -> Result<(), EngineError> {
    let item = ctx.plan_item(plan_item_id)?;
    if lifecycle::next_state(item, transition).is_none() {
        tracing::debug!(
            plan_item_id = %plan_item_id,
            state = %item.state,
            transition = %transition,
            "Queued transition no longer applies"
        );
        return Ok(());
    }
    self::transition(ctx, plan_item_id, transition)
}

fn transition_item(
    ctx: &mut CommandContext,
    def: &CaseDefinition,
    item: PlanItemInstance,
    transition: Transition,
) -> Result<(), EngineError> {
    let to = lifecycle::next_state(&item, transition).ok_or(
        EngineError::IllegalStateTransition {
            plan_item_id: item.id,
            kind: item.kind,
            state: item.state,
            transition,
        },
    )?;
    let item_def = CommandContext::item_definition(def, &item)?;

    if item.kind == PlanItemKind::Stage && to.is_terminal() {
        terminate_descendants(ctx, def, item.id)?;
    }

    apply(ctx, &item, item_def, transition, to)?;

    if transition == Transition::Start {
        behavior::on_activated(ctx, item.id, item_def)?;
    }

    if to.is_terminal() {
        // Failed instances are not repeated.
        let successor = if to == PlanItemState::Failed {
            None
        } else {
            repeat_if_needed(ctx, &item, item_def)?
        };
        release_resources(ctx, &item, successor);
        match item.parent_id {
            Some(stage_id) => ctx.push(Operation::EvaluateStageCompletion { stage_id }),
            None => finish_case(ctx, item.case_id, to)?,
        }
    }
    Ok(())
}

/// Change state, stamp, record, and announce the standard event.
fn apply(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    item_def: &PlanItemDefinition,
    transition: Transition,
    to: PlanItemState,
) -> Result<(), EngineError> {
    let now = ctx.now();
    {
        let target = ctx.plan_item_mut(item.id)?;
        target.state = to;
        match transition {
            Transition::Suspend => target.state_before_suspend = Some(item.state),
            Transition::Resume => target.state_before_suspend = None,
            _ => {}
        }
        stamp(&mut target.timestamps, transition, now);
    }

    ctx.record_transition(TransitionRecord {
        case_id: item.case_id,
        plan_item_id: item.id,
        definition_id: item.definition_id.clone(),
        kind: item.kind,
        transition,
        from: item.state,
        to,
        at: now,
    });
    tracing::debug!(
        case_id = %item.case_id,
        plan_item_id = %item.id,
        definition_id = %item.definition_id,
        from = %item.state,
        to = %to,
        "PlanItem transition {}",
        transition
    );

    // Entry sentries are spent once the item leaves its waiting states.
    if item.state.is_waiting() && !to.is_waiting() {
        let entry_ids: BTreeSet<&str> = item_def
            .sentries(SentryRole::Entry)
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        subscription::remove_for_sentries(ctx, item.id, &entry_ids);
        sentry::rearm(ctx, item.id, item_def, SentryRole::Entry);
    }

    ctx.push(Operation::NotifyDependents {
        case_id: item.case_id,
        source_plan_item_id: item.id,
        source_definition_id: item.definition_id.clone(),
        event: transition.event(),
    });
    Ok(())
}

fn stamp(ts: &mut PlanItemTimestamps, transition: Transition, now: Timestamp) {
    ts.last_state_change = Some(now);
    match transition {
        Transition::Enable => ts.enabled = Some(now),
        Transition::Start => ts.activated = Some(now),
        Transition::Suspend => ts.suspended = Some(now),
        Transition::Resume => {}
        Transition::Complete => {
            ts.completed = Some(now);
            ts.ended = Some(now);
        }
        Transition::Occur => {
            ts.occurred = Some(now);
            ts.ended = Some(now);
        }
        Transition::Terminate => {
            ts.terminated = Some(now);
            ts.ended = Some(now);
        }
        Transition::Exit => {
            ts.exited = Some(now);
            ts.ended = Some(now);
        }
        Transition::Fault => ts.ended = Some(now),
    }
}

/// Terminate every live descendant of a stage, leaves before their parents.
fn terminate_descendants(
    ctx: &mut CommandContext,
    def: &CaseDefinition,
    stage_id: Uuid,
) -> Result<(), EngineError> {
    let mut order = Vec::new();
    let mut frontier = vec![stage_id];
    while let Some(parent) = frontier.pop() {
        let children: Vec<Uuid> = ctx.children_of(parent).iter().map(|c| c.id).collect();
        order.extend(children.iter().copied());
        frontier.extend(children);
    }

    for id in order.into_iter().rev() {
        let child = ctx.plan_item(id)?.clone();
        if child.state.is_terminal() {
            continue;
        }
        let child_def = CommandContext::item_definition(def, &child)?;
        apply(
            ctx,
            &child,
            child_def,
            Transition::Terminate,
            PlanItemState::Terminated,
        )?;
        release_resources(ctx, &child, None);
    }
    Ok(())
}

/// Create the next instance of a repeatable item, if its rule allows.
fn repeat_if_needed(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    item_def: &PlanItemDefinition,
) -> Result<Option<Uuid>, EngineError> {
    let (Some(rule), Some(parent_id)) = (&item_def.repetition, item.parent_id) else {
        return Ok(None);
    };
    if ctx.plan_item(parent_id)?.state != PlanItemState::Active {
        return Ok(None);
    }
    if let Some(condition) = &rule.condition {
        if !ctx.evaluate_condition(item.case_id, condition)? {
            return Ok(None);
        }
    }
    if let Some(max) = rule.max_instance_count {
        let instances = ctx
            .children_of(parent_id)
            .iter()
            .filter(|c| c.definition_id == item.definition_id)
            .count();
        if instances >= max as usize {
            tracing::debug!(
                plan_item_id = %item.id,
                max,
                "Repetition limit reached"
            );
            return Ok(None);
        }
    }
    let next = create(
        ctx,
        item.case_id,
        Some(parent_id),
        item_def,
        item.repetition_index + 1,
    )?;
    Ok(Some(next))
}

/// Drop subscriptions, sentry state and jobs of an item that just ended.
///
/// Pending timers of a timer listener pass to its repetition, so a cycle
/// keeps driving the listener across instances.
fn release_resources(ctx: &mut CommandContext, item: &PlanItemInstance, successor: Option<Uuid>) {
    subscription::remove_all_for_plan_item(ctx, item.id);
    sentry::clear_for_plan_item(ctx, item.id);

    let jobs: Vec<Uuid> = ctx
        .jobs
        .values()
        .filter(|j| j.plan_item_id == Some(item.id))
        .map(|j| j.id)
        .collect();
    for id in jobs {
        ctx.jobs.delete(&id);
    }

    let timers: Vec<Uuid> = ctx
        .timer_jobs
        .values()
        .filter(|t| t.plan_item_id == Some(item.id))
        .map(|t| t.id)
        .collect();
    for id in timers {
        match successor {
            Some(next) if item.kind == PlanItemKind::TimerEventListener => {
                if let Some(timer) = ctx.timer_jobs.get_mut(&id) {
                    timer.plan_item_id = Some(next);
                }
            }
            _ => {
                ctx.timer_jobs.delete(&id);
            }
        }
    }
}

fn finish_case(
    ctx: &mut CommandContext,
    case_id: Uuid,
    root_state: PlanItemState,
) -> Result<(), EngineError> {
    let state = if root_state == PlanItemState::Completed {
        CaseState::Completed
    } else {
        CaseState::Terminated
    };
    let now = ctx.now();
    {
        let case = ctx.case_mut(case_id)?;
        case.state = state;
        case.end_time = Some(now);
    }

    subscription::remove_all_for_case(ctx, case_id);
    sentry::clear_for_case(ctx, case_id);
    let jobs: Vec<Uuid> = ctx
        .jobs
        .values()
        .filter(|j| j.case_id == Some(case_id))
        .map(|j| j.id)
        .collect();
    for id in jobs {
        ctx.jobs.delete(&id);
    }
    let timers: Vec<Uuid> = ctx
        .timer_jobs
        .values()
        .filter(|t| t.case_id == Some(case_id))
        .map(|t| t.id)
        .collect();
    for id in timers {
        ctx.timer_jobs.delete(&id);
    }

    ctx.notify(match state {
        CaseState::Completed => LifecycleEvent::CaseCompleted { case_id, at: now },
        _ => LifecycleEvent::CaseTerminated { case_id, at: now },
    });
    tracing::info!(case_id = %case_id, state = ?state, "Case finished");
    Ok(())
}

/// Complete an active stage once none of its children hold it open.
///
/// Runs after every terminal transition of a direct child and once after
/// the stage creates its children; it is never polled.
pub(crate) fn evaluate_stage_completion(
    ctx: &mut CommandContext,
    stage_id: Uuid,
) -> Result<(), EngineError> {
    let stage = ctx.plan_item(stage_id)?;
    if stage.state != PlanItemState::Active {
        return Ok(());
    }
    let def = ctx.definition(stage.case_id)?;
    let children: Vec<PlanItemInstance> =
        ctx.children_of(stage_id).into_iter().cloned().collect();

    for child in &children {
        let child_def = CommandContext::item_definition(&def, child)?;
        if blocks_completion(ctx, child, child_def, &children) {
            tracing::trace!(
                stage_id = %stage_id,
                blocking = %child.definition_id,
                state = %child.state,
                "Stage stays active"
            );
            return Ok(());
        }
    }

    tracing::debug!(stage_id = %stage_id, "Stage auto-completes");
    transition(ctx, stage_id, Transition::Complete)
}

fn blocks_completion(
    ctx: &CommandContext,
    child: &PlanItemInstance,
    child_def: &PlanItemDefinition,
    siblings: &[PlanItemInstance],
) -> bool {
    let rule = child_def.parent_completion_rule;
    if rule == ParentCompletionRule::Ignore {
        return false;
    }
    if rule == ParentCompletionRule::IgnoreAfterFirstCompletion
        && siblings.iter().any(|s| {
            s.definition_id == child.definition_id && s.state == PlanItemState::Completed
        })
    {
        return false;
    }
    if ctx.has_pending_for(child.id) {
        return true;
    }
    match child.state {
        state if state.is_completable() => false,
        PlanItemState::Active | PlanItemState::Suspended | PlanItemState::Failed => true,
        PlanItemState::Enabled => rule != ParentCompletionRule::IgnoreIfAvailableOrEnabled,
        // Still waiting.
        _ => match rule {
            ParentCompletionRule::IgnoreIfAvailable
            | ParentCompletionRule::IgnoreIfAvailableOrEnabled => false,
            _ => child_def.required,
        },
    }
}
