//! Sentry evaluation.
//!
//! A sentry instance records which on-parts of one sentry have been seen for
//! one plan item during its current activation cycle. On-parts combine with
//! AND; OR is expressed with several sentries, each evaluated on its own.
//! Once every on-part is satisfied the if-part decides. A false if-part keeps
//! the record, so the sentry is retried on the next matching event or
//! variable change. A satisfied sentry fires exactly once per cycle.
//!
//! When one event satisfies several sentries they fire in declaration order:
//! plan item declaration index, entry before exit, sentry index, then the
//! instance creation sequence.

use crate::agenda::Operation;
use crate::context::CommandContext;
use crate::definition::{PlanItemDefinition, SentryDefinition, SentryRole};
use crate::error::EngineError;
use crate::subscription;
use crate::types::*;
use uuid::Uuid;

type FiringKey = (usize, SentryRole, usize, u64, Uuid, String);

/// Feed a standard event of `source_definition_id` to the sentries waiting for it.
pub(crate) fn on_standard_event(
    ctx: &mut CommandContext,
    case_id: Uuid,
    source_plan_item_id: Uuid,
    source_definition_id: &str,
    event: StandardEvent,
) -> Result<(), EngineError> {
    let subscriptions = subscription::find_on_part(ctx, case_id, source_definition_id, event);
    if subscriptions.is_empty() {
        return Ok(());
    }
    let def = ctx.definition(case_id)?;

    let mut order: Vec<FiringKey> = Vec::new();
    for sub in subscriptions {
        let Some(sentry_id) = sub.sentry_id else {
            continue;
        };
        let Ok(item) = ctx.plan_item(sub.plan_item_id) else {
            continue;
        };
        let item_def = CommandContext::item_definition(&def, item)?;
        if let Some((role, index, _)) = item_def.sentry(&sentry_id) {
            order.push((
                item_def.declaration_index,
                role,
                index,
                item.creation_seq,
                item.id,
                sentry_id,
            ));
        }
    }
    order.sort();
    order.dedup();

    tracing::trace!(
        case_id = %case_id,
        source = %source_plan_item_id,
        event = %event,
        candidates = order.len(),
        "Sentry: dispatching standard event"
    );

    for (_, role, _, _, plan_item_id, sentry_id) in order {
        let item = ctx.plan_item(plan_item_id)?.clone();
        if !is_armed(&item, role) {
            continue;
        }
        let item_def = CommandContext::item_definition(&def, &item)?;
        let Some((_, _, sentry)) = item_def.sentry(&sentry_id) else {
            continue;
        };

        let matching: Vec<usize> = sentry
            .on_parts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.source == source_definition_id && p.event == event)
            .map(|(i, _)| i)
            .collect();
        if matching.is_empty() {
            continue;
        }

        let instance_id = instance_for(ctx, &item, &sentry.id);
        let Some(instance) = ctx.sentries.get_mut(&instance_id) else {
            continue;
        };
        if instance.satisfied {
            continue;
        }
        instance.satisfied_on_parts.extend(matching);

        try_fire(ctx, &item, role, sentry, instance_id)?;
    }
    Ok(())
}

/// Evaluate if-part-only sentries of a freshly created plan item.
pub(crate) fn on_created(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    item_def: &PlanItemDefinition,
) -> Result<(), EngineError> {
    for role in [SentryRole::Entry, SentryRole::Exit] {
        if !is_armed(item, role) {
            continue;
        }
        for sentry in item_def.sentries(role) {
            if sentry.on_parts.is_empty() {
                evaluate_if_only(ctx, item, role, sentry)?;
            }
        }
    }
    Ok(())
}

/// Retry every armed sentry whose outcome depends on case variables.
pub(crate) fn on_variables_changed(
    ctx: &mut CommandContext,
    case_id: Uuid,
) -> Result<(), EngineError> {
    let def = ctx.definition(case_id)?;
    let mut items: Vec<(usize, u64, PlanItemInstance)> = Vec::new();
    for item in ctx.case_plan_items(case_id) {
        if item.state.is_terminal() {
            continue;
        }
        let item_def = CommandContext::item_definition(&def, item)?;
        items.push((item_def.declaration_index, item.creation_seq, item.clone()));
    }
    items.sort_by_key(|(index, seq, _)| (*index, *seq));

    for (_, _, item) in items {
        let item_def = CommandContext::item_definition(&def, &item)?;
        for role in [SentryRole::Entry, SentryRole::Exit] {
            for sentry in item_def.sentries(role) {
                // Earlier firings may have moved the item on.
                let current = ctx.plan_item(item.id)?.clone();
                if !is_armed(&current, role) {
                    break;
                }
                if sentry.if_part.is_none() {
                    continue;
                }
                if sentry.on_parts.is_empty() {
                    evaluate_if_only(ctx, &current, role, sentry)?;
                } else if let Some(instance_id) = existing_instance(ctx, item.id, &sentry.id) {
                    try_fire(ctx, &current, role, sentry, instance_id)?;
                }
            }
        }
    }
    Ok(())
}

/// Forget the sentry state of one role, starting a new activation cycle.
pub(crate) fn rearm(
    ctx: &mut CommandContext,
    plan_item_id: Uuid,
    item_def: &PlanItemDefinition,
    role: SentryRole,
) {
    let doomed: Vec<Uuid> = ctx
        .sentries
        .values()
        .filter(|s| {
            s.plan_item_id == plan_item_id
                && item_def.sentries(role).iter().any(|d| d.id == s.sentry_id)
        })
        .map(|s| s.id)
        .collect();
    for id in doomed {
        ctx.sentries.delete(&id);
    }
}

pub(crate) fn clear_for_plan_item(ctx: &mut CommandContext, plan_item_id: Uuid) {
    let doomed: Vec<Uuid> = ctx
        .sentries
        .values()
        .filter(|s| s.plan_item_id == plan_item_id)
        .map(|s| s.id)
        .collect();
    for id in doomed {
        ctx.sentries.delete(&id);
    }
}

pub(crate) fn clear_for_case(ctx: &mut CommandContext, case_id: Uuid) {
    let doomed: Vec<Uuid> = ctx
        .sentries
        .values()
        .filter(|s| s.case_id == case_id)
        .map(|s| s.id)
        .collect();
    for id in doomed {
        ctx.sentries.delete(&id);
    }
}

/// Entry sentries guard waiting items; exit sentries guard any live item.
fn is_armed(item: &PlanItemInstance, role: SentryRole) -> bool {
    match role {
        SentryRole::Entry => item.state.is_waiting(),
        SentryRole::Exit => !item.state.is_terminal(),
    }
}

fn existing_instance(ctx: &CommandContext, plan_item_id: Uuid, sentry_id: &str) -> Option<Uuid> {
    ctx.sentries
        .values()
        .find(|s| s.plan_item_id == plan_item_id && s.sentry_id == sentry_id)
        .map(|s| s.id)
}

fn instance_for(ctx: &mut CommandContext, item: &PlanItemInstance, sentry_id: &str) -> Uuid {
    if let Some(id) = existing_instance(ctx, item.id, sentry_id) {
        return id;
    }
    let instance = SentryInstance {
        id: Uuid::now_v7(),
        case_id: item.case_id,
        plan_item_id: item.id,
        sentry_id: sentry_id.to_string(),
        satisfied_on_parts: Default::default(),
        satisfied: false,
        fired_at: None,
    };
    let id = instance.id;
    ctx.sentries.insert_new(instance);
    id
}

fn evaluate_if_only(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    role: SentryRole,
    sentry: &SentryDefinition,
) -> Result<(), EngineError> {
    if let Some(id) = existing_instance(ctx, item.id, &sentry.id) {
        if ctx.sentries.get(&id).is_some_and(|s| s.satisfied) {
            return Ok(());
        }
    }
    let Some(expression) = &sentry.if_part else {
        return Ok(());
    };
    if ctx.evaluate_condition(item.case_id, expression)? {
        let instance_id = instance_for(ctx, item, &sentry.id);
        fire(ctx, item, role, &sentry.id, instance_id);
    }
    Ok(())
}

fn try_fire(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    role: SentryRole,
    sentry: &SentryDefinition,
    instance_id: Uuid,
) -> Result<bool, EngineError> {
    let Some(instance) = ctx.sentries.get(&instance_id) else {
        return Ok(false);
    };
    if instance.satisfied || instance.satisfied_on_parts.len() < sentry.on_parts.len() {
        return Ok(false);
    }
    if let Some(expression) = &sentry.if_part {
        if !ctx.evaluate_condition(item.case_id, expression)? {
            tracing::debug!(
                plan_item_id = %item.id,
                sentry = %sentry.id,
                "Sentry: on-parts satisfied, if-part false"
            );
            return Ok(false);
        }
    }
    fire(ctx, item, role, &sentry.id, instance_id);
    Ok(true)
}

fn fire(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    role: SentryRole,
    sentry_id: &str,
    instance_id: Uuid,
) {
    let now = ctx.now();
    if let Some(instance) = ctx.sentries.get_mut(&instance_id) {
        instance.satisfied = true;
        instance.fired_at = Some(now);
    }
    let op = match role {
        SentryRole::Entry => Operation::Activate {
            plan_item_id: item.id,
        },
        SentryRole::Exit => Operation::Transition {
            plan_item_id: item.id,
            transition: Transition::Exit,
        },
    };
    tracing::debug!(
        case_id = %item.case_id,
        plan_item_id = %item.id,
        definition_id = %item.definition_id,
        sentry = %sentry_id,
        role = ?role,
        "Sentry fired"
    );
    ctx.push(op);
}
