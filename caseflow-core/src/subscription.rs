//! Event subscription registry.
//!
//! Subscriptions are rows, scoped to one case, loaded with the case and
//! resolved through the context cache. On-part subscriptions name the source
//! definition and the sentry they feed; event-listener subscriptions name
//! only the event.

use crate::context::CommandContext;
use crate::definition::{PlanItemDefinition, SentryRole};
use crate::error::EngineError;
use crate::plan_item;
use crate::types::*;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Subscribe a plan item to the events its entry and exit on-parts wait for.
pub(crate) fn register_on_parts(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    def: &PlanItemDefinition,
) {
    let mut seen = BTreeSet::new();
    for role in [SentryRole::Entry, SentryRole::Exit] {
        for sentry in def.sentries(role) {
            for on_part in &sentry.on_parts {
                let key = (sentry.id.as_str(), on_part.source.as_str(), on_part.event);
                if !seen.insert(key) {
                    continue;
                }
                ctx.subscriptions.insert_new(EventSubscription {
                    id: Uuid::now_v7(),
                    case_id: item.case_id,
                    plan_item_id: item.id,
                    event_name: on_part.event.as_str().to_string(),
                    source_definition_id: Some(on_part.source.clone()),
                    sentry_id: Some(sentry.id.clone()),
                    created_at: ctx.now(),
                });
            }
        }
    }
}

/// Subscribe an event listener to a named case event.
pub(crate) fn register_event(ctx: &mut CommandContext, item: &PlanItemInstance, event_name: &str) {
    ctx.subscriptions.insert_new(EventSubscription {
        id: Uuid::now_v7(),
        case_id: item.case_id,
        plan_item_id: item.id,
        event_name: event_name.to_string(),
        source_definition_id: None,
        sentry_id: None,
        created_at: ctx.now(),
    });
    tracing::debug!(
        case_id = %item.case_id,
        plan_item_id = %item.id,
        event = %event_name,
        "Subscribed event listener"
    );
}

/// On-part subscriptions waiting for `event` from `source_definition_id`.
pub(crate) fn find_on_part(
    ctx: &CommandContext,
    case_id: Uuid,
    source_definition_id: &str,
    event: StandardEvent,
) -> Vec<EventSubscription> {
    ctx.subscriptions
        .values()
        .filter(|s| {
            s.case_id == case_id
                && s.event_name == event.as_str()
                && s.source_definition_id.as_deref() == Some(source_definition_id)
        })
        .cloned()
        .collect()
}

/// Plan items listening for a named case event, in creation order.
pub(crate) fn find_listeners(ctx: &CommandContext, case_id: Uuid, event_name: &str) -> Vec<Uuid> {
    let mut ids: Vec<(u64, Uuid)> = ctx
        .subscriptions
        .values()
        .filter(|s| {
            s.case_id == case_id && s.source_definition_id.is_none() && s.event_name == event_name
        })
        .filter_map(|s| {
            ctx.plan_items
                .get(&s.plan_item_id)
                .map(|p| (p.creation_seq, p.id))
        })
        .collect();
    ids.sort();
    ids.dedup();
    ids.into_iter().map(|(_, id)| id).collect()
}

/// Drop the subscriptions of `plan_item_id` that feed the given sentries.
pub(crate) fn remove_for_sentries(
    ctx: &mut CommandContext,
    plan_item_id: Uuid,
    sentry_ids: &BTreeSet<&str>,
) {
    let doomed: Vec<Uuid> = ctx
        .subscriptions
        .values()
        .filter(|s| {
            s.plan_item_id == plan_item_id
                && s.sentry_id
                    .as_deref()
                    .is_some_and(|id| sentry_ids.contains(id))
        })
        .map(|s| s.id)
        .collect();
    for id in doomed {
        ctx.subscriptions.delete(&id);
    }
}

pub(crate) fn remove_all_for_plan_item(ctx: &mut CommandContext, plan_item_id: Uuid) {
    let doomed: Vec<Uuid> = ctx
        .subscriptions
        .values()
        .filter(|s| s.plan_item_id == plan_item_id)
        .map(|s| s.id)
        .collect();
    for id in doomed {
        ctx.subscriptions.delete(&id);
    }
}

pub(crate) fn remove_all_for_case(ctx: &mut CommandContext, case_id: Uuid) {
    let doomed: Vec<Uuid> = ctx
        .subscriptions
        .values()
        .filter(|s| s.case_id == case_id)
        .map(|s| s.id)
        .collect();
    for id in doomed {
        ctx.subscriptions.delete(&id);
    }
}

/// Deliver a named event to every listener of the case. Returns how many
/// listeners occurred.
pub fn trigger_event(
    ctx: &mut CommandContext,
    case_id: Uuid,
    event_name: &str,
) -> Result<usize, EngineError> {
    let listeners = find_listeners(ctx, case_id, event_name);
    let mut fired = 0;
    for plan_item_id in listeners {
        if ctx.plan_item(plan_item_id)?.state != PlanItemState::Active {
            continue;
        }
        plan_item::transition(ctx, plan_item_id, Transition::Occur)?;
        fired += 1;
    }
    tracing::debug!(case_id = %case_id, event = %event_name, fired, "Event triggered");
    Ok(fired)
}
