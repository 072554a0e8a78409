//! What each plan item kind does when it becomes active.

use crate::agenda::Operation;
use crate::context::CommandContext;
use crate::definition::{PlanItemBody, PlanItemDefinition};
use crate::error::EngineError;
use crate::job::handlers::{ASYNC_CONTINUATION, TRIGGER_TIMER};
use crate::plan_item;
use crate::registry::ServiceTaskCall;
use crate::subscription;
use crate::timer::parse_timer;
use crate::types::*;
use serde_json::{json, Value};
use uuid::Uuid;

pub(crate) fn on_activated(
    ctx: &mut CommandContext,
    plan_item_id: Uuid,
    item_def: &PlanItemDefinition,
) -> Result<(), EngineError> {
    let item = ctx.plan_item(plan_item_id)?.clone();
    match &item_def.body {
        PlanItemBody::Stage { children } => {
            for child in children {
                plan_item::create(ctx, item.case_id, Some(item.id), child, 0)?;
            }
            ctx.push(Operation::EvaluateStageCompletion { stage_id: item.id });
        }
        PlanItemBody::HumanTask { assignee } => {
            tracing::debug!(
                plan_item_id = %item.id,
                assignee = assignee.as_deref().unwrap_or("-"),
                "HumanTask waiting for completion"
            );
        }
        PlanItemBody::ServiceTask {
            task_type,
            is_async,
            retries,
        } => {
            if *is_async {
                schedule_continuation(ctx, &item, task_type, *retries);
            } else {
                ctx.push(Operation::RunServiceTask {
                    plan_item_id: item.id,
                });
            }
        }
        PlanItemBody::Milestone => ctx.push(Operation::Transition {
            plan_item_id: item.id,
            transition: Transition::Occur,
        }),
        PlanItemBody::EventListener { event } => subscription::register_event(ctx, &item, event),
        PlanItemBody::TimerEventListener { timer } => schedule_timer(ctx, &item, timer)?,
    }
    Ok(())
}

fn schedule_continuation(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    task_type: &str,
    retries: Option<u32>,
) {
    let retries = retries.unwrap_or(ctx.registry().config.default_job_retries);
    let job = Job {
        id: Uuid::now_v7(),
        job_type: JobType::AsyncContinuation,
        handler_type: ASYNC_CONTINUATION.to_string(),
        case_id: Some(item.case_id),
        plan_item_id: Some(item.id),
        payload: json!({ "task_type": task_type }),
        due_date: ctx.now(),
        lock_owner: None,
        lock_expires_at: None,
        retries_remaining: retries,
        attempts: 0,
        last_error: None,
        created_at: ctx.now(),
    };
    tracing::debug!(
        plan_item_id = %item.id,
        job_id = %job.id,
        task_type = %task_type,
        "ServiceTask continues asynchronously"
    );
    ctx.jobs.insert_new(job);
}

fn schedule_timer(
    ctx: &mut CommandContext,
    item: &PlanItemInstance,
    timer: &str,
) -> Result<(), EngineError> {
    // A repetition inherits the pending cycle of its predecessor.
    if ctx
        .timer_jobs
        .values()
        .any(|t| t.plan_item_id == Some(item.id))
    {
        return Ok(());
    }

    let text = resolve_timer(ctx, item.case_id, timer)?;
    let parsed = parse_timer(&text).map_err(|e| {
        EngineError::InvalidDefinition(format!(
            "Timer '{}' on '{}': {}",
            text, item.definition_id, e
        ))
    })?;
    let due_date = ctx.now() + parsed.first_due_in_ms as i64;
    let timer_job = TimerJob {
        id: Uuid::now_v7(),
        handler_type: TRIGGER_TIMER.to_string(),
        case_id: Some(item.case_id),
        plan_item_id: Some(item.id),
        payload: json!({ "timer": text }),
        due_date,
        cycle: parsed.cycle,
        retries: ctx.registry().config.default_job_retries,
        created_at: ctx.now(),
    };
    tracing::debug!(
        plan_item_id = %item.id,
        due_date,
        timer = %text,
        "Timer scheduled"
    );
    ctx.timer_jobs.insert_new(timer_job);
    Ok(())
}

/// Literal timers pass through; `${…}` timers are evaluated against the case
/// variables and must yield a string.
fn resolve_timer(ctx: &CommandContext, case_id: Uuid, timer: &str) -> Result<String, EngineError> {
    if !timer.trim_start().starts_with("${") {
        return Ok(timer.to_string());
    }
    let case = ctx.case(case_id)?;
    let failed = |message: String| EngineError::ExpressionEvaluation {
        expression: timer.to_string(),
        message,
    };
    match ctx.registry().evaluator.evaluate(timer, &case.variables) {
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Err(failed(format!("expected a timer string, got {}", other))),
        Err(e) => Err(failed(e.to_string())),
    }
}

/// Invoke the behavior bound to a service task and merge its outputs.
///
/// The outer error is an engine failure; the inner one is the behavior's own.
pub(crate) async fn call_service_task(
    ctx: &mut CommandContext,
    plan_item_id: Uuid,
) -> Result<anyhow::Result<()>, EngineError> {
    let item = ctx.plan_item(plan_item_id)?.clone();
    let def = ctx.definition(item.case_id)?;
    let item_def = CommandContext::item_definition(&def, &item)?;
    let PlanItemBody::ServiceTask { task_type, .. } = &item_def.body else {
        return Err(EngineError::InvalidDefinition(format!(
            "'{}' is not a service task",
            item.definition_id
        )));
    };
    let behavior = ctx
        .registry()
        .service_task(task_type)
        .ok_or_else(|| EngineError::JobHandler {
            handler_type: task_type.clone(),
            message: "no service task behavior registered".to_string(),
        })?;
    let call = ServiceTaskCall {
        case_id: item.case_id,
        plan_item_id,
        definition_id: item.definition_id.clone(),
        task_type: task_type.clone(),
        variables: ctx.case(item.case_id)?.variables.clone(),
    };

    match behavior.execute(&call).await {
        Ok(outputs) => {
            if !outputs.is_empty() {
                ctx.case_mut(item.case_id)?.variables.extend(outputs);
                ctx.push(Operation::EvaluateVariableSentries {
                    case_id: item.case_id,
                });
            }
            Ok(Ok(()))
        }
        Err(e) => Ok(Err(e)),
    }
}

/// Synchronous service task: complete on success, fault on failure.
pub(crate) async fn run_service_task(
    ctx: &mut CommandContext,
    plan_item_id: Uuid,
) -> Result<(), EngineError> {
    if ctx.plan_item(plan_item_id)?.state != PlanItemState::Active {
        return Ok(());
    }
    match call_service_task(ctx, plan_item_id).await? {
        Ok(()) => plan_item::transition(ctx, plan_item_id, Transition::Complete),
        Err(e) => {
            tracing::warn!(
                plan_item_id = %plan_item_id,
                error = %e,
                "ServiceTask failed"
            );
            plan_item::transition(ctx, plan_item_id, Transition::Fault)
        }
    }
}
