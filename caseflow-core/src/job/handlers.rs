use crate::behavior;
use crate::command::TransitionPlanItem;
use crate::context::CommandContext;
use crate::error::EngineError;
use crate::types::*;
use async_trait::async_trait;

pub const TRIGGER_TIMER: &str = "trigger-timer";
pub const ASYNC_CONTINUATION: &str = "async-continuation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job is finished and will be deleted.
    Done,
    /// Not runnable yet. Rescheduled without consuming a retry.
    Deferred { until: Timestamp },
}

/// Executes one kind of job inside the executor's command context.
///
/// Returning an error consumes a retry; a `VersionConflict` does not.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    async fn execute(&self, job: &Job, ctx: &mut CommandContext)
        -> Result<JobOutcome, EngineError>;
}

/// Loads the job's case. `Some` means the job must not run now.
async fn case_gate(job: &Job, ctx: &mut CommandContext) -> Result<Option<JobOutcome>, EngineError> {
    let Some(case_id) = job.case_id else {
        return Ok(Some(JobOutcome::Done));
    };
    ctx.load_case(case_id).await?;
    let outcome = match ctx.case(case_id)?.state {
        CaseState::Active => None,
        CaseState::Suspended => Some(JobOutcome::Deferred {
            until: ctx.now() + ctx.registry().config.lock_duration_ms as i64,
        }),
        CaseState::Completed | CaseState::Terminated => Some(JobOutcome::Done),
    };
    Ok(outcome)
}

fn active_target(job: &Job, ctx: &CommandContext) -> Result<Option<uuid::Uuid>, EngineError> {
    let Some(plan_item_id) = job.plan_item_id else {
        return Ok(None);
    };
    let state = ctx.plan_item(plan_item_id)?.state;
    if state != PlanItemState::Active {
        tracing::debug!(
            job_id = %job.id,
            plan_item_id = %plan_item_id,
            state = %state,
            "Job target no longer active"
        );
        return Ok(None);
    }
    Ok(Some(plan_item_id))
}

/// Fires a timer event listener.
#[derive(Debug, Default, Clone)]
pub struct TimerEventHandler;

#[async_trait]
impl JobHandler for TimerEventHandler {
    fn handler_type(&self) -> &str {
        TRIGGER_TIMER
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &mut CommandContext,
    ) -> Result<JobOutcome, EngineError> {
        if let Some(outcome) = case_gate(job, ctx).await? {
            return Ok(outcome);
        }
        if let Some(plan_item_id) = active_target(job, ctx)? {
            ctx.execute_nested(&TransitionPlanItem {
                plan_item_id,
                transition: Transition::Occur,
            })
            .await?;
        }
        Ok(JobOutcome::Done)
    }
}

/// Runs an async service task's behavior, then completes the task.
#[derive(Debug, Default, Clone)]
pub struct AsyncContinuationHandler;

#[async_trait]
impl JobHandler for AsyncContinuationHandler {
    fn handler_type(&self) -> &str {
        ASYNC_CONTINUATION
    }

    async fn execute(
        &self,
        job: &Job,
        ctx: &mut CommandContext,
    ) -> Result<JobOutcome, EngineError> {
        if let Some(outcome) = case_gate(job, ctx).await? {
            return Ok(outcome);
        }
        let Some(plan_item_id) = active_target(job, ctx)? else {
            return Ok(JobOutcome::Done);
        };
        match behavior::call_service_task(ctx, plan_item_id).await? {
            Ok(()) => {
                ctx.execute_nested(&TransitionPlanItem {
                    plan_item_id,
                    transition: Transition::Complete,
                })
                .await?;
                Ok(JobOutcome::Done)
            }
            Err(e) => Err(EngineError::JobHandler {
                handler_type: ASYNC_CONTINUATION.to_string(),
                message: format!("{:#}", e),
            }),
        }
    }
}
