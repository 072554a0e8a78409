//! Commands: the only way state changes.
//!
//! A command runs against a fresh [`CommandContext`], usually by touching a
//! plan item or pushing agenda operations; the executor then drains the
//! agenda, flushes, and delivers notifications.

use crate::agenda::Operation;
use crate::context::CommandContext;
use crate::entity::EntityKind;
use crate::error::EngineError;
use crate::events::{LifecycleEvent, TransitionRecord};
use crate::plan_item;
use crate::registry::EngineRegistry;
use crate::subscription;
use crate::types::*;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    /// Must be repeatable: the executor re-runs it after a version conflict.
    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output, EngineError>;
}

/// A committed command's result plus the state changes it applied, in order.
#[derive(Debug, Clone)]
pub struct CommandOutcome<T> {
    pub output: T,
    pub transitions: Vec<TransitionRecord>,
}

pub struct CommandExecutor {
    registry: Arc<EngineRegistry>,
}

impl CommandExecutor {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute<C: Command>(
        &self,
        command: &C,
    ) -> Result<CommandOutcome<C::Output>, EngineError> {
        let max_retries = self.registry.config.version_conflict_retries;
        let mut attempt = 0;
        loop {
            let mut ctx = CommandContext::new(self.registry.clone());
            match run(command, &mut ctx).await {
                Ok(output) => {
                    let transitions = ctx.finish().await;
                    return Ok(CommandOutcome {
                        output,
                        transitions,
                    });
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Command: version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn run<C: Command>(command: &C, ctx: &mut CommandContext) -> Result<C::Output, EngineError> {
    let output = command.execute(ctx).await?;
    ctx.drain_agenda().await?;
    ctx.flush().await?;
    Ok(output)
}

fn require_state(ctx: &CommandContext, case_id: Uuid, expected: CaseState) -> Result<(), EngineError> {
    let state = ctx.case(case_id)?.state;
    if state != expected {
        return Err(EngineError::CaseNotActive { case_id, state });
    }
    Ok(())
}

// ─── Case commands ────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StartCase {
    pub definition_key: String,
    /// Latest deployed version when absent.
    pub version: Option<u32>,
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    pub variables: Variables,
}

#[async_trait]
impl Command for StartCase {
    type Output = Uuid;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Uuid, EngineError> {
        let provider = ctx.registry().definitions.clone();
        let found = match self.version {
            Some(version) => provider.get(&self.definition_key, version).await,
            None => provider.latest(&self.definition_key).await,
        };
        let def = found
            .map_err(|e| EngineError::UnknownDefinition(format!("{}: {}", self.definition_key, e)))?
            .ok_or_else(|| EngineError::UnknownDefinition(self.definition_key.clone()))?;

        let case_id = Uuid::now_v7();
        ctx.insert_case(
            CaseInstance {
                id: case_id,
                definition_key: def.key.clone(),
                definition_version: def.version,
                state: CaseState::Active,
                business_key: self.business_key.clone(),
                tenant_id: self.tenant_id.clone(),
                variables: self.variables.clone(),
                root_plan_item_id: None,
                start_time: ctx.now(),
                end_time: None,
            },
            def.clone(),
        );
        ctx.notify(LifecycleEvent::CaseStarted {
            case_id,
            definition_key: def.key.clone(),
            definition_version: def.version,
        });

        let root = plan_item::create(ctx, case_id, None, &def.plan_model, 0)?;
        ctx.case_mut(case_id)?.root_plan_item_id = Some(root);
        tracing::info!(
            case_id = %case_id,
            definition = %def.key,
            version = def.version,
            "Case started"
        );
        Ok(case_id)
    }
}

#[derive(Debug, Clone)]
pub struct TerminateCase {
    pub case_id: Uuid,
}

#[async_trait]
impl Command for TerminateCase {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        ctx.load_case(self.case_id).await?;
        let case = ctx.case(self.case_id)?;
        if case.state.is_terminal() {
            return Err(EngineError::CaseNotActive {
                case_id: self.case_id,
                state: case.state,
            });
        }
        let root = case
            .root_plan_item_id
            .ok_or_else(|| EngineError::not_found(EntityKind::PlanItem, self.case_id))?;
        plan_item::transition(ctx, root, Transition::Terminate)
    }
}

/// Suspends the case and every active or enabled plan item in it.
#[derive(Debug, Clone)]
pub struct SuspendCase {
    pub case_id: Uuid,
}

#[async_trait]
impl Command for SuspendCase {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        ctx.load_case(self.case_id).await?;
        require_state(ctx, self.case_id, CaseState::Active)?;

        let mut targets: Vec<(u64, Uuid)> = ctx
            .case_plan_items(self.case_id)
            .iter()
            .filter(|p| matches!(p.state, PlanItemState::Active | PlanItemState::Enabled))
            .map(|p| (p.creation_seq, p.id))
            .collect();
        // Children before the stages holding them.
        targets.sort_by(|a, b| b.cmp(a));
        for (_, id) in targets {
            plan_item::transition(ctx, id, Transition::Suspend)?;
        }
        ctx.case_mut(self.case_id)?.state = CaseState::Suspended;
        ctx.notify(LifecycleEvent::CaseSuspended {
            case_id: self.case_id,
        });
        tracing::info!(case_id = %self.case_id, "Case suspended");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResumeCase {
    pub case_id: Uuid,
}

#[async_trait]
impl Command for ResumeCase {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        ctx.load_case(self.case_id).await?;
        require_state(ctx, self.case_id, CaseState::Suspended)?;
        ctx.case_mut(self.case_id)?.state = CaseState::Active;

        let targets: Vec<Uuid> = ctx
            .case_plan_items(self.case_id)
            .iter()
            .filter(|p| p.state == PlanItemState::Suspended)
            .map(|p| p.id)
            .collect();
        for id in targets {
            plan_item::transition(ctx, id, Transition::Resume)?;
        }

        // Entry sentries that fired while suspended.
        let held: BTreeSet<Uuid> = ctx
            .sentries
            .values()
            .filter(|s| s.case_id == self.case_id && s.satisfied)
            .map(|s| s.plan_item_id)
            .collect();
        for plan_item_id in held {
            if ctx.plan_item(plan_item_id)?.state.is_waiting() {
                ctx.push(Operation::Activate { plan_item_id });
            }
        }
        ctx.notify(LifecycleEvent::CaseResumed {
            case_id: self.case_id,
        });
        tracing::info!(case_id = %self.case_id, "Case resumed");
        Ok(())
    }
}

/// Merge variables into the case and re-check variable-dependent sentries.
#[derive(Debug, Clone)]
pub struct SetVariables {
    pub case_id: Uuid,
    pub variables: Variables,
}

#[async_trait]
impl Command for SetVariables {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        ctx.load_case(self.case_id).await?;
        require_state(ctx, self.case_id, CaseState::Active)?;
        ctx.case_mut(self.case_id)?
            .variables
            .extend(self.variables.clone());
        ctx.push(Operation::EvaluateVariableSentries {
            case_id: self.case_id,
        });
        Ok(())
    }
}

/// Deliver a named event to the case's event listeners.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub case_id: Uuid,
    pub event_name: String,
}

#[async_trait]
impl Command for TriggerEvent {
    type Output = usize;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<usize, EngineError> {
        ctx.load_case(self.case_id).await?;
        require_state(ctx, self.case_id, CaseState::Active)?;
        subscription::trigger_event(ctx, self.case_id, &self.event_name)
    }
}

// ─── Plan item commands ───────────────────────────────────────

/// Apply one transition to one plan item, e.g. `Complete` on a human task
/// or `Start` on an enabled one.
#[derive(Debug, Clone)]
pub struct TransitionPlanItem {
    pub plan_item_id: Uuid,
    pub transition: Transition,
}

#[async_trait]
impl Command for TransitionPlanItem {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let case_id = ctx.load_plan_item(self.plan_item_id).await?;
        require_state(ctx, case_id, CaseState::Active)?;
        plan_item::transition(ctx, self.plan_item_id, self.transition)
    }
}

// ─── Operator commands ────────────────────────────────────────

/// Move a dead-lettered job back into the executable table.
#[derive(Debug, Clone)]
pub struct RetryDeadLetter {
    pub job_id: Uuid,
    pub retries: u32,
}

#[async_trait]
impl Command for RetryDeadLetter {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<(), EngineError> {
        let dead = ctx
            .load_dead_letter(self.job_id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::DeadLetterJob, self.job_id))?;
        ctx.dead_letters.delete(&dead.id);

        let mut job = dead.job;
        job.retries_remaining = self.retries;
        job.due_date = ctx.now();
        job.lock_owner = None;
        job.lock_expires_at = None;
        tracing::info!(
            job_id = %job.id,
            retries = self.retries,
            "Dead-lettered job requeued"
        );
        ctx.jobs.insert_new(job);
        Ok(())
    }
}
