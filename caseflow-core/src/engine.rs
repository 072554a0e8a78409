//! CaseEngine: the public facade.
//!
//! Every mutating call is a [`Command`] run through the [`CommandExecutor`];
//! queries read committed rows straight from the store.

use crate::command::*;
use crate::entity::{Entity, EntityKind};
use crate::error::EngineError;
use crate::events::TransitionRecord;
use crate::job::JobExecutor;
use crate::registry::EngineRegistry;
use crate::types::*;
use std::sync::Arc;
use uuid::Uuid;

pub struct CaseEngine {
    registry: Arc<EngineRegistry>,
    commands: CommandExecutor,
}

impl CaseEngine {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self {
            commands: CommandExecutor::new(registry.clone()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// A job executor sharing this engine's registry.
    pub fn job_executor(&self) -> JobExecutor {
        JobExecutor::new(self.registry.clone())
    }

    /// Run any command, including user-defined ones.
    pub async fn execute<C: Command>(
        &self,
        command: &C,
    ) -> Result<CommandOutcome<C::Output>, EngineError> {
        self.commands.execute(command).await
    }

    // ─── Case commands ────────────────────────────────────────────

    /// Start a case of the latest deployed version of `definition_key`.
    pub async fn start_case(
        &self,
        definition_key: &str,
        variables: Variables,
    ) -> Result<Uuid, EngineError> {
        let outcome = self
            .commands
            .execute(&StartCase {
                definition_key: definition_key.to_string(),
                variables,
                ..Default::default()
            })
            .await?;
        Ok(outcome.output)
    }

    pub async fn terminate_case(&self, case_id: Uuid) -> Result<(), EngineError> {
        self.commands.execute(&TerminateCase { case_id }).await?;
        Ok(())
    }

    pub async fn suspend_case(&self, case_id: Uuid) -> Result<(), EngineError> {
        self.commands.execute(&SuspendCase { case_id }).await?;
        Ok(())
    }

    pub async fn resume_case(&self, case_id: Uuid) -> Result<(), EngineError> {
        self.commands.execute(&ResumeCase { case_id }).await?;
        Ok(())
    }

    pub async fn set_variables(
        &self,
        case_id: Uuid,
        variables: Variables,
    ) -> Result<(), EngineError> {
        self.commands
            .execute(&SetVariables { case_id, variables })
            .await?;
        Ok(())
    }

    /// Deliver a named event. Returns the number of listeners that occurred.
    pub async fn trigger_event(&self, case_id: Uuid, event_name: &str) -> Result<usize, EngineError> {
        let outcome = self
            .commands
            .execute(&TriggerEvent {
                case_id,
                event_name: event_name.to_string(),
            })
            .await?;
        Ok(outcome.output)
    }

    // ─── Plan item commands ───────────────────────────────────────

    /// Apply a transition and return every state change it caused, in order.
    pub async fn transition_plan_item(
        &self,
        plan_item_id: Uuid,
        transition: Transition,
    ) -> Result<Vec<TransitionRecord>, EngineError> {
        let outcome = self
            .commands
            .execute(&TransitionPlanItem {
                plan_item_id,
                transition,
            })
            .await?;
        Ok(outcome.transitions)
    }

    /// Start an enabled (manually activated) plan item.
    pub async fn start_plan_item(
        &self,
        plan_item_id: Uuid,
    ) -> Result<Vec<TransitionRecord>, EngineError> {
        self.transition_plan_item(plan_item_id, Transition::Start)
            .await
    }

    pub async fn complete_plan_item(
        &self,
        plan_item_id: Uuid,
    ) -> Result<Vec<TransitionRecord>, EngineError> {
        self.transition_plan_item(plan_item_id, Transition::Complete)
            .await
    }

    // ─── Operator commands ────────────────────────────────────────

    pub async fn retry_dead_letter(&self, job_id: Uuid, retries: u32) -> Result<(), EngineError> {
        self.commands
            .execute(&RetryDeadLetter { job_id, retries })
            .await?;
        Ok(())
    }

    /// One inline executor cycle: reap timers, then run due jobs.
    pub async fn run_due_jobs(&self) -> Result<usize, EngineError> {
        self.job_executor().run_once().await
    }

    // ─── Queries ──────────────────────────────────────────────────

    pub async fn case(&self, case_id: Uuid) -> Result<Option<CaseInstance>, EngineError> {
        let row = self.registry.store.load(EntityKind::Case, case_id).await?;
        Ok(row.and_then(|r| CaseInstance::from_record(r.value)))
    }

    /// Plan items of a case in creation order.
    pub async fn plan_items(&self, case_id: Uuid) -> Result<Vec<PlanItemInstance>, EngineError> {
        let mut items: Vec<PlanItemInstance> = self.case_rows(case_id).await?;
        items.sort_by_key(|p| p.creation_seq);
        Ok(items)
    }

    /// Instances of one plan item definition, oldest first.
    pub async fn plan_items_by_definition(
        &self,
        case_id: Uuid,
        definition_id: &str,
    ) -> Result<Vec<PlanItemInstance>, EngineError> {
        let mut items = self.plan_items(case_id).await?;
        items.retain(|p| p.definition_id == definition_id);
        Ok(items)
    }

    pub async fn sentry_instances(&self, case_id: Uuid) -> Result<Vec<SentryInstance>, EngineError> {
        self.case_rows(case_id).await
    }

    pub async fn subscriptions(&self, case_id: Uuid) -> Result<Vec<EventSubscription>, EngineError> {
        self.case_rows(case_id).await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>, EngineError> {
        Ok(self.registry.store.list_jobs().await?)
    }

    pub async fn timer_jobs(&self) -> Result<Vec<TimerJob>, EngineError> {
        Ok(self.registry.store.list_timer_jobs().await?)
    }

    pub async fn dead_letter_jobs(&self) -> Result<Vec<DeadLetterJob>, EngineError> {
        Ok(self.registry.store.list_dead_letter_jobs().await?)
    }

    async fn case_rows<T: Entity>(&self, case_id: Uuid) -> Result<Vec<T>, EngineError> {
        let rows = self.registry.store.load_case_rows(case_id).await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| T::from_record(r.value))
            .collect())
    }
}
