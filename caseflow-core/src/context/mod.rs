//! The command execution context: one unit of work.
//!
//! A context caches every row a command touches, runs the agenda, and
//! writes the accumulated changes to the store in a single `batch_flush`.
//! Dropping a context without flushing discards everything it did.

pub mod cache;

use crate::agenda::{Agenda, Operation};
use crate::command::Command;
use crate::definition::{CaseDefinition, PlanItemDefinition};
use crate::entity::{EntityKind, EntityRecord, Versioned};
use crate::error::EngineError;
use crate::events::{LifecycleEvent, TransitionRecord};
use crate::registry::EngineRegistry;
use crate::types::*;
use crate::{behavior, plan_item, sentry};
use cache::EntityCache;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

pub struct CommandContext {
    registry: Arc<EngineRegistry>,
    now: Timestamp,
    pub(crate) cases: EntityCache<CaseInstance>,
    pub(crate) plan_items: EntityCache<PlanItemInstance>,
    pub(crate) sentries: EntityCache<SentryInstance>,
    pub(crate) subscriptions: EntityCache<EventSubscription>,
    pub(crate) jobs: EntityCache<Job>,
    pub(crate) timer_jobs: EntityCache<TimerJob>,
    pub(crate) dead_letters: EntityCache<DeadLetterJob>,
    agenda: Agenda,
    loaded_cases: HashSet<Uuid>,
    definitions: HashMap<Uuid, Arc<CaseDefinition>>,
    transitions: Vec<TransitionRecord>,
    notifications: Vec<LifecycleEvent>,
}

impl CommandContext {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        let now = registry.now();
        let limit = registry.config.max_agenda_operations;
        Self {
            registry,
            now,
            cases: EntityCache::default(),
            plan_items: EntityCache::default(),
            sentries: EntityCache::default(),
            subscriptions: EntityCache::default(),
            jobs: EntityCache::default(),
            timer_jobs: EntityCache::default(),
            dead_letters: EntityCache::default(),
            agenda: Agenda::new(limit),
            loaded_cases: HashSet::new(),
            definitions: HashMap::new(),
            transitions: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// Command time, fixed when the context opens.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    // ── Loading ──

    /// Load a case with its plan items, sentries, subscriptions and jobs.
    pub async fn load_case(&mut self, case_id: Uuid) -> Result<(), EngineError> {
        if self.loaded_cases.contains(&case_id) {
            return Ok(());
        }
        let store = self.registry.store.clone();
        let rows = store.load_case_rows(case_id).await?;
        if !rows
            .iter()
            .any(|r| matches!(&r.value, EntityRecord::Case(c) if c.id == case_id))
        {
            return Err(EngineError::not_found(EntityKind::Case, case_id));
        }
        for row in rows {
            self.insert_loaded(row);
        }
        let (jobs, timers) = store.case_jobs(case_id).await?;
        for job in jobs {
            self.jobs.insert_loaded(job);
        }
        for timer in timers {
            self.timer_jobs.insert_loaded(timer);
        }

        let (key, version) = {
            let case = self.case(case_id)?;
            (case.definition_key.clone(), case.definition_version)
        };
        let definition = self
            .registry
            .definitions
            .get(&key, version)
            .await
            .map_err(|e| EngineError::UnknownDefinition(format!("{}:v{}: {}", key, version, e)))?
            .ok_or_else(|| EngineError::UnknownDefinition(format!("{}:v{}", key, version)))?;

        self.definitions.insert(case_id, definition);
        self.loaded_cases.insert(case_id);
        tracing::trace!(case_id = %case_id, "Context: case loaded");
        Ok(())
    }

    /// Load the case owning a plan item. Returns the case id.
    pub async fn load_plan_item(&mut self, plan_item_id: Uuid) -> Result<Uuid, EngineError> {
        if let Some(item) = self.plan_items.get(&plan_item_id) {
            return Ok(item.case_id);
        }
        let row = self
            .registry
            .store
            .load(EntityKind::PlanItem, plan_item_id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::PlanItem, plan_item_id))?;
        let case_id = match row.value.case_id() {
            Some(id) => id,
            None => return Err(EngineError::not_found(EntityKind::PlanItem, plan_item_id)),
        };
        self.load_case(case_id).await?;
        Ok(case_id)
    }

    /// Load a single job row into the cache, if it still exists.
    pub async fn load_job(&mut self, job_id: Uuid) -> Result<Option<Job>, EngineError> {
        if !self.jobs.is_tracked(&job_id) {
            if let Some(row) = self.registry.store.load(EntityKind::Job, job_id).await? {
                self.insert_loaded(row);
            }
        }
        Ok(self.jobs.get(&job_id).cloned())
    }

    pub async fn load_dead_letter(
        &mut self,
        id: Uuid,
    ) -> Result<Option<DeadLetterJob>, EngineError> {
        if !self.dead_letters.is_tracked(&id) {
            if let Some(row) = self
                .registry
                .store
                .load(EntityKind::DeadLetterJob, id)
                .await?
            {
                self.insert_loaded(row);
            }
        }
        Ok(self.dead_letters.get(&id).cloned())
    }

    pub(crate) fn insert_loaded(&mut self, row: Versioned<EntityRecord>) {
        let version = row.version;
        match row.value {
            EntityRecord::Case(v) => self.cases.insert_loaded(Versioned::new(v, version)),
            EntityRecord::PlanItem(v) => self.plan_items.insert_loaded(Versioned::new(v, version)),
            EntityRecord::Sentry(v) => self.sentries.insert_loaded(Versioned::new(v, version)),
            EntityRecord::Subscription(v) => {
                self.subscriptions.insert_loaded(Versioned::new(v, version))
            }
            EntityRecord::Job(v) => self.jobs.insert_loaded(Versioned::new(v, version)),
            EntityRecord::TimerJob(v) => self.timer_jobs.insert_loaded(Versioned::new(v, version)),
            EntityRecord::DeadLetterJob(v) => {
                self.dead_letters.insert_loaded(Versioned::new(v, version))
            }
        }
    }

    /// Register a case created by this context.
    pub(crate) fn insert_case(&mut self, case: CaseInstance, definition: Arc<CaseDefinition>) {
        let id = case.id;
        self.cases.insert_new(case);
        self.definitions.insert(id, definition);
        self.loaded_cases.insert(id);
    }

    // ── Access ──

    pub fn case(&self, case_id: Uuid) -> Result<&CaseInstance, EngineError> {
        self.cases
            .get(&case_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Case, case_id))
    }

    pub fn case_mut(&mut self, case_id: Uuid) -> Result<&mut CaseInstance, EngineError> {
        self.cases
            .get_mut(&case_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Case, case_id))
    }

    pub fn plan_item(&self, id: Uuid) -> Result<&PlanItemInstance, EngineError> {
        self.plan_items
            .get(&id)
            .ok_or_else(|| EngineError::not_found(EntityKind::PlanItem, id))
    }

    pub fn plan_item_mut(&mut self, id: Uuid) -> Result<&mut PlanItemInstance, EngineError> {
        self.plan_items
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found(EntityKind::PlanItem, id))
    }

    /// Plan items of one case, in creation order.
    pub fn case_plan_items(&self, case_id: Uuid) -> Vec<&PlanItemInstance> {
        let mut items: Vec<&PlanItemInstance> = self
            .plan_items
            .values()
            .filter(|p| p.case_id == case_id)
            .collect();
        items.sort_by_key(|p| p.creation_seq);
        items
    }

    /// Direct children of a stage instance, in creation order.
    pub fn children_of(&self, stage_id: Uuid) -> Vec<&PlanItemInstance> {
        let mut items: Vec<&PlanItemInstance> = self
            .plan_items
            .values()
            .filter(|p| p.parent_id == Some(stage_id))
            .collect();
        items.sort_by_key(|p| p.creation_seq);
        items
    }

    pub fn definition(&self, case_id: Uuid) -> Result<Arc<CaseDefinition>, EngineError> {
        self.definitions
            .get(&case_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(EntityKind::Case, case_id))
    }

    /// The item definition a plan item instance follows.
    pub fn item_definition<'d>(
        def: &'d CaseDefinition,
        item: &PlanItemInstance,
    ) -> Result<&'d PlanItemDefinition, EngineError> {
        def.item(&item.definition_id).ok_or_else(|| {
            EngineError::InvalidDefinition(format!(
                "{} has no plan item '{}'",
                def.key, item.definition_id
            ))
        })
    }

    pub(crate) fn next_creation_seq(&self, case_id: Uuid) -> u64 {
        self.plan_items
            .values()
            .filter(|p| p.case_id == case_id)
            .map(|p| p.creation_seq + 1)
            .max()
            .unwrap_or(0)
    }

    /// Evaluate a boolean expression against the case variables.
    ///
    /// Failures count as `false` and are logged, unless `strict_expressions`
    /// is set.
    pub fn evaluate_condition(&self, case_id: Uuid, expression: &str) -> Result<bool, EngineError> {
        let case = self.case(case_id)?;
        match self
            .registry
            .evaluator
            .evaluate_bool(expression, &case.variables)
        {
            Ok(value) => Ok(value),
            Err(e) if self.registry.config.strict_expressions => {
                Err(EngineError::ExpressionEvaluation {
                    expression: expression.to_string(),
                    message: e.to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(
                    case_id = %case_id,
                    expression = %expression,
                    error = %e,
                    "Expression failed, treating as false"
                );
                Ok(false)
            }
        }
    }

    // ── Agenda ──

    pub fn push(&mut self, op: Operation) {
        self.agenda.push(op);
    }

    pub fn has_pending_for(&self, plan_item_id: Uuid) -> bool {
        self.agenda.has_pending_for(plan_item_id)
    }

    /// Run queued operations until the agenda is empty.
    pub async fn drain_agenda(&mut self) -> Result<(), EngineError> {
        while let Some(op) = self.agenda.next()? {
            tracing::trace!(?op, "Agenda: run");
            match op {
                Operation::Activate { plan_item_id } => plan_item::activate(self, plan_item_id)?,
                Operation::Transition {
                    plan_item_id,
                    transition,
                } => plan_item::transition_if_allowed(self, plan_item_id, transition)?,
                Operation::NotifyDependents {
                    case_id,
                    source_plan_item_id,
                    source_definition_id,
                    event,
                } => sentry::on_standard_event(
                    self,
                    case_id,
                    source_plan_item_id,
                    &source_definition_id,
                    event,
                )?,
                Operation::EvaluateStageCompletion { stage_id } => {
                    plan_item::evaluate_stage_completion(self, stage_id)?
                }
                Operation::EvaluateVariableSentries { case_id } => {
                    sentry::on_variables_changed(self, case_id)?
                }
                Operation::RunServiceTask { plan_item_id } => {
                    behavior::run_service_task(self, plan_item_id).await?
                }
            }
        }
        Ok(())
    }

    /// Run a command inside this context. The caller's flush commits it.
    pub async fn execute_nested<C: Command>(&mut self, command: &C) -> Result<C::Output, EngineError> {
        command.execute(self).await
    }

    // ── Change tracking ──

    pub(crate) fn record_transition(&mut self, record: TransitionRecord) {
        self.notifications
            .push(LifecycleEvent::PlanItemTransitioned(record.clone()));
        self.transitions.push(record);
    }

    pub(crate) fn notify(&mut self, event: LifecycleEvent) {
        self.notifications.push(event);
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Write every change of this context in one atomic batch.
    ///
    /// Writing any row of a loaded case also writes the case row at the
    /// version this context read, so two commands on one case never both
    /// commit.
    pub async fn flush(&mut self) -> Result<(), EngineError> {
        let touched: BTreeSet<Uuid> = self
            .plan_items
            .changed()
            .map(|p| p.case_id)
            .chain(self.sentries.changed().map(|s| s.case_id))
            .chain(self.subscriptions.changed().map(|s| s.case_id))
            .chain(self.jobs.changed().filter_map(|j| j.case_id))
            .chain(self.timer_jobs.changed().filter_map(|t| t.case_id))
            .chain(self.dead_letters.changed().filter_map(|d| d.job.case_id))
            .collect();
        for case_id in &touched {
            self.cases.touch(case_id);
        }

        let mut mutations = Vec::new();
        mutations.extend(self.cases.mutations());
        mutations.extend(self.plan_items.mutations());
        mutations.extend(self.sentries.mutations());
        mutations.extend(self.subscriptions.mutations());
        mutations.extend(self.jobs.mutations());
        mutations.extend(self.timer_jobs.mutations());
        mutations.extend(self.dead_letters.mutations());
        if mutations.is_empty() {
            return Ok(());
        }
        tracing::debug!(mutations = mutations.len(), "Context: flush");
        self.registry.store.batch_flush(mutations).await?;
        Ok(())
    }

    /// Deliver buffered notifications and hand back the transition log.
    /// Sink failures are logged only.
    pub async fn finish(self) -> Vec<TransitionRecord> {
        for event in &self.notifications {
            if let Err(e) = self.registry.sink.notify(event).await {
                tracing::warn!(event = event.name(), error = %e, "Notification sink failed");
            }
        }
        self.transitions
    }
}
