use super::backoff;
use super::handlers::{JobHandler, JobOutcome};
use crate::context::CommandContext;
use crate::entity::Versioned;
use crate::error::EngineError;
use crate::events::LifecycleEvent;
use crate::registry::EngineRegistry;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

/// What happened to one executed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Succeeded,
    Deferred { until: Timestamp },
    Retrying { attempt: u32, due_date: Timestamp },
    DeadLettered,
    /// Version conflict: the lock was released and no retry was consumed.
    LockReleased,
    /// The job vanished or another node holds it now.
    Abandoned,
}

/// Polls for due jobs, claims them and runs their handlers.
///
/// Several executors (in one process or on several nodes) may share a
/// store; acquisition decides which one runs a job.
pub struct JobExecutor {
    registry: Arc<EngineRegistry>,
}

impl JobExecutor {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self { registry }
    }

    fn node_id(&self) -> &str {
        &self.registry.config.node_id
    }

    /// Claim up to `max` due jobs for this node.
    pub async fn acquire_due_jobs(&self, max: usize) -> Result<Vec<Versioned<Job>>, EngineError> {
        let now = self.registry.now();
        let lock_expires_at = now + self.registry.config.lock_duration_ms as i64;
        let jobs = self
            .registry
            .store
            .acquire_jobs(self.node_id(), now, lock_expires_at, max)
            .await?;
        if !jobs.is_empty() {
            tracing::debug!(
                node_id = %self.node_id(),
                count = jobs.len(),
                "JobExecutor: acquired jobs"
            );
        }
        Ok(jobs)
    }

    /// Run one claimed job to its outcome.
    pub async fn execute(&self, job: Versioned<Job>) -> Result<JobResult, EngineError> {
        let snapshot = job.value.clone();
        let Some(handler) = self.registry.job_handler(&snapshot.handler_type) else {
            let message = format!("No handler registered for '{}'", snapshot.handler_type);
            return self.record_failure(&snapshot, message).await;
        };

        let mut ctx = CommandContext::new(self.registry.clone());
        ctx.jobs.insert_loaded(job);

        match run_handler(handler.as_ref(), &snapshot, &mut ctx).await {
            Ok(outcome) => {
                ctx.finish().await;
                tracing::info!(
                    job_id = %snapshot.id,
                    handler_type = %snapshot.handler_type,
                    attempt = snapshot.attempts + 1,
                    retry = snapshot.is_retry(),
                    "JobExecutor: job executed"
                );
                Ok(match outcome {
                    JobOutcome::Done => JobResult::Succeeded,
                    JobOutcome::Deferred { until } => JobResult::Deferred { until },
                })
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    job_id = %snapshot.id,
                    error = %e,
                    "JobExecutor: version conflict, releasing lock"
                );
                self.release_lock(snapshot.id).await?;
                Ok(JobResult::LockReleased)
            }
            Err(e) => self.record_failure(&snapshot, e.to_string()).await,
        }
    }

    async fn release_lock(&self, job_id: Uuid) -> Result<(), EngineError> {
        let mut ctx = CommandContext::new(self.registry.clone());
        let Some(current) = ctx.load_job(job_id).await? else {
            return Ok(());
        };
        if current.lock_owner.as_deref() != Some(self.node_id()) {
            return Ok(());
        }
        if let Some(job) = ctx.jobs.get_mut(&job_id) {
            job.lock_owner = None;
            job.lock_expires_at = None;
        }
        match ctx.flush().await {
            Err(e) if e.is_retryable() => {
                tracing::debug!(job_id = %job_id, "JobExecutor: lock already taken over");
                Ok(())
            }
            other => other,
        }
    }

    /// Consume a retry in a fresh context, or dead-letter the job when none
    /// are left.
    async fn record_failure(&self, job: &Job, error: String) -> Result<JobResult, EngineError> {
        let mut ctx = CommandContext::new(self.registry.clone());
        let Some(current) = ctx.load_job(job.id).await? else {
            return Ok(JobResult::Abandoned);
        };
        if current.lock_owner.as_deref() != Some(self.node_id()) {
            return Ok(JobResult::Abandoned);
        }

        let attempt = current.attempts + 1;
        let now = ctx.now();
        let result = if current.retries_remaining > 0 {
            let delay =
                backoff::delay_ms(&self.registry.config.backoff, attempt, &mut rand::thread_rng());
            let due_date = now + delay as i64;
            if let Some(row) = ctx.jobs.get_mut(&job.id) {
                row.attempts = attempt;
                row.retries_remaining -= 1;
                row.last_error = Some(error.clone());
                row.due_date = due_date;
                row.lock_owner = None;
                row.lock_expires_at = None;
            }
            tracing::warn!(
                job_id = %job.id,
                handler_type = %job.handler_type,
                attempt,
                retries_remaining = current.retries_remaining - 1,
                error = %error,
                "JobExecutor: job failed, retry scheduled"
            );
            JobResult::Retrying { attempt, due_date }
        } else {
            ctx.jobs.delete(&job.id);
            let mut failed = current.clone();
            failed.attempts = attempt;
            failed.last_error = Some(error.clone());
            failed.lock_owner = None;
            failed.lock_expires_at = None;
            ctx.dead_letters.insert_new(DeadLetterJob {
                id: job.id,
                job: failed,
                error: error.clone(),
                dead_lettered_at: now,
            });
            ctx.notify(LifecycleEvent::JobDeadLettered {
                job_id: job.id,
                handler_type: job.handler_type.clone(),
                case_id: job.case_id,
                error: error.clone(),
            });
            tracing::error!(
                job_id = %job.id,
                handler_type = %job.handler_type,
                attempts = attempt,
                error = %error,
                "JobExecutor: retries exhausted, job dead-lettered"
            );
            JobResult::DeadLettered
        };

        match ctx.flush().await {
            Ok(()) => {
                ctx.finish().await;
                Ok(result)
            }
            Err(e) if e.is_retryable() => Ok(JobResult::Abandoned),
            Err(e) => Err(e),
        }
    }

    /// Move due timer jobs into the executable table. Cycles re-arm the next
    /// occurrence in the same flush. Returns how many timers were moved.
    pub async fn reap_timers(&self) -> Result<usize, EngineError> {
        let now = self.registry.now();
        let due = self
            .registry
            .store
            .due_timer_jobs(now, self.registry.config.timer_reaper_batch)
            .await?;

        let mut moved = 0;
        for row in due {
            let timer = row.value.clone();
            let mut ctx = CommandContext::new(self.registry.clone());
            ctx.timer_jobs.insert_loaded(row);
            ctx.timer_jobs.delete(&timer.id);
            ctx.jobs.insert_new(Job {
                id: Uuid::now_v7(),
                job_type: JobType::Timer,
                handler_type: timer.handler_type.clone(),
                case_id: timer.case_id,
                plan_item_id: timer.plan_item_id,
                payload: timer.payload.clone(),
                due_date: timer.due_date,
                lock_owner: None,
                lock_expires_at: None,
                retries_remaining: timer.retries,
                attempts: 0,
                last_error: None,
                created_at: now,
            });
            if let Some(next) = next_occurrence(&timer, now) {
                ctx.timer_jobs.insert_new(next);
            }

            match ctx.flush().await {
                Ok(()) => moved += 1,
                Err(e) if e.is_retryable() => {
                    tracing::debug!(timer_id = %timer.id, "JobExecutor: timer reaped elsewhere");
                }
                Err(e) => return Err(e),
            }
        }
        if moved > 0 {
            tracing::debug!(moved, "JobExecutor: timers due");
        }
        Ok(moved)
    }

    /// One polling cycle, executed inline. Returns the number of jobs run.
    pub async fn run_once(&self) -> Result<usize, EngineError> {
        self.reap_timers().await?;
        let jobs = self
            .acquire_due_jobs(self.registry.config.max_jobs_per_acquisition)
            .await?;
        let count = jobs.len();
        for job in jobs {
            let job_id = job.value.id;
            if let Err(e) = self.execute(job).await {
                tracing::error!(job_id = %job_id, error = %e, "JobExecutor: job execution failed");
            }
        }
        Ok(count)
    }

    /// Run the polling loop until the shutdown signal is received.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let concurrency = self.registry.config.worker_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let interval = std::time::Duration::from_millis(self.registry.config.acquire_interval_ms);
        tracing::info!(node_id = %self.node_id(), concurrency, "JobExecutor started");

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!("JobExecutor shutting down");
                break;
            }

            if let Err(e) = self.reap_timers().await {
                tracing::warn!(error = %e, "JobExecutor: timer reaping failed");
            }

            let free = permits.available_permits();
            if free > 0 {
                let max = free.min(self.registry.config.max_jobs_per_acquisition);
                match self.acquire_due_jobs(max).await {
                    Ok(jobs) => {
                        for job in jobs {
                            let Ok(permit) = permits.clone().acquire_owned().await else {
                                break;
                            };
                            let executor = self.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                let job_id = job.value.id;
                                if let Err(e) = executor.execute(job).await {
                                    tracing::error!(
                                        job_id = %job_id,
                                        error = %e,
                                        "JobExecutor: job execution failed"
                                    );
                                }
                            });
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "JobExecutor: failed to acquire jobs");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    tracing::info!("JobExecutor shutting down (during sleep)");
                    break;
                }
            }
        }

        // Let in-flight jobs finish before returning.
        let _ = permits.acquire_many(concurrency as u32).await;
        tracing::info!("JobExecutor stopped");
    }
}

async fn run_handler(
    handler: &dyn JobHandler,
    job: &Job,
    ctx: &mut CommandContext,
) -> Result<JobOutcome, EngineError> {
    let outcome = handler.execute(job, ctx).await?;
    ctx.drain_agenda().await?;
    match outcome {
        JobOutcome::Done => {
            ctx.jobs.delete(&job.id);
        }
        JobOutcome::Deferred { until } => {
            if let Some(row) = ctx.jobs.get_mut(&job.id) {
                row.due_date = until;
                row.lock_owner = None;
                row.lock_expires_at = None;
            }
        }
    }
    ctx.flush().await?;
    Ok(outcome)
}

/// The timer job following `timer` in its cycle, if any.
fn next_occurrence(timer: &TimerJob, now: Timestamp) -> Option<TimerJob> {
    let cycle = timer.cycle.as_ref()?;
    let next_cycle = match cycle.remaining {
        None => Some(cycle.clone()),
        Some(0) => return None,
        Some(1) => None,
        Some(n) => Some(TimerCycle {
            interval_ms: cycle.interval_ms,
            remaining: Some(n - 1),
        }),
    };
    Some(TimerJob {
        id: Uuid::now_v7(),
        due_date: timer.due_date + cycle.interval_ms as i64,
        cycle: next_cycle,
        created_at: now,
        ..timer.clone()
    })
}
