//! Async continuations, retries, dead letters and timers, driven by
//! `run_due_jobs` on a manual clock.

mod common;

use caseflow_core::job::JobResult;
use caseflow_core::types::{CaseState, PlanItemState};
use common::{vars, FlakyTask, Rig, START};
use serde_json::json;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

const PAYOUT: &str = r#"
key: payout
plan_model:
  id: case
  kind: Stage
  children:
    - id: pay
      kind: ServiceTask
      task_type: pay
      async: true
      retries: 2
"#;

const INLINE: &str = r#"
key: inline
plan_model:
  id: case
  kind: Stage
  children:
    - id: score
      kind: ServiceTask
      task_type: score
    - id: fast_track
      kind: Milestone
      entry_criteria:
        - id: high_score
          on_parts:
            - source: score
              event: completed
          if_part: "${score >= 80}"
"#;

const REMINDER: &str = r#"
key: reminder
plan_model:
  id: case
  kind: Stage
  children:
    - id: work
      kind: HumanTask
      required: true
    - id: deadline
      kind: TimerEventListener
      timer: PT1H
    - id: overdue
      kind: Milestone
      entry_criteria:
        - id: on_deadline
          on_parts:
            - source: deadline
              event: occurred
    - id: nudge
      kind: TimerEventListener
      timer: R3/PT10M
      parent_completion_rule: Ignore
      repetition:
        max_instance_count: 3
"#;

const RECHECK: &str = r#"
key: recheck
plan_model:
  id: case
  kind: Stage
  children:
    - id: check
      kind: ServiceTask
      task_type: check
      repetition: {}
"#;

const MINUTE: i64 = 60_000;
/// Longer than any backoff delay with the default configuration.
const PAST_BACKOFF: i64 = 15 * MINUTE;

// ---------------------------------------------------------------------------
// Retries and dead letters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failing_job_is_attempted_three_times_then_dead_lettered() {
    let task = FlakyTask::new(usize::MAX, Default::default());
    let behavior = task.clone();
    let rig = Rig::with(&[PAYOUT], |b| b.service_task("pay", behavior));
    let case_id = rig.engine.start_case("payout", Default::default()).await.unwrap();
    assert_eq!(rig.state(case_id, "pay").await, PlanItemState::Active);

    let jobs = rig.engine.jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job_id = jobs[0].id;
    assert_eq!(jobs[0].retries_remaining, 2);

    assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 1);
    let retry = rig.engine.jobs().await.unwrap().pop().unwrap();
    assert_eq!(retry.id, job_id);
    assert!(retry.is_retry());
    assert_eq!(retry.retries_remaining, 1);
    assert!(retry.due_date > START);
    assert!(retry.lock_owner.is_none());
    // Not due yet.
    assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 0);

    for _ in 0..2 {
        rig.clock.advance(PAST_BACKOFF);
        assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 1);
    }
    assert_eq!(task.calls(), 3);
    assert!(rig.engine.jobs().await.unwrap().is_empty());

    let dead = rig.engine.dead_letter_jobs().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);
    assert_eq!(dead[0].job.attempts, 3);
    assert!(dead[0].error.contains("unavailable"), "{}", dead[0].error);
    assert!(rig.event_names().contains(&"job_dead_lettered"));

    // Nothing picks it up again.
    rig.clock.advance(PAST_BACKOFF);
    assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 0);
    assert_eq!(task.calls(), 3);
    assert_eq!(rig.engine.dead_letter_jobs().await.unwrap().len(), 1);
    assert_eq!(rig.state(case_id, "pay").await, PlanItemState::Active);
}

#[tokio::test]
async fn test_retried_dead_letter_completes_the_task() {
    let task = FlakyTask::new(3, vars(json!({ "paid": true })));
    let behavior = task.clone();
    let rig = Rig::with(&[PAYOUT], |b| b.service_task("pay", behavior));
    let case_id = rig.engine.start_case("payout", Default::default()).await.unwrap();

    for _ in 0..3 {
        rig.engine.run_due_jobs().await.unwrap();
        rig.clock.advance(PAST_BACKOFF);
    }
    let dead = rig.engine.dead_letter_jobs().await.unwrap();
    assert_eq!(dead.len(), 1);

    rig.engine.retry_dead_letter(dead[0].id, 1).await.unwrap();
    assert!(rig.engine.dead_letter_jobs().await.unwrap().is_empty());
    assert_eq!(rig.engine.jobs().await.unwrap()[0].retries_remaining, 1);

    assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 1);
    assert_eq!(task.calls(), 4);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
    assert_eq!(case.variables.get("paid"), Some(&json!(true)));
    assert!(rig.engine.jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_service_behavior_consumes_retries() {
    // No behavior registered for "pay".
    let rig = Rig::new(&[PAYOUT]);
    rig.engine.start_case("payout", Default::default()).await.unwrap();
    let executor = rig.engine.job_executor();

    let job = executor.acquire_due_jobs(10).await.unwrap().pop().unwrap();
    let result = executor.execute(job).await.unwrap();
    assert!(matches!(result, JobResult::Retrying { attempt: 1, .. }));
    let stored = rig.engine.jobs().await.unwrap().pop().unwrap();
    assert!(stored.last_error.unwrap().contains("pay"));
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_jobs_of_suspended_case_are_deferred_without_using_retries() {
    let task = FlakyTask::new(0, Default::default());
    let behavior = task.clone();
    let rig = Rig::with(&[PAYOUT], |b| b.service_task("pay", behavior));
    let case_id = rig.engine.start_case("payout", Default::default()).await.unwrap();

    rig.engine.suspend_case(case_id).await.unwrap();
    assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 1);
    assert_eq!(task.calls(), 0);
    let deferred = rig.engine.jobs().await.unwrap().pop().unwrap();
    assert_eq!(deferred.attempts, 0);
    assert_eq!(deferred.retries_remaining, 2);
    let lock_duration = rig.engine.registry().config.lock_duration_ms as i64;
    assert_eq!(deferred.due_date, START + lock_duration);

    rig.engine.resume_case(case_id).await.unwrap();
    assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 0);
    rig.clock.advance(lock_duration);
    assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 1);
    assert_eq!(task.calls(), 1);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
}

// ---------------------------------------------------------------------------
// Synchronous service tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sync_service_task_outputs_feed_if_parts() {
    let rig = Rig::with(&[INLINE], |b| {
        b.service_task("score", FlakyTask::new(0, vars(json!({ "score": 91 }))))
    });
    let case_id = rig.engine.start_case("inline", Default::default()).await.unwrap();

    assert_eq!(rig.state(case_id, "score").await, PlanItemState::Completed);
    assert_eq!(rig.state(case_id, "fast_track").await, PlanItemState::Completed);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
    assert!(rig.engine.jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sync_service_task_failure_faults_the_item() {
    let rig = Rig::with(&[INLINE], |b| {
        b.service_task("score", FlakyTask::new(1, Default::default()))
    });
    let case_id = rig.engine.start_case("inline", Default::default()).await.unwrap();

    assert_eq!(rig.state(case_id, "score").await, PlanItemState::Failed);
    assert_eq!(rig.state(case_id, "fast_track").await, PlanItemState::Unavailable);
    // A failed child holds its stage open.
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Active);
}

#[tokio::test]
async fn test_failed_repeatable_task_is_not_repeated() {
    let task = FlakyTask::new(usize::MAX, Default::default());
    let behavior = task.clone();
    let rig = Rig::with(&[RECHECK], |b| b.service_task("check", behavior));
    let case_id = rig.engine.start_case("recheck", Default::default()).await.unwrap();

    assert_eq!(task.calls(), 1);
    let checks = rig
        .engine
        .plan_items_by_definition(case_id, "check")
        .await
        .unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].state, PlanItemState::Failed);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Active);
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_timer_listener_occurs_when_due() {
    let rig = Rig::new(&[REMINDER]);
    let case_id = rig.engine.start_case("reminder", Default::default()).await.unwrap();
    assert_eq!(rig.state(case_id, "deadline").await, PlanItemState::Active);
    assert_eq!(rig.engine.timer_jobs().await.unwrap().len(), 2);

    rig.clock.advance(59 * MINUTE);
    rig.engine.run_due_jobs().await.unwrap();
    assert_eq!(rig.state(case_id, "deadline").await, PlanItemState::Active);

    rig.clock.advance(MINUTE);
    rig.engine.run_due_jobs().await.unwrap();
    assert_eq!(rig.state(case_id, "deadline").await, PlanItemState::Completed);
    assert_eq!(rig.state(case_id, "overdue").await, PlanItemState::Completed);
    assert_eq!(rig.state(case_id, "work").await, PlanItemState::Active);
}

#[tokio::test]
async fn test_timer_cycle_drives_repetitions() {
    let rig = Rig::new(&[REMINDER]);
    let case_id = rig.engine.start_case("reminder", Default::default()).await.unwrap();

    for fired in 1..=3 {
        rig.clock.advance(10 * MINUTE);
        rig.engine.run_due_jobs().await.unwrap();
        let nudges = rig
            .engine
            .plan_items_by_definition(case_id, "nudge")
            .await
            .unwrap();
        let occurred = nudges
            .iter()
            .filter(|n| n.state == PlanItemState::Completed)
            .count();
        assert_eq!(occurred, fired);
    }

    let nudges = rig
        .engine
        .plan_items_by_definition(case_id, "nudge")
        .await
        .unwrap();
    assert_eq!(nudges.len(), 3);
    let indices: Vec<u32> = nudges.iter().map(|n| n.repetition_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    // Only the one-shot deadline timer is left.
    let timers = rig.engine.timer_jobs().await.unwrap();
    assert_eq!(timers.len(), 1);
    assert!(timers[0].cycle.is_none());
}

#[tokio::test]
async fn test_terminating_case_drops_its_timers() {
    let rig = Rig::new(&[REMINDER]);
    let case_id = rig.engine.start_case("reminder", Default::default()).await.unwrap();
    rig.engine.terminate_case(case_id).await.unwrap();

    assert!(rig.engine.timer_jobs().await.unwrap().is_empty());
    rig.clock.advance(2 * 60 * MINUTE);
    assert_eq!(rig.engine.run_due_jobs().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Several executor nodes
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_run_a_job_once() {
    let task = FlakyTask::new(0, Default::default());
    let behavior = task.clone();
    let rig = Rig::with(&[PAYOUT], |b| b.service_task("pay", behavior.clone()));
    let peer = rig.peer("peer-node", |b| b.service_task("pay", behavior));
    let case_id = rig.engine.start_case("payout", Default::default()).await.unwrap();

    let first = rig.engine.job_executor();
    let second = peer.job_executor();
    let (a, b) = tokio::join!(first.run_once(), second.run_once());
    assert_eq!(a.unwrap() + b.unwrap(), 1);
    assert_eq!(task.calls(), 1);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
}

#[tokio::test]
async fn test_reclaimed_job_commits_once_when_the_first_owner_wakes_up() {
    let task = FlakyTask::new(0, vars(json!({ "paid": true })));
    let behavior = task.clone();
    let rig = Rig::with(&[PAYOUT], |b| b.service_task("pay", behavior.clone()));
    let peer = rig.peer("peer-node", |b| b.service_task("pay", behavior));
    let case_id = rig.engine.start_case("payout", Default::default()).await.unwrap();

    let stalled = rig.engine.job_executor();
    let stale = stalled.acquire_due_jobs(1).await.unwrap().pop().unwrap();

    // The first owner's lock runs out before it gets to run the job.
    let lock_duration = rig.engine.registry().config.lock_duration_ms as i64;
    rig.clock.advance(lock_duration + 1);
    let live = peer.job_executor();
    let reclaimed = live.acquire_due_jobs(1).await.unwrap().pop().unwrap();
    assert_eq!(reclaimed.value.id, stale.value.id);
    assert_eq!(reclaimed.value.lock_owner.as_deref(), Some("peer-node"));
    assert_eq!(live.execute(reclaimed).await.unwrap(), JobResult::Succeeded);
    assert_eq!(task.calls(), 1);

    let late = stalled.execute(stale).await.unwrap();
    assert!(
        matches!(late, JobResult::LockReleased | JobResult::Abandoned),
        "{:?}",
        late
    );
    assert_eq!(task.calls(), 1);
    let completions = rig
        .event_names()
        .iter()
        .filter(|name| **name == "case_completed")
        .count();
    assert_eq!(completions, 1);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
    assert!(rig.engine.jobs().await.unwrap().is_empty());
    assert!(rig.engine.dead_letter_jobs().await.unwrap().is_empty());
}
