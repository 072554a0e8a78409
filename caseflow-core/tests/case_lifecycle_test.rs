//! End-to-end case lifecycle: start, sentries, stage completion, events,
//! variables, suspension and termination, all through `CaseEngine`.

mod common;

use caseflow_core::command::TransitionPlanItem;
use caseflow_core::context::CommandContext;
use caseflow_core::entity::EntityKind;
use caseflow_core::types::{CaseState, PlanItemState, Transition};
use caseflow_core::{EngineConfig, EngineError, EntityStore};
use common::{vars, Rig};
use serde_json::json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

const REVIEW: &str = r#"
key: review
plan_model:
  id: case
  kind: Stage
  children:
    - id: S
      kind: Stage
      children:
        - id: H
          kind: HumanTask
          required: true
        - id: M
          kind: Milestone
          entry_criteria:
            - id: on_h_done
              on_parts:
                - source: H
                  event: completed
"#;

const EMPTY: &str = r#"
key: empty
plan_model:
  id: case
  kind: Stage
"#;

const BOTH: &str = r#"
key: both
plan_model:
  id: case
  kind: Stage
  children:
    - id: A
      kind: HumanTask
    - id: B
      kind: HumanTask
    - id: M
      kind: Milestone
      entry_criteria:
        - id: on_a_and_b
          on_parts:
            - source: A
              event: completed
            - source: B
              event: completed
"#;

const TRIPLE: &str = r#"
key: triple
plan_model:
  id: case
  kind: Stage
  children:
    - id: S
      kind: Stage
      children:
        - id: T1
          kind: HumanTask
          required: true
        - id: T2
          kind: HumanTask
          required: true
        - id: T3
          kind: HumanTask
          required: true
"#;

const APPROVAL: &str = r#"
key: approval
plan_model:
  id: case
  kind: Stage
  children:
    - id: intake
      kind: HumanTask
    - id: approve
      kind: HumanTask
      entry_criteria:
        - id: big_claim
          on_parts:
            - source: intake
              event: completed
          if_part: "${amount > 1000}"
    - id: escalate
      kind: Milestone
      required: true
      entry_criteria:
        - id: flagged
          if_part: "${flagged == true}"
    - id: docs
      kind: EventListener
      event: documents-received
      exit_criteria:
        - id: stop_waiting
          on_parts:
            - source: escalate
              event: occurred
"#;

const MALFORMED: &str = r#"
key: malformed
plan_model:
  id: case
  kind: Stage
  children:
    - id: intake
      kind: HumanTask
    - id: approve
      kind: HumanTask
      required: true
      entry_criteria:
        - id: big_claim
          on_parts:
            - source: intake
              event: completed
          if_part: "${amount >}"
"#;

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_completing_task_drives_milestone_stage_and_case() {
    let rig = Rig::new(&[REVIEW]);
    let case_id = rig
        .engine
        .start_case("review", Default::default())
        .await
        .unwrap();

    assert_eq!(rig.state(case_id, "H").await, PlanItemState::Active);
    assert_eq!(rig.state(case_id, "M").await, PlanItemState::Unavailable);
    assert_eq!(rig.state(case_id, "S").await, PlanItemState::Active);

    let h = rig.item(case_id, "H").await;
    let records = rig.engine.complete_plan_item(h.id).await.unwrap();
    let sequence: Vec<(&str, PlanItemState)> = records
        .iter()
        .map(|r| (r.definition_id.as_str(), r.to))
        .collect();
    assert_eq!(
        sequence,
        vec![
            ("H", PlanItemState::Completed),
            ("M", PlanItemState::Active),
            ("M", PlanItemState::Completed),
            ("S", PlanItemState::Completed),
            ("case", PlanItemState::Completed),
        ]
    );

    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
    assert!(case.end_time.is_some());
    assert_eq!(
        rig.event_names()
            .iter()
            .filter(|n| **n == "case_completed")
            .count(),
        1
    );
    // Nothing of the finished case is left to fire.
    assert!(rig.engine.subscriptions(case_id).await.unwrap().is_empty());
    assert!(rig.engine.sentry_instances(case_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_plan_model_completes_within_start() {
    let rig = Rig::new(&[EMPTY]);
    let case_id = rig.engine.start_case("empty", Default::default()).await.unwrap();

    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
    assert_eq!(rig.state(case_id, "case").await, PlanItemState::Completed);
    assert_eq!(
        rig.event_names(),
        vec![
            "case_started",
            "plan_item_transitioned",
            "plan_item_transitioned",
            "case_completed"
        ]
    );
}

#[tokio::test]
async fn test_unknown_definition_is_rejected() {
    let rig = Rig::new(&[EMPTY]);
    let err = rig
        .engine
        .start_case("nope", Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownDefinition(_)));
    assert_eq!(rig.store.count(EntityKind::Case), 0);
}

// ---------------------------------------------------------------------------
// Sentries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_and_sentry_fires_once_after_the_later_event() {
    let rig = Rig::new(&[BOTH]);
    let case_id = rig.engine.start_case("both", Default::default()).await.unwrap();
    let b = rig.item(case_id, "B").await;
    let a = rig.item(case_id, "A").await;

    let first = rig.engine.complete_plan_item(b.id).await.unwrap();
    assert!(first.iter().all(|r| r.definition_id != "M"));
    assert_eq!(rig.state(case_id, "M").await, PlanItemState::Unavailable);
    let record = rig
        .engine
        .sentry_instances(case_id)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(record.satisfied_on_parts.len(), 1);
    assert!(!record.satisfied);

    let second = rig.engine.complete_plan_item(a.id).await.unwrap();
    let starts = second
        .iter()
        .filter(|r| r.definition_id == "M" && r.transition == Transition::Start)
        .count();
    assert_eq!(starts, 1);
    assert_eq!(second[0].definition_id, "A");
    assert_eq!(rig.state(case_id, "M").await, PlanItemState::Completed);
}

#[tokio::test]
async fn test_if_part_waits_for_variables() {
    let rig = Rig::new(&[APPROVAL]);
    let case_id = rig
        .engine
        .start_case("approval", vars(json!({ "amount": 500 })))
        .await
        .unwrap();
    let intake = rig.item(case_id, "intake").await;

    rig.engine.complete_plan_item(intake.id).await.unwrap();
    // On-part seen, if-part false: the record is kept.
    assert_eq!(rig.state(case_id, "approve").await, PlanItemState::Unavailable);

    rig.engine
        .set_variables(case_id, vars(json!({ "amount": 5000 })))
        .await
        .unwrap();
    assert_eq!(rig.state(case_id, "approve").await, PlanItemState::Active);
}

#[tokio::test]
async fn test_if_only_sentry_and_exit_sentry() {
    let rig = Rig::new(&[APPROVAL]);
    let case_id = rig
        .engine
        .start_case("approval", Default::default())
        .await
        .unwrap();
    assert_eq!(rig.state(case_id, "docs").await, PlanItemState::Active);
    assert_eq!(rig.state(case_id, "escalate").await, PlanItemState::Unavailable);

    rig.engine
        .set_variables(case_id, vars(json!({ "flagged": true })))
        .await
        .unwrap();
    assert_eq!(rig.state(case_id, "escalate").await, PlanItemState::Completed);
    // The milestone's occurrence exits the listener.
    assert_eq!(rig.state(case_id, "docs").await, PlanItemState::Terminated);
    assert_eq!(
        rig.engine
            .trigger_event(case_id, "documents-received")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_failing_if_part_counts_as_false() {
    let rig = Rig::new(&[MALFORMED]);
    let case_id = rig.engine.start_case("malformed", Default::default()).await.unwrap();
    let intake = rig.item(case_id, "intake").await;

    rig.engine.complete_plan_item(intake.id).await.unwrap();
    assert_eq!(rig.state(case_id, "intake").await, PlanItemState::Completed);
    assert_eq!(rig.state(case_id, "approve").await, PlanItemState::Unavailable);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Active);
}

#[tokio::test]
async fn test_failing_if_part_aborts_the_command_when_strict() {
    let rig = Rig::with(&[MALFORMED], |b| {
        b.config(EngineConfig {
            strict_expressions: true,
            ..EngineConfig::default()
        })
    });
    let case_id = rig.engine.start_case("malformed", Default::default()).await.unwrap();
    let intake = rig.item(case_id, "intake").await;
    let before = rig.store.load(EntityKind::Case, case_id).await.unwrap().unwrap();

    let err = rig.engine.complete_plan_item(intake.id).await.unwrap_err();
    assert!(
        matches!(err, EngineError::ExpressionEvaluation { .. }),
        "{}",
        err
    );
    assert_eq!(rig.state(case_id, "intake").await, PlanItemState::Active);
    assert_eq!(rig.state(case_id, "approve").await, PlanItemState::Unavailable);
    assert!(rig.engine.sentry_instances(case_id).await.unwrap().is_empty());
    let after = rig.store.load(EntityKind::Case, case_id).await.unwrap().unwrap();
    assert_eq!(after.version, before.version);
}

// ---------------------------------------------------------------------------
// Stage completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stage_completes_once_after_last_required_child() {
    let rig = Rig::new(&[TRIPLE]);
    let case_id = rig.engine.start_case("triple", Default::default()).await.unwrap();

    let mut stage_completions = 0;
    for (n, id) in ["T2", "T3", "T1"].iter().enumerate() {
        let task = rig.item(case_id, id).await;
        let records = rig.engine.complete_plan_item(task.id).await.unwrap();
        let completed_here = records
            .iter()
            .filter(|r| r.definition_id == "S" && r.to == PlanItemState::Completed)
            .count();
        if n < 2 {
            assert_eq!(completed_here, 0, "stage completed after {}", id);
            assert_eq!(rig.state(case_id, "S").await, PlanItemState::Active);
        }
        stage_completions += completed_here;
    }
    assert_eq!(stage_completions, 1);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
}

// ---------------------------------------------------------------------------
// Concurrent commands on one case
// ---------------------------------------------------------------------------

/// Complete a plan item in a context of its own, stopping short of the flush.
async fn complete_unflushed(rig: &Rig, plan_item_id: Uuid) -> CommandContext {
    let mut ctx = CommandContext::new(rig.engine.registry().clone());
    ctx.execute_nested(&TransitionPlanItem {
        plan_item_id,
        transition: Transition::Complete,
    })
    .await
    .unwrap();
    ctx.drain_agenda().await.unwrap();
    ctx
}

#[tokio::test]
async fn test_racing_sibling_completions_cannot_both_commit() {
    let rig = Rig::new(&[TRIPLE]);
    let case_id = rig.engine.start_case("triple", Default::default()).await.unwrap();
    let t3 = rig.item(case_id, "T3").await;
    rig.engine.complete_plan_item(t3.id).await.unwrap();
    let t1 = rig.item(case_id, "T1").await;
    let t2 = rig.item(case_id, "T2").await;

    // Each sees the other sibling still active.
    let mut first = complete_unflushed(&rig, t1.id).await;
    let mut second = complete_unflushed(&rig, t2.id).await;
    first.flush().await.unwrap();
    let err = second.flush().await.unwrap_err();
    assert!(
        matches!(
            err,
            EngineError::VersionConflict {
                kind: EntityKind::Case,
                ..
            }
        ),
        "{}",
        err
    );
    assert_eq!(rig.state(case_id, "T2").await, PlanItemState::Active);
    assert_eq!(rig.state(case_id, "S").await, PlanItemState::Active);

    // Run again on fresh state, as the command executor does.
    rig.engine.complete_plan_item(t2.id).await.unwrap();
    assert_eq!(rig.state(case_id, "S").await, PlanItemState::Completed);
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
}

#[tokio::test]
async fn test_racing_on_parts_keep_one_sentry_record() {
    let rig = Rig::new(&[BOTH]);
    let case_id = rig.engine.start_case("both", Default::default()).await.unwrap();
    let a = rig.item(case_id, "A").await;
    let b = rig.item(case_id, "B").await;

    let mut first = complete_unflushed(&rig, a.id).await;
    let mut second = complete_unflushed(&rig, b.id).await;
    first.flush().await.unwrap();
    assert!(second.flush().await.unwrap_err().is_retryable());

    let records = rig.engine.sentry_instances(case_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].satisfied_on_parts.len(), 1);

    let retried = rig.engine.complete_plan_item(b.id).await.unwrap();
    let starts = retried
        .iter()
        .filter(|r| r.definition_id == "M" && r.transition == Transition::Start)
        .count();
    assert_eq!(starts, 1);
    assert_eq!(rig.state(case_id, "M").await, PlanItemState::Completed);
}

// ---------------------------------------------------------------------------
// Commands against illegal states
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_illegal_transition_leaves_store_untouched() {
    let rig = Rig::new(&[REVIEW]);
    let case_id = rig.engine.start_case("review", Default::default()).await.unwrap();
    let m = rig.item(case_id, "M").await;
    let h = rig.item(case_id, "H").await;

    for (id, transition) in [
        (m.id, Transition::Complete),
        (m.id, Transition::Occur),
        (h.id, Transition::Occur),
        (h.id, Transition::Resume),
    ] {
        let err = rig
            .engine
            .transition_plan_item(id, transition)
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::IllegalStateTransition { .. }),
            "{:?} gave {}",
            transition,
            err
        );
    }

    let after_m = rig.item(case_id, "M").await;
    let after_h = rig.item(case_id, "H").await;
    assert_eq!(after_m.state, PlanItemState::Unavailable);
    assert_eq!(after_h.state, PlanItemState::Active);
    assert_eq!(after_h.timestamps, h.timestamps);
    assert_eq!(rig.engine.plan_items(case_id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_terminate_case_ends_every_live_item() {
    let rig = Rig::new(&[REVIEW]);
    let case_id = rig.engine.start_case("review", Default::default()).await.unwrap();

    rig.engine.terminate_case(case_id).await.unwrap();
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Terminated);
    for item in rig.engine.plan_items(case_id).await.unwrap() {
        assert_eq!(item.state, PlanItemState::Terminated, "{}", item.definition_id);
    }
    assert!(rig.engine.subscriptions(case_id).await.unwrap().is_empty());

    let err = rig.engine.terminate_case(case_id).await.unwrap_err();
    assert!(matches!(err, EngineError::CaseNotActive { .. }));
}

#[tokio::test]
async fn test_suspended_case_rejects_work_until_resumed() {
    let rig = Rig::new(&[REVIEW]);
    let case_id = rig.engine.start_case("review", Default::default()).await.unwrap();
    let h = rig.item(case_id, "H").await;

    rig.engine.suspend_case(case_id).await.unwrap();
    assert_eq!(rig.state(case_id, "H").await, PlanItemState::Suspended);
    assert_eq!(rig.state(case_id, "S").await, PlanItemState::Suspended);
    let err = rig.engine.complete_plan_item(h.id).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::CaseNotActive {
            state: CaseState::Suspended,
            ..
        }
    ));

    rig.engine.resume_case(case_id).await.unwrap();
    assert_eq!(rig.state(case_id, "H").await, PlanItemState::Active);
    rig.engine.complete_plan_item(h.id).await.unwrap();
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
    assert!(rig.event_names().contains(&"case_suspended"));
    assert!(rig.event_names().contains(&"case_resumed"));
}

// ---------------------------------------------------------------------------
// Event listeners and manual activation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_event_listener_occurs_on_trigger() {
    let rig = Rig::new(&[APPROVAL]);
    let case_id = rig
        .engine
        .start_case("approval", Default::default())
        .await
        .unwrap();

    assert_eq!(rig.engine.trigger_event(case_id, "unrelated").await.unwrap(), 0);
    assert_eq!(
        rig.engine
            .trigger_event(case_id, "documents-received")
            .await
            .unwrap(),
        1
    );
    assert_eq!(rig.state(case_id, "docs").await, PlanItemState::Completed);
    // Delivered once: the listener is done.
    assert_eq!(
        rig.engine
            .trigger_event(case_id, "documents-received")
            .await
            .unwrap(),
        0
    );
}

const OPTIONAL: &str = r#"
key: optional
plan_model:
  id: case
  kind: Stage
  children:
    - id: main
      kind: HumanTask
      required: true
    - id: extra
      kind: HumanTask
      manual_activation: true
      parent_completion_rule: IgnoreIfAvailableOrEnabled
"#;

#[tokio::test]
async fn test_enabled_item_does_not_hold_the_case_open() {
    let rig = Rig::new(&[OPTIONAL]);
    let case_id = rig.engine.start_case("optional", Default::default()).await.unwrap();
    assert_eq!(rig.state(case_id, "extra").await, PlanItemState::Enabled);

    let main = rig.item(case_id, "main").await;
    rig.engine.complete_plan_item(main.id).await.unwrap();
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
    assert_eq!(rig.state(case_id, "extra").await, PlanItemState::Terminated);
}

#[tokio::test]
async fn test_started_optional_item_holds_the_case_open() {
    let rig = Rig::new(&[OPTIONAL]);
    let case_id = rig.engine.start_case("optional", Default::default()).await.unwrap();
    let extra = rig.item(case_id, "extra").await;
    let main = rig.item(case_id, "main").await;

    let started = rig.engine.start_plan_item(extra.id).await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].from, PlanItemState::Enabled);
    assert_eq!(started[0].to, PlanItemState::Active);

    rig.engine.complete_plan_item(main.id).await.unwrap();
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Active);

    rig.engine.complete_plan_item(extra.id).await.unwrap();
    let case = rig.engine.case(case_id).await.unwrap().unwrap();
    assert_eq!(case.state, CaseState::Completed);
}
