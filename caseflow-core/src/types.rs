use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Case variables. Values are plain JSON; the engine never interprets them
/// beyond expression evaluation.
pub type Variables = BTreeMap<String, serde_json::Value>;

// ─── Case instance ────────────────────────────────────────────

/// Top-level case state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseState {
    Active,
    Suspended,
    Completed,
    Terminated,
}

impl CaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseState::Completed | CaseState::Terminated)
    }
}

/// A running case, the root of one plan item tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseInstance {
    pub id: Uuid,
    pub definition_key: String,
    pub definition_version: u32,
    pub state: CaseState,
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    pub variables: Variables,
    /// The plan item instance of the case plan model (the root stage).
    pub root_plan_item_id: Option<Uuid>,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
}

// ─── Plan item lifecycle vocabulary ───────────────────────────

/// Closed set of plan item kinds. Each kind maps to one transition table and
/// one behavior in `lifecycle` / `behavior`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanItemKind {
    Stage,
    HumanTask,
    ServiceTask,
    Milestone,
    EventListener,
    TimerEventListener,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlanItemState {
    Available,
    Unavailable,
    Enabled,
    Active,
    Suspended,
    WaitingForRepetition,
    Completed,
    Terminated,
    Failed,
}

impl PlanItemState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanItemState::Completed | PlanItemState::Terminated | PlanItemState::Failed
        )
    }

    /// States that never block the completion of the enclosing stage.
    pub fn is_completable(&self) -> bool {
        matches!(self, PlanItemState::Completed | PlanItemState::Terminated)
    }

    /// Still waiting for an entry sentry or for activation.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            PlanItemState::Available
                | PlanItemState::Unavailable
                | PlanItemState::WaitingForRepetition
        )
    }
}

impl std::fmt::Display for PlanItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Standard transitions. Each emits exactly one standard event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    Enable,
    Start,
    Complete,
    Terminate,
    Exit,
    Suspend,
    Resume,
    Occur,
    Fault,
}

impl Transition {
    pub fn event(&self) -> StandardEvent {
        match self {
            Transition::Enable => StandardEvent::Enabled,
            Transition::Start => StandardEvent::Started,
            Transition::Complete => StandardEvent::Completed,
            Transition::Terminate => StandardEvent::Terminated,
            Transition::Exit => StandardEvent::Exited,
            Transition::Suspend => StandardEvent::Suspended,
            Transition::Resume => StandardEvent::Resumed,
            Transition::Occur => StandardEvent::Occurred,
            Transition::Fault => StandardEvent::Faulted,
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Named lifecycle occurrence of a plan item, as referenced by on-parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandardEvent {
    Enabled,
    Started,
    Completed,
    Terminated,
    Exited,
    Suspended,
    Resumed,
    Occurred,
    Faulted,
}

impl StandardEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Exited => "exited",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
            Self::Occurred => "occurred",
            Self::Faulted => "faulted",
        }
    }
}

impl std::fmt::Display for StandardEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StandardEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "terminated" => Ok(Self::Terminated),
            "exited" => Ok(Self::Exited),
            "suspended" => Ok(Self::Suspended),
            "resumed" => Ok(Self::Resumed),
            "occurred" => Ok(Self::Occurred),
            "faulted" => Ok(Self::Faulted),
            _ => Err(format!("Unknown standard event: {}", s)),
        }
    }
}

// ─── Plan item instance ───────────────────────────────────────

/// Per-state timestamps. Only the ones a plan item actually went through
/// are set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanItemTimestamps {
    pub created: Timestamp,
    pub last_state_change: Option<Timestamp>,
    pub enabled: Option<Timestamp>,
    pub activated: Option<Timestamp>,
    pub suspended: Option<Timestamp>,
    pub completed: Option<Timestamp>,
    pub occurred: Option<Timestamp>,
    pub terminated: Option<Timestamp>,
    pub exited: Option<Timestamp>,
    pub ended: Option<Timestamp>,
}

/// One node of a case's activity graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanItemInstance {
    pub id: Uuid,
    pub case_id: Uuid,
    /// Enclosing stage instance. `None` only for the case plan model.
    pub parent_id: Option<Uuid>,
    pub definition_id: String,
    pub kind: PlanItemKind,
    pub name: Option<String>,
    pub state: PlanItemState,
    /// Restored by `Resume`.
    pub state_before_suspend: Option<PlanItemState>,
    pub timestamps: PlanItemTimestamps,
    /// 0 for the first instance, incremented for each repetition.
    pub repetition_index: u32,
    /// Monotonic within a case; gives a stable creation order.
    pub creation_seq: u64,
}

// ─── Sentry activation ────────────────────────────────────────

/// Per-cycle satisfaction record of one sentry guarding one plan item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentryInstance {
    pub id: Uuid,
    pub case_id: Uuid,
    pub plan_item_id: Uuid,
    pub sentry_id: String,
    /// Indices into the sentry definition's on-part list.
    pub satisfied_on_parts: BTreeSet<usize>,
    pub satisfied: bool,
    pub fired_at: Option<Timestamp>,
}

// ─── Event subscriptions ──────────────────────────────────────

/// Binds a waiting plan item to an event name within one case.
///
/// On-part subscriptions carry the source definition id and the sentry
/// they feed; plain event subscriptions (event listeners) carry neither.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: Uuid,
    pub case_id: Uuid,
    pub plan_item_id: Uuid,
    pub event_name: String,
    pub source_definition_id: Option<String>,
    pub sentry_id: Option<String>,
    pub created_at: Timestamp,
}

// ─── Jobs ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Timer,
    AsyncContinuation,
}

/// An executable job. `lock_owner`/`lock_expires_at` are written by
/// acquisition only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub handler_type: String,
    pub case_id: Option<Uuid>,
    pub plan_item_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub due_date: Timestamp,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<Timestamp>,
    pub retries_remaining: u32,
    /// Failed executions so far; a job with `attempts > 0` is a retry.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
}

impl Job {
    pub fn is_retry(&self) -> bool {
        self.attempts > 0
    }

    pub fn is_lockable(&self, now: Timestamp) -> bool {
        self.due_date <= now
            && (self.lock_owner.is_none() || self.lock_expires_at.is_some_and(|exp| exp < now))
    }
}

/// Repetition of a timer: `remaining` is `None` for unbounded cycles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerCycle {
    pub interval_ms: u64,
    pub remaining: Option<u32>,
}

/// A timer waiting for its due date. The reaper turns it into a [`Job`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerJob {
    pub id: Uuid,
    pub handler_type: String,
    pub case_id: Option<Uuid>,
    pub plan_item_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub due_date: Timestamp,
    pub cycle: Option<TimerCycle>,
    pub retries: u32,
    pub created_at: Timestamp,
}

/// A job that exhausted its retries. Only an operator moves it back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: Uuid,
    pub job: Job,
    pub error: String,
    pub dead_lettered_at: Timestamp,
}

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
