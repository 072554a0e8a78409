use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// One applied plan item state change, in the order the agenda applied it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub case_id: Uuid,
    pub plan_item_id: Uuid,
    pub definition_id: String,
    pub kind: PlanItemKind,
    pub transition: Transition,
    pub from: PlanItemState,
    pub to: PlanItemState,
    pub at: Timestamp,
}

/// Lifecycle notifications, delivered after a command commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    CaseStarted {
        case_id: Uuid,
        definition_key: String,
        definition_version: u32,
    },
    CaseCompleted {
        case_id: Uuid,
        at: Timestamp,
    },
    CaseTerminated {
        case_id: Uuid,
        at: Timestamp,
    },
    CaseSuspended {
        case_id: Uuid,
    },
    CaseResumed {
        case_id: Uuid,
    },
    PlanItemTransitioned(TransitionRecord),
    JobDeadLettered {
        job_id: Uuid,
        handler_type: String,
        case_id: Option<Uuid>,
        error: String,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::CaseStarted { .. } => "case_started",
            LifecycleEvent::CaseCompleted { .. } => "case_completed",
            LifecycleEvent::CaseTerminated { .. } => "case_terminated",
            LifecycleEvent::CaseSuspended { .. } => "case_suspended",
            LifecycleEvent::CaseResumed { .. } => "case_resumed",
            LifecycleEvent::PlanItemTransitioned(_) => "plan_item_transitioned",
            LifecycleEvent::JobDeadLettered { .. } => "job_dead_lettered",
        }
    }
}

/// Receives lifecycle events. Delivery is fire-and-forget: an error is
/// logged by the engine and never fails the command that produced it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

/// Keeps every event in memory. Used by tests and embedders that poll.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock: {}", e))?
            .push(event.clone());
        Ok(())
    }
}

/// Writes events to the tracing pipeline at debug level.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match event {
            LifecycleEvent::PlanItemTransitioned(r) => tracing::debug!(
                case_id = %r.case_id,
                plan_item_id = %r.plan_item_id,
                definition_id = %r.definition_id,
                from = %r.from,
                to = %r.to,
                "PlanItem transitioned"
            ),
            LifecycleEvent::JobDeadLettered {
                job_id,
                handler_type,
                error,
                ..
            } => tracing::warn!(
                job_id = %job_id,
                handler_type = %handler_type,
                error = %error,
                "Job dead-lettered"
            ),
            other => tracing::debug!(event = other.name(), ?other, "Case lifecycle"),
        }
        Ok(())
    }
}
