use crate::entity::EntityKind;
use crate::types::{CaseState, PlanItemState, Transition};
use uuid::Uuid;

/// Failures reported by an [`EntityStore`](crate::store::EntityStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A row changed (or appeared/disappeared) since it was read.
    #[error("Version conflict on {kind} {id}")]
    VersionConflict { kind: EntityKind, id: Uuid },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by commands and agenda operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Illegal transition {transition} on {kind:?} {plan_item_id} in state {state}")]
    IllegalStateTransition {
        plan_item_id: Uuid,
        kind: crate::types::PlanItemKind,
        state: PlanItemState,
        transition: Transition,
    },

    #[error("Parent stage {parent_id} is {state}, expected Active")]
    InvalidParentState {
        parent_id: Uuid,
        state: PlanItemState,
    },

    #[error("Concurrent modification of {kind} {id}")]
    VersionConflict { kind: EntityKind, id: Uuid },

    #[error("Expression '{expression}' failed: {message}")]
    ExpressionEvaluation { expression: String, message: String },

    #[error("Job handler '{handler_type}' failed: {message}")]
    JobHandler {
        handler_type: String,
        message: String,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error("Unknown case definition: {0}")]
    UnknownDefinition(String),

    #[error("Invalid case definition: {0}")]
    InvalidDefinition(String),

    #[error("Case {case_id} is {state:?}")]
    CaseNotActive { case_id: Uuid, state: CaseState },

    #[error("Agenda exceeded {limit} operations in one command")]
    AgendaOverflow { limit: usize },

    #[error("Store error: {0}")]
    Store(String),
}

impl EngineError {
    /// Only optimistic-lock conflicts are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::VersionConflict { .. })
    }

    pub fn not_found(kind: EntityKind, id: Uuid) -> Self {
        EngineError::NotFound { kind, id }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { kind, id } => EngineError::VersionConflict { kind, id },
            StoreError::Backend(msg) => EngineError::Store(msg),
        }
    }
}
