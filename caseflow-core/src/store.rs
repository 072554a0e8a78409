use crate::entity::{EntityKind, EntityRecord, Versioned};
use crate::error::StoreError;
use crate::types::*;
use async_trait::async_trait;
use uuid::Uuid;

/// One write of a flush batch. Updates and deletes carry the version the
/// writer read; a mismatch fails the whole batch.
#[derive(Clone, Debug)]
pub enum Mutation {
    Insert(EntityRecord),
    Update {
        record: EntityRecord,
        expected_version: u64,
    },
    Delete {
        kind: EntityKind,
        id: Uuid,
        expected_version: u64,
    },
}

impl Mutation {
    pub fn kind(&self) -> EntityKind {
        match self {
            Mutation::Insert(record) | Mutation::Update { record, .. } => record.kind(),
            Mutation::Delete { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Mutation::Insert(record) | Mutation::Update { record, .. } => record.id(),
            Mutation::Delete { id, .. } => *id,
        }
    }
}

/// Durable storage for every engine row.
///
/// The command context reads through `load`/`load_case_rows` and writes
/// exclusively through `batch_flush`. Job acquisition is the one
/// compare-and-set operation outside a flush: it must behave like
/// `UPDATE … SET lock_owner = ? WHERE lock_owner IS NULL OR lock_expiration < now`.
#[async_trait]
pub trait EntityStore: Send + Sync {
    // ── Rows ──

    async fn load(
        &self,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<Versioned<EntityRecord>>, StoreError>;

    /// Case row, plan items, sentry instances and subscriptions of one case.
    async fn load_case_rows(&self, case_id: Uuid)
        -> Result<Vec<Versioned<EntityRecord>>, StoreError>;

    /// Apply all mutations atomically, bumping versions, or none of them.
    async fn batch_flush(&self, mutations: Vec<Mutation>) -> Result<(), StoreError>;

    // ── Jobs ──

    /// Claim up to `max` due, unlocked (or lock-expired) jobs for `owner`.
    /// Returns only the jobs this call claimed, with their new versions.
    async fn acquire_jobs(
        &self,
        owner: &str,
        now: Timestamp,
        lock_expires_at: Timestamp,
        max: usize,
    ) -> Result<Vec<Versioned<Job>>, StoreError>;

    async fn due_timer_jobs(
        &self,
        now: Timestamp,
        max: usize,
    ) -> Result<Vec<Versioned<TimerJob>>, StoreError>;

    /// Executable and timer jobs belonging to a case.
    async fn case_jobs(
        &self,
        case_id: Uuid,
    ) -> Result<(Vec<Versioned<Job>>, Vec<Versioned<TimerJob>>), StoreError>;

    // ── Operator queries ──

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
    async fn list_timer_jobs(&self) -> Result<Vec<TimerJob>, StoreError>;
    async fn list_dead_letter_jobs(&self) -> Result<Vec<DeadLetterJob>, StoreError>;
}
