use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable tables known to the entity store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Case,
    PlanItem,
    Sentry,
    Subscription,
    Job,
    TimerJob,
    DeadLetterJob,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One row of any table, as exchanged with the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EntityRecord {
    Case(CaseInstance),
    PlanItem(PlanItemInstance),
    Sentry(SentryInstance),
    Subscription(EventSubscription),
    Job(Job),
    TimerJob(TimerJob),
    DeadLetterJob(DeadLetterJob),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Case(_) => EntityKind::Case,
            EntityRecord::PlanItem(_) => EntityKind::PlanItem,
            EntityRecord::Sentry(_) => EntityKind::Sentry,
            EntityRecord::Subscription(_) => EntityKind::Subscription,
            EntityRecord::Job(_) => EntityKind::Job,
            EntityRecord::TimerJob(_) => EntityKind::TimerJob,
            EntityRecord::DeadLetterJob(_) => EntityKind::DeadLetterJob,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            EntityRecord::Case(e) => e.id,
            EntityRecord::PlanItem(e) => e.id,
            EntityRecord::Sentry(e) => e.id,
            EntityRecord::Subscription(e) => e.id,
            EntityRecord::Job(e) => e.id,
            EntityRecord::TimerJob(e) => e.id,
            EntityRecord::DeadLetterJob(e) => e.id,
        }
    }

    /// Owning case, used by the store to index case-scoped rows.
    pub fn case_id(&self) -> Option<Uuid> {
        match self {
            EntityRecord::Case(e) => Some(e.id),
            EntityRecord::PlanItem(e) => Some(e.case_id),
            EntityRecord::Sentry(e) => Some(e.case_id),
            EntityRecord::Subscription(e) => Some(e.case_id),
            EntityRecord::Job(e) => e.case_id,
            EntityRecord::TimerJob(e) => e.case_id,
            EntityRecord::DeadLetterJob(e) => e.job.case_id,
        }
    }
}

/// A row together with the optimistic-lock version the store holds for it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}

/// Typed view over [`EntityRecord`], implemented by every row type.
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> Uuid;
    fn into_record(self) -> EntityRecord;
    fn from_record(record: EntityRecord) -> Option<Self>;
}

macro_rules! impl_entity {
    ($ty:ty, $kind:ident) => {
        impl Entity for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn id(&self) -> Uuid {
                self.id
            }

            fn into_record(self) -> EntityRecord {
                EntityRecord::$kind(self)
            }

            fn from_record(record: EntityRecord) -> Option<Self> {
                match record {
                    EntityRecord::$kind(e) => Some(e),
                    _ => None,
                }
            }
        }
    };
}

impl_entity!(CaseInstance, Case);
impl_entity!(PlanItemInstance, PlanItem);
impl_entity!(SentryInstance, Sentry);
impl_entity!(EventSubscription, Subscription);
impl_entity!(Job, Job);
impl_entity!(TimerJob, TimerJob);
impl_entity!(DeadLetterJob, DeadLetterJob);
