use crate::entity::{Entity, EntityKind, EntityRecord, Versioned};
use crate::error::StoreError;
use crate::store::{EntityStore, Mutation};
use crate::types::*;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

type RowKey = (EntityKind, Uuid);

#[derive(Default)]
struct Inner {
    rows: HashMap<RowKey, Versioned<EntityRecord>>,
    by_case: HashMap<Uuid, BTreeSet<RowKey>>,
}

impl Inner {
    fn check(&self, mutation: &Mutation) -> Result<(), StoreError> {
        let key = (mutation.kind(), mutation.id());
        let current = self.rows.get(&key).map(|r| r.version);
        let ok = match mutation {
            Mutation::Insert(_) => current.is_none(),
            Mutation::Update {
                expected_version, ..
            }
            | Mutation::Delete {
                expected_version, ..
            } => current == Some(*expected_version),
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::VersionConflict {
                kind: key.0,
                id: key.1,
            })
        }
    }

    fn put(&mut self, record: EntityRecord, version: u64) {
        let key = (record.kind(), record.id());
        if let Some(case_id) = record.case_id() {
            self.by_case.entry(case_id).or_default().insert(key);
        }
        self.rows.insert(key, Versioned::new(record, version));
    }

    fn remove(&mut self, key: RowKey) {
        if let Some(row) = self.rows.remove(&key) {
            if let Some(case_id) = row.value.case_id() {
                if let Some(keys) = self.by_case.get_mut(&case_id) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        self.by_case.remove(&case_id);
                    }
                }
            }
        }
    }

    fn typed<T: Entity>(&self) -> Vec<Versioned<T>> {
        self.rows
            .values()
            .filter(|r| r.value.kind() == T::KIND)
            .filter_map(|r| T::from_record(r.value.clone()).map(|v| Versioned::new(v, r.version)))
            .collect()
    }
}

/// In-memory EntityStore for tests, the worker binary and single-node use.
///
/// A single `RwLock` makes every flush and every acquisition atomic, which
/// is exactly the isolation a SQL backend gets from one transaction.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|e| StoreError::Backend(format!("Lock: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|e| StoreError::Backend(format!("Lock: {}", e)))
    }

    /// Number of rows of one kind (test helper).
    pub fn count(&self, kind: EntityKind) -> usize {
        self.read()
            .map(|inner| inner.rows.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn load(
        &self,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<Versioned<EntityRecord>>, StoreError> {
        Ok(self.read()?.rows.get(&(kind, id)).cloned())
    }

    async fn load_case_rows(
        &self,
        case_id: Uuid,
    ) -> Result<Vec<Versioned<EntityRecord>>, StoreError> {
        let inner = self.read()?;
        let Some(keys) = inner.by_case.get(&case_id) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter(|(kind, _)| {
                matches!(
                    kind,
                    EntityKind::Case
                        | EntityKind::PlanItem
                        | EntityKind::Sentry
                        | EntityKind::Subscription
                )
            })
            .filter_map(|key| inner.rows.get(key).cloned())
            .collect())
    }

    async fn batch_flush(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        let mut inner = self.write()?;

        // Verify every precondition before touching anything.
        for mutation in &mutations {
            inner.check(mutation)?;
        }

        for mutation in mutations {
            match mutation {
                Mutation::Insert(record) => inner.put(record, 1),
                Mutation::Update {
                    record,
                    expected_version,
                } => inner.put(record, expected_version + 1),
                Mutation::Delete { kind, id, .. } => inner.remove((kind, id)),
            }
        }
        Ok(())
    }

    async fn acquire_jobs(
        &self,
        owner: &str,
        now: Timestamp,
        lock_expires_at: Timestamp,
        max: usize,
    ) -> Result<Vec<Versioned<Job>>, StoreError> {
        let mut inner = self.write()?;
        let mut due: Vec<Versioned<Job>> = inner
            .typed::<Job>()
            .into_iter()
            .filter(|j| j.value.is_lockable(now))
            .collect();
        due.sort_by_key(|j| (j.value.due_date, j.value.id));
        due.truncate(max);

        let mut claimed = Vec::with_capacity(due.len());
        for row in due {
            let mut job = row.value;
            job.lock_owner = Some(owner.to_string());
            job.lock_expires_at = Some(lock_expires_at);
            let version = row.version + 1;
            inner.put(EntityRecord::Job(job.clone()), version);
            claimed.push(Versioned::new(job, version));
        }
        Ok(claimed)
    }

    async fn due_timer_jobs(
        &self,
        now: Timestamp,
        max: usize,
    ) -> Result<Vec<Versioned<TimerJob>>, StoreError> {
        let inner = self.read()?;
        let mut due: Vec<Versioned<TimerJob>> = inner
            .typed::<TimerJob>()
            .into_iter()
            .filter(|t| t.value.due_date <= now)
            .collect();
        due.sort_by_key(|t| (t.value.due_date, t.value.id));
        due.truncate(max);
        Ok(due)
    }

    async fn case_jobs(
        &self,
        case_id: Uuid,
    ) -> Result<(Vec<Versioned<Job>>, Vec<Versioned<TimerJob>>), StoreError> {
        let inner = self.read()?;
        let mut jobs = Vec::new();
        let mut timers = Vec::new();
        if let Some(keys) = inner.by_case.get(&case_id) {
            for key in keys {
                let Some(row) = inner.rows.get(key) else {
                    continue;
                };
                match &row.value {
                    EntityRecord::Job(j) => jobs.push(Versioned::new(j.clone(), row.version)),
                    EntityRecord::TimerJob(t) => {
                        timers.push(Versioned::new(t.clone(), row.version))
                    }
                    _ => {}
                }
            }
        }
        Ok((jobs, timers))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.read()?.typed::<Job>().into_iter().map(|j| j.value).collect();
        jobs.sort_by_key(|j| (j.due_date, j.id));
        Ok(jobs)
    }

    async fn list_timer_jobs(&self) -> Result<Vec<TimerJob>, StoreError> {
        let mut timers: Vec<TimerJob> = self
            .read()?
            .typed::<TimerJob>()
            .into_iter()
            .map(|t| t.value)
            .collect();
        timers.sort_by_key(|t| (t.due_date, t.id));
        Ok(timers)
    }

    async fn list_dead_letter_jobs(&self) -> Result<Vec<DeadLetterJob>, StoreError> {
        let mut dead: Vec<DeadLetterJob> = self
            .read()?
            .typed::<DeadLetterJob>()
            .into_iter()
            .map(|d| d.value)
            .collect();
        dead.sort_by_key(|d| (d.dead_lettered_at, d.id));
        Ok(dead)
    }
}
