use crate::entity::{Entity, Versioned};
use crate::store::Mutation;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Clean,
    Dirty,
    New,
    Deleted,
}

#[derive(Clone, Debug)]
struct Entry<T> {
    value: T,
    /// Version read from the store; `None` for rows created in this context.
    original_version: Option<u64>,
    status: Status,
}

/// Unit-of-work cache for one row type.
///
/// A row loaded once is never replaced by a later load, so reads inside a
/// command always see the command's own writes.
#[derive(Debug)]
pub struct EntityCache<T> {
    entries: BTreeMap<Uuid, Entry<T>>,
}

impl<T> Default for EntityCache<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Entity> EntityCache<T> {
    pub fn insert_loaded(&mut self, row: Versioned<T>) {
        let id = row.value.id();
        self.entries.entry(id).or_insert(Entry {
            value: row.value,
            original_version: Some(row.version),
            status: Status::Clean,
        });
    }

    pub fn insert_new(&mut self, value: T) {
        self.entries.insert(
            value.id(),
            Entry {
                value,
                original_version: None,
                status: Status::New,
            },
        );
    }

    /// Mark a loaded row dirty without changing it, so the flush writes it
    /// back and checks its version.
    pub fn touch(&mut self, id: &Uuid) {
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.status == Status::Clean {
                entry.status = Status::Dirty;
            }
        }
    }

    /// Rows the next flush will insert, update or delete.
    pub fn changed(&self) -> impl Iterator<Item = &T> {
        self.entries
            .values()
            .filter(|e| e.status != Status::Clean)
            .map(|e| &e.value)
    }

    /// Known to the cache, including rows deleted in this context.
    pub fn is_tracked(&self, id: &Uuid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&T> {
        self.entries
            .get(id)
            .filter(|e| e.status != Status::Deleted)
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut T> {
        let entry = self
            .entries
            .get_mut(id)
            .filter(|e| e.status != Status::Deleted)?;
        if entry.status == Status::Clean {
            entry.status = Status::Dirty;
        }
        Some(&mut entry.value)
    }

    /// Returns false when the row was not present.
    pub fn delete(&mut self, id: &Uuid) -> bool {
        match self.entries.get(id).map(|e| e.status) {
            Some(Status::New) => {
                self.entries.remove(id);
                true
            }
            Some(Status::Clean | Status::Dirty) => {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.status = Status::Deleted;
                }
                true
            }
            _ => false,
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries
            .values()
            .filter(|e| e.status != Status::Deleted)
            .map(|e| &e.value)
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.entries
            .values()
            .filter_map(|e| match (e.status, e.original_version) {
                (Status::New, _) => Some(Mutation::Insert(e.value.clone().into_record())),
                (Status::Dirty, Some(v)) => Some(Mutation::Update {
                    record: e.value.clone().into_record(),
                    expected_version: v,
                }),
                (Status::Deleted, Some(v)) => Some(Mutation::Delete {
                    kind: T::KIND,
                    id: e.value.id(),
                    expected_version: v,
                }),
                _ => None,
            })
            .collect()
    }
}
