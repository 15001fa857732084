use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{CommitOutcome, StoreError, Transaction, VolatileStore, WriteOp};

/// In-process store. One mutex guards all keys, so every call and every
/// commit is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    sets: HashMap<String, BTreeSet<String>>,
    records: HashMap<String, BTreeMap<String, String>>,
    values: HashMap<String, String>,
    versions: HashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_insert(0) += 1;
    }

    fn apply(&mut self, op: &WriteOp) -> bool {
        let (key, changed) = match op {
            WriteOp::AddToSet { set, member } => {
                let changed = self
                    .sets
                    .entry(set.clone())
                    .or_default()
                    .insert(member.clone());
                (set, changed)
            }
            WriteOp::RemoveFromSet { set, member } => {
                let changed = match self.sets.get_mut(set) {
                    Some(members) => {
                        let removed = members.remove(member);
                        if members.is_empty() {
                            self.sets.remove(set);
                        }
                        removed
                    }
                    None => false,
                };
                (set, changed)
            }
            WriteOp::SetField { key, field, value } => {
                self.records
                    .entry(key.clone())
                    .or_default()
                    .insert(field.clone(), value.clone());
                (key, true)
            }
            WriteOp::DeleteFields { key } => (key, self.records.remove(key).is_some()),
            WriteOp::SetValue { key, value } => {
                self.values.insert(key.clone(), value.clone());
                (key, true)
            }
            WriteOp::DeleteValue { key } => (key, self.values.remove(key).is_some()),
        };
        if changed {
            self.touch(key);
        }
        changed
    }
}

impl VolatileStore for MemoryStore {
    fn add_to_set(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.lock().apply(&WriteOp::AddToSet {
            set: set.to_string(),
            member: member.to_string(),
        }))
    }

    fn remove_from_set(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.lock().apply(&WriteOp::RemoveFromSet {
            set: set.to_string(),
            member: member.to_string(),
        }))
    }

    fn set_contains(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .sets
            .get(set)
            .is_some_and(|members| members.contains(member)))
    }

    fn set_members(&self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.lock().sets.get(set).cloned().unwrap_or_default())
    }

    fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.lock().apply(&WriteOp::SetField {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .records
            .get(key)
            .and_then(|record| record.get(field))
            .cloned())
    }

    fn delete_fields(&self, key: &str) -> Result<(), StoreError> {
        self.lock().apply(&WriteOp::DeleteFields {
            key: key.to_string(),
        });
        Ok(())
    }

    fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().values.get(key).cloned())
    }

    fn begin_optimistic(&self, watch_keys: &[String]) -> Result<Transaction, StoreError> {
        let inner = self.lock();
        let watched = watch_keys
            .iter()
            .map(|key| (key.clone(), inner.version(key)))
            .collect();
        Ok(Transaction::with_watched(watched))
    }

    fn watch(&self, tx: &mut Transaction, keys: &[String]) -> Result<(), StoreError> {
        let inner = self.lock();
        for key in keys {
            tx.record_watch(key.clone(), inner.version(key));
        }
        Ok(())
    }

    fn commit(&self, tx: Transaction) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.lock();
        let unchanged = tx
            .watched()
            .iter()
            .all(|(key, version)| inner.version(key) == *version);
        if !unchanged {
            return Ok(CommitOutcome::Conflict);
        }
        for op in tx.into_ops() {
            inner.apply(&op);
        }
        Ok(CommitOutcome::Committed)
    }
}
