//! Storage collaborator contract
//!
//! Storage is a persistence sink for sealed records. It never sees
//! plaintext sensitive fields and never decrypts anything.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::{RecordId, SecretRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(RecordId),
}

pub trait RecordStore: Send + Sync {
    /// Insert when `record.id` is `None`, otherwise replace the record with
    /// that id. Returns the record's id.
    fn put(&self, record: &SecretRecord) -> Result<RecordId, StoreError>;

    fn get(&self, id: RecordId) -> Result<Option<SecretRecord>, StoreError>;

    fn delete(&self, id: RecordId) -> Result<(), StoreError>;

    /// Every record, in an implementation-defined order
    fn list_all(&self) -> Result<Vec<SecretRecord>, StoreError>;
}

/// Volatile store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<RecordId, SecretRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn put(&self, record: &SecretRecord) -> Result<RecordId, StoreError> {
        let mut records = self.records.lock();
        let id = match record.id {
            Some(id) => id,
            None => records.keys().next_back().map(|last| last + 1).unwrap_or(1),
        };

        let mut stored = record.clone();
        stored.id = Some(id);
        records.insert(id, stored);
        Ok(id)
    }

    fn get(&self, id: RecordId) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.records.lock().get(&id).cloned())
    }

    fn delete(&self, id: RecordId) -> Result<(), StoreError> {
        self.records
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    fn list_all(&self) -> Result<Vec<SecretRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
