//! In-memory record store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::interceptor::{MutationStore, UpdateRequest};
use crate::record::{EntityKind, Record, VersionedFilter};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryStoreError {
    #[error("{model} {id} already exists")]
    Duplicate { model: EntityKind, id: String },
}

/// Records keyed by `(kind, id)`. Every compare-and-set runs under one lock.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(EntityKind, String), Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn find(&self, kind: EntityKind, id: &str) -> Option<Record> {
        self.records.lock().await.get(&(kind, id.to_string())).cloned()
    }

    /// Put a record as-is, version included. Bypasses version checks.
    pub async fn seed(&self, kind: EntityKind, record: Record) {
        self.records.lock().await.insert((kind, record.id.clone()), record);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MutationStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn insert(&self, kind: EntityKind, record: Record) -> Result<Record, MemoryStoreError> {
        let mut records = self.records.lock().await;
        let key = (kind, record.id.clone());
        if records.contains_key(&key) {
            return Err(MemoryStoreError::Duplicate {
                model: kind,
                id: record.id,
            });
        }
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn update_where(
        &self,
        kind: EntityKind,
        request: UpdateRequest,
    ) -> Result<Option<Record>, MemoryStoreError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&(kind, request.filter.base.id.clone())) else {
            return Ok(None);
        };
        if !request.filter.matches(record) {
            return Ok(None);
        }
        record.apply_changes(&request.changes);
        record.version = request.next_version;
        Ok(Some(record.clone()))
    }

    async fn delete_where(
        &self,
        kind: EntityKind,
        filter: VersionedFilter,
    ) -> Result<Option<Record>, MemoryStoreError> {
        let mut records = self.records.lock().await;
        let key = (kind, filter.base.id.clone());
        if !records.get(&key).is_some_and(|record| filter.matches(record)) {
            return Ok(None);
        }
        Ok(records.remove(&key))
    }
}
