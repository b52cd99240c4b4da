//! Record of truth for analysis records.
//!
//! Writes are version-checked: [`RecordStore::update`] only succeeds when the
//! caller's copy carries the version currently stored, and the stored version
//! is bumped on every successful write.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::analysis::AnalysisRecord;

/// Errors raised by record and approval stores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The caller's copy is stale.
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    Conflict { id: Uuid, expected: u64, actual: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The approval already carries a decision.
    #[error("approval for {0} is already decided")]
    AlreadyDecided(Uuid),

    /// The decision arrived at or after the approval deadline.
    #[error("approval for {0} timed out before the decision arrived")]
    DeadlinePassed(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage for analysis records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a new record.
    async fn insert(&self, record: AnalysisRecord) -> StoreResult<AnalysisRecord>;

    /// Reads a record.
    async fn get(&self, id: Uuid) -> StoreResult<Option<AnalysisRecord>>;

    /// Writes `record` if its version matches the stored one.
    ///
    /// Returns the stored copy with its bumped version.
    async fn update(&self, record: AnalysisRecord) -> StoreResult<AnalysisRecord>;

    /// Removes a record. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;

    /// Lists every record id.
    async fn list_ids(&self) -> StoreResult<Vec<Uuid>>;
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<Uuid, AnalysisRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, mut record: AnalysisRecord) -> StoreResult<AnalysisRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id.to_string()));
        }
        record.version = 1;
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<AnalysisRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn update(&self, mut record: AnalysisRecord) -> StoreResult<AnalysisRecord> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.to_string()))?;

        if stored.version != record.version {
            return Err(StoreError::Conflict {
                id: record.id,
                expected: record.version,
                actual: stored.version,
            });
        }

        record.version += 1;
        *stored = record.clone();
        Ok(record)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn list_ids(&self) -> StoreResult<Vec<Uuid>> {
        Ok(self.records.read().await.keys().copied().collect())
    }
}
