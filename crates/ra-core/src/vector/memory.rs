//! In-memory incident similarity store.

use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};

use super::{IncidentVectorStore, SimilarIncidents, VectorStoreError, VectorStoreResult};
use crate::analysis::HistoricalIncident;

#[derive(Debug, Clone)]
struct IndexedIncident {
    incident: HistoricalIncident,
    embedding: Vec<f32>,
}

/// Brute-force cosine similarity store.
///
/// Can be switched into a failing mode to exercise degraded paths.
#[derive(Debug, Default)]
pub struct InMemoryIncidentStore {
    entries: RwLock<Vec<IndexedIncident>>,
    failure: RwLock<Option<VectorStoreError>>,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent query fail with `error`.
    pub fn fail_with(&self, error: VectorStoreError) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Clears a configured failure.
    pub fn recover(&self) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl IncidentVectorStore for InMemoryIncidentStore {
    async fn similar(
        &self,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> VectorStoreResult<SimilarIncidents> {
        if let Some(error) = self
            .failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(error);
        }

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored = Vec::new();
        for entry in entries.iter() {
            if entry.embedding.len() != embedding.len() {
                return Err(VectorStoreError::DimensionMismatch {
                    expected: entry.embedding.len(),
                    actual: embedding.len(),
                });
            }
            let score = Self::cosine_similarity(embedding, &entry.embedding);
            if score >= min_similarity {
                scored.push((entry.incident.clone(), score));
            }
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(limit);

        let (incidents, similarity_scores) = scored.into_iter().unzip();
        Ok(SimilarIncidents {
            incidents,
            similarity_scores,
        })
    }

    async fn upsert(
        &self,
        incident: HistoricalIncident,
        embedding: Vec<f32>,
    ) -> VectorStoreResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| e.incident.id != incident.id);
        entries.push(IndexedIncident {
            incident,
            embedding,
        });
        Ok(())
    }
}
