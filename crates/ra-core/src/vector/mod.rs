//! Vector similarity lookup over past incidents.
//!
//! The similarity backend is an external collaborator; this module defines
//! the seam ([`IncidentVectorStore`]), the embedder that turns a fingerprint
//! into a query vector, and an in-memory store used by tests and local runs.

mod embeddings;
mod error;
mod memory;

pub use embeddings::{Embedder, FingerprintEmbedder, DEFAULT_EMBEDDING_DIMENSION};
pub use error::{VectorStoreError, VectorStoreResult};
pub use memory::InMemoryIncidentStore;

use async_trait::async_trait;

use crate::analysis::HistoricalIncident;

/// Incidents returned by a similarity query, with their similarity scores
/// in the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimilarIncidents {
    pub incidents: Vec<HistoricalIncident>,
    pub similarity_scores: Vec<f32>,
}

impl SimilarIncidents {
    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    /// Pairs each incident with its score, dropping unpaired tails.
    pub fn into_pairs(self) -> Vec<(HistoricalIncident, f64)> {
        self.incidents
            .into_iter()
            .zip(self.similarity_scores.into_iter().map(f64::from))
            .collect()
    }
}

/// Trait for incident similarity backends.
///
/// Implementations must be thread-safe (`Send + Sync`).
#[async_trait]
pub trait IncidentVectorStore: Send + Sync {
    /// Returns at most `limit` incidents whose similarity to `embedding` is at
    /// least `min_similarity`, most similar first.
    async fn similar(
        &self,
        embedding: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> VectorStoreResult<SimilarIncidents>;

    /// Indexes an incident under `embedding`.
    async fn upsert(
        &self,
        incident: HistoricalIncident,
        embedding: Vec<f32>,
    ) -> VectorStoreResult<()>;
}
