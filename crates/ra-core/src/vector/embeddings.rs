//! Fingerprint embeddings.
//!
//! [`FingerprintEmbedder`] uses feature hashing: the fingerprint is split into
//! tokens, each token is expanded into a deterministic pseudo-random vector,
//! and the sum is normalized. Fingerprints that share tokens therefore land
//! close together without any model.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::VectorStoreResult;

/// Default embedding dimension.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 256;

/// Turns a fingerprint into a query vector.
pub trait Embedder: Send + Sync {
    /// Embeds `text`.
    fn embed(&self, text: &str) -> VectorStoreResult<Vec<f32>>;

    /// Embedding dimension.
    fn dimension(&self) -> usize;
}

/// Deterministic token-hashing embedder.
#[derive(Debug, Clone)]
pub struct FingerprintEmbedder {
    dimension: usize,
}

impl Default for FingerprintEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSION)
    }
}

impl FingerprintEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let mut seed = hasher.finish();

        let mut vector = Vec::with_capacity(self.dimension);
        for _ in 0..self.dimension {
            // LCG step
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            vector.push(((seed as f64) / (u64::MAX as f64) * 2.0 - 1.0) as f32);
        }
        vector
    }
}

impl Embedder for FingerprintEmbedder {
    fn embed(&self, text: &str) -> VectorStoreResult<Vec<f32>> {
        let mut embedding = vec![0.0f32; self.dimension];
        for token in Self::tokens(text) {
            for (acc, v) in embedding.iter_mut().zip(self.token_vector(&token)) {
                *acc += v;
            }
        }

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for v in &mut embedding {
                *v /= magnitude;
            }
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
