//! Historical similarity service.
//!
//! Synthesizes an [`InvestigationResult`] from past incidents when the
//! primary investigation path is unavailable. The service never fails: a
//! store error or an empty result yields a low-confidence "no historical
//! data" result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::analysis::{AnalysisRequest, HistoricalIncident, InvestigationResult, Recommendation};
use crate::vector::{Embedder, IncidentVectorStore, SimilarIncidents};

/// Tool name recorded on synthesized results.
pub const HISTORICAL_TOOL: &str = "historical-similarity";

/// Root cause prefix used when nothing comparable was found.
pub const NO_HISTORICAL_DATA: &str = "no historical data";

/// Configuration for historical lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoricalConfig {
    /// Maximum candidates retrieved.
    pub top_k: usize,
    /// Minimum similarity for a candidate to count.
    pub min_similarity: f32,
    /// Age at which the recency weight halves.
    #[serde(with = "crate::clock::duration_secs")]
    pub half_life: Duration,
    /// Lowest recency weight any incident receives.
    pub recency_floor: f64,
    pub similarity_weight: f64,
    pub success_weight: f64,
    pub recency_weight: f64,
    /// Number of top candidates averaged for the overall confidence.
    pub confidence_sample: usize,
    /// Multiplier applied to the averaged relevance.
    pub confidence_scale: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    /// Deadline for a single store query.
    #[serde(with = "crate::clock::duration_secs")]
    pub query_timeout: Duration,
}

impl Default for HistoricalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: 0.7,
            half_life: Duration::from_secs(30 * 24 * 60 * 60),
            recency_floor: 0.1,
            similarity_weight: 0.5,
            success_weight: 0.3,
            recency_weight: 0.2,
            confidence_sample: 3,
            confidence_scale: 0.75,
            min_confidence: 0.30,
            max_confidence: 0.85,
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// A candidate with its computed relevance.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedIncident {
    pub incident: HistoricalIncident,
    pub similarity: f64,
    pub recency_weight: f64,
    pub relevance: f64,
}

/// `max(0.5^(age / half_life), floor)`. Future timestamps count as age zero.
pub fn recency_weight(age: Duration, half_life: Duration, floor: f64) -> f64 {
    if half_life.is_zero() {
        return floor;
    }
    let halvings = age.as_secs_f64() / half_life.as_secs_f64();
    0.5f64.powf(halvings).max(floor)
}

/// Scores and sorts candidates: relevance descending, then newer first.
pub fn rank(
    candidates: Vec<(HistoricalIncident, f64)>,
    now: DateTime<Utc>,
    config: &HistoricalConfig,
) -> Vec<RankedIncident> {
    let mut ranked: Vec<RankedIncident> = candidates
        .into_iter()
        .map(|(incident, similarity)| {
            let similarity = similarity.clamp(0.0, 1.0);
            let age = (now - incident.timestamp).to_std().unwrap_or(Duration::ZERO);
            let recency = recency_weight(age, config.half_life, config.recency_floor);
            let relevance = config.similarity_weight * similarity
                + config.success_weight * incident.success_rate.clamp(0.0, 1.0)
                + config.recency_weight * recency;
            RankedIncident {
                incident,
                similarity,
                recency_weight: recency,
                relevance,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.incident.timestamp.cmp(&a.incident.timestamp))
    });
    ranked
}

/// Builds an investigation result from ranked candidates.
pub fn synthesize(
    fingerprint: &str,
    ranked: &[RankedIncident],
    config: &HistoricalConfig,
) -> InvestigationResult {
    let Some(top) = ranked.first() else {
        return InvestigationResult {
            root_cause: format!("{} for fingerprint {}", NO_HISTORICAL_DATA, fingerprint),
            analysis: format!(
                "Investigation backend unavailable and no past incident reached similarity {:.2}",
                config.min_similarity
            ),
            confidence: config.min_confidence,
            recommendations: Vec::new(),
            tools_used: vec![HISTORICAL_TOOL.to_string()],
            used_fallback: true,
        };
    };

    let agreeing = ranked
        .iter()
        .filter(|r| r.incident.root_cause == top.incident.root_cause)
        .count();
    let root_cause = if agreeing > 1 {
        format!(
            "{} (shared by {} of {} similar incidents)",
            top.incident.root_cause,
            agreeing,
            ranked.len()
        )
    } else {
        top.incident.root_cause.clone()
    };

    let mut seen = HashSet::new();
    let mut recommendations = Vec::new();
    for candidate in ranked {
        for action in &candidate.incident.remediation_actions {
            if seen.insert(action.action.clone()) {
                recommendations.push(Recommendation {
                    action: action.action.clone(),
                    parameters: action.parameters.clone(),
                    confidence: candidate.incident.success_rate.clamp(0.0, 1.0),
                    risk: action.risk,
                });
            }
        }
    }

    let sample: Vec<f64> = ranked
        .iter()
        .take(config.confidence_sample.max(1))
        .map(|r| r.relevance)
        .collect();
    let mean = sample.iter().sum::<f64>() / sample.len() as f64;
    let confidence =
        (config.confidence_scale * mean).clamp(config.min_confidence, config.max_confidence);

    InvestigationResult {
        root_cause,
        analysis: format!(
            "Synthesized from {} similar past incident(s); top match {} (similarity {:.2}, relevance {:.2})",
            ranked.len(),
            top.incident.id,
            top.similarity,
            top.relevance
        ),
        confidence,
        recommendations,
        tools_used: vec![HISTORICAL_TOOL.to_string()],
        used_fallback: true,
    }
}

/// Looks up comparable past incidents for a request.
pub struct HistoricalSimilarityService {
    store: Arc<dyn IncidentVectorStore>,
    embedder: Arc<dyn Embedder>,
    config: HistoricalConfig,
}

impl HistoricalSimilarityService {
    pub fn new(
        store: Arc<dyn IncidentVectorStore>,
        embedder: Arc<dyn Embedder>,
        config: HistoricalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &HistoricalConfig {
        &self.config
    }

    /// Returns a fallback investigation result. Never fails.
    #[instrument(skip(self, request), fields(fingerprint = %request.fingerprint))]
    pub async fn find_similar(
        &self,
        request: &AnalysisRequest,
        now: DateTime<Utc>,
    ) -> InvestigationResult {
        let candidates = self.query(&request.fingerprint).await;
        let ranked = rank(candidates, now, &self.config);
        debug!(candidates = ranked.len(), "Ranked historical candidates");
        synthesize(&request.fingerprint, &ranked, &self.config)
    }

    async fn query(&self, fingerprint: &str) -> Vec<(HistoricalIncident, f64)> {
        let embedding = match self.embedder.embed(fingerprint) {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Failed to embed fingerprint, treating as no candidates");
                return Vec::new();
            }
        };

        let lookup = self
            .store
            .similar(&embedding, self.config.top_k, self.config.min_similarity);
        let result: SimilarIncidents = match timeout(self.config.query_timeout, lookup).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = %e, "Vector store query failed, treating as no candidates");
                return Vec::new();
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.query_timeout.as_secs(),
                    "Vector store query timed out, treating as no candidates"
                );
                return Vec::new();
            }
        };

        if result.incidents.len() != result.similarity_scores.len() {
            warn!(
                incidents = result.incidents.len(),
                scores = result.similarity_scores.len(),
                "Vector store returned unpaired scores"
            );
        }

        let min = f64::from(self.config.min_similarity);
        let mut by_id: HashMap<String, (HistoricalIncident, f64)> = HashMap::new();
        for (incident, score) in result.into_pairs() {
            if score < min {
                continue;
            }
            match by_id.get(&incident.id) {
                Some((_, existing)) if *existing >= score => {}
                _ => {
                    by_id.insert(incident.id.clone(), (incident, score));
                }
            }
        }
        let mut candidates: Vec<_> = by_id.into_values().collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        candidates.truncate(self.config.top_k);
        candidates
    }
}
