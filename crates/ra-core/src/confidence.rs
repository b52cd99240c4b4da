//! Confidence scoring.
//!
//! [`ConfidenceEngine::calculate`] is a pure function of its inputs: four
//! weighted components are combined into a score in `[0, 100]`, mapped to a
//! [`ConfidenceLevel`], and every intermediate value is kept in a
//! [`ConfidenceBreakdown`] for audit.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::analysis::InvestigationResult;

/// Confidence tier derived from a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    /// Maps a score using the default 80/60 thresholds.
    pub fn from_score(score: f64) -> Self {
        ConfidenceConfig::default().level_for(score)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables for the confidence engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub investigation_weight: f64,
    pub recommendation_weight: f64,
    pub historical_weight: f64,
    pub context_weight: f64,
    /// Multiplier applied to the investigation component under fallback.
    pub fallback_penalty: f64,
    /// Multiplier applied for each empty root cause / analysis text.
    pub empty_text_penalty: f64,
    /// Bonus when at least `bonus_min_recommendations` are present.
    pub recommendation_bonus: f64,
    pub bonus_min_recommendations: usize,
    /// Penalty per recommendation below `weak_recommendation_threshold`.
    pub weak_recommendation_penalty: f64,
    pub weak_recommendation_threshold: f64,
    /// Component value used when an input is absent.
    pub neutral_score: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            investigation_weight: 0.40,
            recommendation_weight: 0.30,
            historical_weight: 0.20,
            context_weight: 0.10,
            fallback_penalty: 0.7,
            empty_text_penalty: 0.85,
            recommendation_bonus: 5.0,
            bonus_min_recommendations: 3,
            weak_recommendation_penalty: 3.0,
            weak_recommendation_threshold: 0.5,
            neutral_score: 50.0,
            high_threshold: 80.0,
            medium_threshold: 60.0,
        }
    }
}

impl ConfidenceConfig {
    /// Maps a score to its tier.
    pub fn level_for(&self, score: f64) -> ConfidenceLevel {
        if score >= self.high_threshold {
            ConfidenceLevel::High
        } else if score >= self.medium_threshold {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Raw and weighted value of one component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    /// Component value in [0, 100].
    pub raw: f64,
    pub weight: f64,
    /// `raw * weight`.
    pub weighted: f64,
}

impl ComponentScore {
    fn new(raw: f64, weight: f64) -> Self {
        let raw = raw.clamp(0.0, 100.0);
        Self {
            raw,
            weight,
            weighted: raw * weight,
        }
    }
}

/// Per-component explanation of a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub investigation: ComponentScore,
    pub recommendations: ComponentScore,
    pub historical: ComponentScore,
    pub context: ComponentScore,
    /// Adjustments applied along the way.
    pub notes: Vec<String>,
}

/// Result of a confidence calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    /// Score in [0, 100].
    pub score: f64,
    pub level: ConfidenceLevel,
    pub breakdown: ConfidenceBreakdown,
}

/// Computes confidence scores.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceEngine {
    config: ConfidenceConfig,
}

impl ConfidenceEngine {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Scores an investigation.
    ///
    /// `context_quality` and `historical_rate` are fractions in `[0, 1]`;
    /// `None` (or NaN) yields the neutral component value.
    pub fn calculate(
        &self,
        investigation: &InvestigationResult,
        used_fallback: bool,
        context_quality: Option<f64>,
        historical_rate: Option<f64>,
    ) -> ConfidenceAssessment {
        let mut notes = Vec::new();
        let cfg = &self.config;

        let investigation_raw = self.investigation_component(investigation, used_fallback, &mut notes);
        let recommendation_raw = self.recommendation_component(investigation, &mut notes);
        let historical_raw = self.fraction_component(historical_rate, "historical success rate", &mut notes);
        let context_raw = self.fraction_component(context_quality, "context quality", &mut notes);

        let breakdown = ConfidenceBreakdown {
            investigation: ComponentScore::new(investigation_raw, cfg.investigation_weight),
            recommendations: ComponentScore::new(recommendation_raw, cfg.recommendation_weight),
            historical: ComponentScore::new(historical_raw, cfg.historical_weight),
            context: ComponentScore::new(context_raw, cfg.context_weight),
            notes,
        };

        let score = (breakdown.investigation.weighted
            + breakdown.recommendations.weighted
            + breakdown.historical.weighted
            + breakdown.context.weighted)
            .clamp(0.0, 100.0);

        ConfidenceAssessment {
            score,
            level: cfg.level_for(score),
            breakdown,
        }
    }

    fn investigation_component(
        &self,
        investigation: &InvestigationResult,
        used_fallback: bool,
        notes: &mut Vec<String>,
    ) -> f64 {
        let mut value = sanitize_fraction(investigation.confidence).unwrap_or(0.0) * 100.0;

        if used_fallback {
            value *= self.config.fallback_penalty;
            notes.push(format!(
                "fallback penalty x{} applied to investigation confidence",
                self.config.fallback_penalty
            ));
        }
        if investigation.root_cause.trim().is_empty() {
            value *= self.config.empty_text_penalty;
            notes.push("empty root cause penalized".to_string());
        }
        if investigation.analysis.trim().is_empty() {
            value *= self.config.empty_text_penalty;
            notes.push("empty analysis penalized".to_string());
        }

        value.clamp(0.0, 100.0)
    }

    fn recommendation_component(
        &self,
        investigation: &InvestigationResult,
        notes: &mut Vec<String>,
    ) -> f64 {
        let recommendations = &investigation.recommendations;
        if recommendations.is_empty() {
            notes.push("no recommendations".to_string());
            return 0.0;
        }

        let confidences: Vec<f64> = recommendations
            .iter()
            .map(|r| sanitize_fraction(r.confidence).unwrap_or(0.0))
            .collect();
        let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
        let mut value = mean * 100.0;

        if recommendations.len() >= self.config.bonus_min_recommendations {
            value += self.config.recommendation_bonus;
            notes.push(format!(
                "+{} for {} recommendations",
                self.config.recommendation_bonus,
                recommendations.len()
            ));
        }

        let weak = confidences
            .iter()
            .filter(|c| **c < self.config.weak_recommendation_threshold)
            .count();
        if weak > 0 {
            value -= self.config.weak_recommendation_penalty * weak as f64;
            notes.push(format!(
                "-{} for {} recommendation(s) below {}",
                self.config.weak_recommendation_penalty * weak as f64,
                weak,
                self.config.weak_recommendation_threshold
            ));
        }

        value.clamp(0.0, 100.0)
    }

    fn fraction_component(&self, input: Option<f64>, label: &str, notes: &mut Vec<String>) -> f64 {
        match input.and_then(sanitize_fraction) {
            Some(fraction) => fraction * 100.0,
            None => {
                notes.push(format!("{} unavailable, neutral {} used", label, self.config.neutral_score));
                self.config.neutral_score
            }
        }
    }
}

fn sanitize_fraction(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value.clamp(0.0, 1.0))
    }
}
