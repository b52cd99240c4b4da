//! Decision logic.
//!
//! A pure function from the confidence assessment, the investigation and
//! the policy decision to the next step for a record.

use ra_core::historical::NO_HISTORICAL_DATA;
use ra_core::{
    ConfidenceAssessment, ConfidenceLevel, InvestigationResult, PolicyDecision, RejectionKind,
    RejectionReason,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which side wins when confidence would auto-approve but a policy rule
/// demands review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPrecedence {
    /// A policy review requirement always routes to a human.
    #[default]
    PolicyFirst,
    /// High confidence auto-approves even when a rule asks for review.
    ConfidenceFirst,
}

/// Decision thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum score for auto-approval.
    pub auto_approve_threshold: f64,
    /// Minimum score for routing to a human instead of rejecting.
    pub manual_review_threshold: f64,
    /// Per-environment auto-approval overrides, e.g. `production: 95`.
    pub environment_thresholds: HashMap<String, f64>,
    pub precedence: ApprovalPrecedence,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 80.0,
            manual_review_threshold: 60.0,
            environment_thresholds: HashMap::new(),
            precedence: ApprovalPrecedence::default(),
        }
    }
}

impl DecisionConfig {
    /// Auto-approval threshold for `environment`.
    pub fn auto_approve_threshold_for(&self, environment: &str) -> f64 {
        self.environment_thresholds
            .get(environment)
            .copied()
            .unwrap_or(self.auto_approve_threshold)
    }
}

/// What the orchestrator should do with a record after policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    AutoApprove,
    /// Route to an operator; the reasons end up in the approval summary.
    RequireApproval { reasons: Vec<String> },
    Reject(RejectionReason),
}

/// Decides the outcome of a record.
pub fn decide(
    assessment: &ConfidenceAssessment,
    investigation: &InvestigationResult,
    policy: &PolicyDecision,
    config: &DecisionConfig,
    environment: &str,
) -> Decision {
    if !policy.allow {
        return Decision::Reject(RejectionReason::new(
            RejectionKind::PolicyDenied,
            format!("denied by policy: {}", policy.violation_summary()),
        ));
    }

    let score = assessment.score;
    let threshold = config.auto_approve_threshold_for(environment);

    if assessment.level == ConfidenceLevel::High && score >= threshold {
        if policy.requires_approval && config.precedence == ApprovalPrecedence::PolicyFirst {
            return Decision::RequireApproval {
                reasons: policy_review_reasons(policy),
            };
        }
        return Decision::AutoApprove;
    }

    if score >= config.manual_review_threshold {
        let mut reasons = vec![format!(
            "confidence {:.1} below auto-approve threshold {:.1} for environment '{}'",
            score, threshold, environment
        )];
        if policy.requires_approval {
            reasons.extend(policy_review_reasons(policy));
        }
        return Decision::RequireApproval { reasons };
    }

    if investigation.used_fallback && investigation.root_cause.starts_with(NO_HISTORICAL_DATA) {
        return Decision::Reject(RejectionReason::new(
            RejectionKind::InvestigationUnavailable,
            format!(
                "investigation unavailable and no historical data for fingerprint (confidence {:.1})",
                score
            ),
        ));
    }

    Decision::Reject(RejectionReason::new(
        RejectionKind::LowConfidence,
        format!(
            "confidence {:.1} below manual-review threshold {:.1}",
            score, config.manual_review_threshold
        ),
    ))
}

fn policy_review_reasons(policy: &PolicyDecision) -> Vec<String> {
    if policy.matched_rules.is_empty() {
        vec!["policy requires review".to_string()]
    } else {
        vec![format!(
            "policy requires review: {}",
            policy.matched_rules.join(", ")
        )]
    }
}
