//! Policy evaluation engine.
//!
//! The engine evaluates a computed decision against declarative rules. Deny
//! rules are authoritative over confidence; a missing or failing evaluator
//! never blocks a decision, but the way it was allowed is recorded.

use crate::rules::{PolicyRule, RuleEffect};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ra_core::{AnalysisRecord, ConfidenceAssessment, ConfidenceLevel, PolicyBasis, PolicyDecision};
use ra_observability::metrics::POLICY_FAIL_OPEN_TOTAL;
use ra_observability::{AuditEventType, AuditLog, AuditResult, MetricsSink};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur in policy evaluation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Invalid regex pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Policy evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Policy backend error: {0}")]
    Backend(String),
}

/// Everything a policy may look at when judging a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionInput {
    /// Confidence score in [0, 100].
    pub score: f64,
    pub level: ConfidenceLevel,
    /// Action identifiers of the recommended remediations.
    pub action_types: Vec<String>,
    pub environment: String,
    pub namespace: Option<String>,
    /// Evaluation time, used by time-window conditions.
    pub timestamp: DateTime<Utc>,
    /// Alert labels.
    pub labels: HashMap<String, String>,
}

impl DecisionInput {
    /// Builds the input from a record and its confidence assessment.
    pub fn from_record(
        record: &AnalysisRecord,
        assessment: &ConfidenceAssessment,
        now: DateTime<Utc>,
    ) -> Self {
        let action_types = record
            .investigation
            .as_ref()
            .map(|inv| {
                inv.recommendations
                    .iter()
                    .map(|r| r.action.clone())
                    .collect()
            })
            .unwrap_or_default();
        let namespace = Some(record.request.namespace())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string);

        Self {
            score: assessment.score,
            level: assessment.level,
            action_types,
            environment: record.request.alert.environment.clone(),
            namespace,
            timestamp: now,
            labels: record.request.alert.labels.clone(),
        }
    }
}

/// Pluggable policy backend.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, input: &DecisionInput) -> Result<PolicyDecision, PolicyError>;
}

/// Rule-based evaluator over declarative conditions.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    /// Rules, kept sorted by priority.
    rules: Vec<PolicyRule>,
}

impl RuleEngine {
    /// Creates an engine from rules, ordering them by priority.
    pub fn new(mut rules: Vec<PolicyRule>) -> Self {
        rules.sort_by_key(|r| r.priority);
        Self { rules }
    }

    /// Gets the current rules.
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Evaluates every enabled rule. All matching deny rules contribute a
    /// violation; any violation disallows the decision.
    pub fn evaluate_rules(&self, input: &DecisionInput) -> Result<PolicyDecision, PolicyError> {
        let mut violations = Vec::new();
        let mut matched_rules = Vec::new();
        let mut requires_approval = false;

        for rule in &self.rules {
            if !rule.matches(input)? {
                continue;
            }
            debug!(rule = %rule.name, "Rule matched");
            matched_rules.push(rule.name.clone());
            match &rule.effect {
                RuleEffect::Allow => {}
                RuleEffect::Deny(reason) => violations.push(format!("{}: {}", rule.name, reason)),
                RuleEffect::RequireApproval => requires_approval = true,
            }
        }

        let allow = violations.is_empty();
        Ok(PolicyDecision {
            allow,
            violations,
            overrides_confidence: !allow || requires_approval,
            requires_approval,
            basis: PolicyBasis::Evaluated,
            matched_rules,
        })
    }
}

#[async_trait]
impl PolicyEvaluator for RuleEngine {
    async fn evaluate(&self, input: &DecisionInput) -> Result<PolicyDecision, PolicyError> {
        self.evaluate_rules(input)
    }
}

const ACTOR: &str = "policy";

/// Wraps an optional evaluator with a timeout and fail-open handling.
#[derive(Clone)]
pub struct PolicyGate {
    evaluator: Option<Arc<dyn PolicyEvaluator>>,
    timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    audit: AuditLog,
}

impl PolicyGate {
    pub fn new(
        evaluator: Option<Arc<dyn PolicyEvaluator>>,
        timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
        audit: AuditLog,
    ) -> Self {
        Self {
            evaluator,
            timeout,
            metrics,
            audit,
        }
    }

    /// Whether a policy set is configured.
    pub fn is_configured(&self) -> bool {
        self.evaluator.is_some()
    }

    /// Evaluates `input` for `record_id`. Never fails: a missing policy
    /// yields basis `NoPolicy`, an evaluator error or timeout yields basis
    /// `FailOpen`.
    #[instrument(skip(self, input), fields(record_id = %record_id, score = input.score))]
    pub async fn evaluate(&self, record_id: Uuid, input: &DecisionInput) -> PolicyDecision {
        let Some(evaluator) = &self.evaluator else {
            info!("No policy set configured, allowing");
            self.audit
                .log_record_event(
                    AuditEventType::PolicyNotConfigured,
                    ACTOR,
                    record_id,
                    "No policy set configured; decision allowed",
                    serde_json::json!({}),
                    AuditResult::Success,
                )
                .await;
            return PolicyDecision::no_policy();
        };

        let result = match tokio::time::timeout(self.timeout, evaluator.evaluate(input)).await {
            Ok(result) => result,
            Err(_) => Err(PolicyError::Timeout(self.timeout)),
        };

        match result {
            Ok(decision) => {
                self.audit_decision(record_id, &decision).await;
                decision
            }
            Err(e) => {
                warn!(error = %e, "Policy evaluation failed, failing open");
                self.metrics.increment_counter(
                    POLICY_FAIL_OPEN_TOTAL,
                    &[("reason", fail_open_reason(&e).to_string())],
                    1,
                );
                self.audit
                    .log_record_event(
                        AuditEventType::PolicyFailOpen,
                        ACTOR,
                        record_id,
                        "Policy evaluator failed; decision allowed",
                        serde_json::json!({ "error": e.to_string() }),
                        AuditResult::Degraded(e.to_string()),
                    )
                    .await;
                PolicyDecision::fail_open()
            }
        }
    }

    async fn audit_decision(&self, record_id: Uuid, decision: &PolicyDecision) {
        let details = serde_json::json!({
            "matched_rules": decision.matched_rules,
            "violations": decision.violations,
            "requires_approval": decision.requires_approval,
        });
        if decision.allow {
            self.audit
                .log_record_event(
                    AuditEventType::PolicyEvaluated,
                    ACTOR,
                    record_id,
                    "Policy allowed decision",
                    details,
                    AuditResult::Success,
                )
                .await;
        } else {
            info!(violations = %decision.violation_summary(), "Policy denied decision");
            self.audit
                .log_record_event(
                    AuditEventType::PolicyDenied,
                    ACTOR,
                    record_id,
                    "Policy denied decision",
                    details,
                    AuditResult::Denied(decision.violation_summary()),
                )
                .await;
        }
    }
}

fn fail_open_reason(error: &PolicyError) -> &'static str {
    match error {
        PolicyError::InvalidPattern { .. } => "invalid_pattern",
        PolicyError::Timeout(_) => "timeout",
        PolicyError::Backend(_) => "backend",
    }
}
