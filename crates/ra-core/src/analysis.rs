//! Analysis data models for Remediation Analyst.
//!
//! This module defines the request that starts a decision, the durable record
//! the orchestrator reconciles, and the values components hand back to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::confidence::{ConfidenceAssessment, ConfidenceLevel};

/// Reference to the resource a remediation would act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    /// Resource kind (e.g. `Deployment`).
    pub kind: String,
    /// Namespace of the resource.
    pub namespace: String,
    /// Resource name.
    pub name: String,
}

impl TargetRef {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Metadata of the alert that triggered the analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertMetadata {
    /// Alert name.
    pub name: String,
    /// Alert severity.
    #[serde(default)]
    pub severity: Severity,
    /// Environment the alert fired in (e.g. `production`).
    #[serde(default)]
    pub environment: String,
    /// Alert labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Free-form annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Input to the decision engine. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Stable identifier of the alert signature.
    pub fingerprint: String,
    /// Alert metadata.
    pub alert: AlertMetadata,
    /// Resource the remediation would act on.
    pub target: Option<TargetRef>,
}

/// Reasons a request is rejected before any investigation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("request fingerprint is missing")]
    MissingFingerprint,

    #[error("target resource reference is missing")]
    MissingTarget,

    #[error("target resource reference is incomplete: {0} is empty")]
    IncompleteTarget(&'static str),
}

impl AnalysisRequest {
    pub fn new(fingerprint: impl Into<String>, alert: AlertMetadata, target: TargetRef) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            alert,
            target: Some(target),
        }
    }

    /// Checks that the mandatory fields are present.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.fingerprint.trim().is_empty() {
            return Err(ValidationError::MissingFingerprint);
        }
        let target = self.target.as_ref().ok_or(ValidationError::MissingTarget)?;
        if target.kind.trim().is_empty() {
            return Err(ValidationError::IncompleteTarget("kind"));
        }
        if target.name.trim().is_empty() {
            return Err(ValidationError::IncompleteTarget("name"));
        }
        Ok(())
    }

    /// Namespace of the target, or an empty string.
    pub fn namespace(&self) -> &str {
        self.target
            .as_ref()
            .map(|t| t.namespace.as_str())
            .unwrap_or("")
    }
}

/// Phases of an analysis record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Validating,
    PreparingContext,
    Investigating,
    EvaluatingConfidence,
    EvaluatingPolicy,
    Approving,
    Ready,
    Rejected,
    Failed,
}

impl Phase {
    /// Whether no further transition is possible without a restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Ready | Phase::Rejected | Phase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Validating => "validating",
            Phase::PreparingContext => "preparing_context",
            Phase::Investigating => "investigating",
            Phase::EvaluatingConfidence => "evaluating_confidence",
            Phase::EvaluatingPolicy => "evaluating_policy",
            Phase::Approving => "approving",
            Phase::Ready => "ready",
            Phase::Rejected => "rejected",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the phase history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    pub generation: u64,
}

/// Bookkeeping for calls to the investigation backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvestigationAttempts {
    /// Number of backend calls made so far.
    pub attempts: u32,
    /// When the first call was made.
    pub first_attempt_at: Option<DateTime<Utc>>,
    /// When the next call may be made.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last error observed.
    pub last_error: Option<String>,
}

/// Risk of applying a recommended action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A remediation action suggested by an investigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Action identifier (e.g. `restart_pod`).
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Confidence in this action, in [0, 1].
    pub confidence: f64,
    /// Risk descriptor.
    #[serde(default)]
    pub risk: RiskLevel,
}

impl Recommendation {
    pub fn new(action: impl Into<String>, confidence: f64) -> Self {
        Self {
            action: action.into(),
            parameters: HashMap::new(),
            confidence,
            risk: RiskLevel::default(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }
}

/// Outcome of investigating an alert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvestigationResult {
    /// Root cause summary.
    #[serde(default)]
    pub root_cause: String,
    /// Detailed analysis.
    #[serde(default)]
    pub analysis: String,
    /// Confidence of the investigation, in [0, 1].
    pub confidence: f64,
    /// Recommended remediation actions.
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    /// Tools used to reach the conclusion.
    #[serde(default)]
    pub tools_used: Vec<String>,
    /// Whether this result was synthesized from historical data.
    #[serde(default)]
    pub used_fallback: bool,
}

/// An action taken during a past incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub risk: RiskLevel,
}

impl RemediationAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            parameters: HashMap::new(),
            risk: RiskLevel::default(),
        }
    }
}

/// A resolved past incident. Read-only reference data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalIncident {
    pub id: String,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub root_cause: String,
    #[serde(default)]
    pub remediation_actions: Vec<RemediationAction>,
    /// Fraction of past applications that resolved the incident, in [0, 1].
    pub success_rate: f64,
}

/// Context gathered before investigation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichedContext {
    /// Incidents the enrichment service considers similar.
    #[serde(default)]
    pub similar_incidents: Vec<HistoricalIncident>,
    /// Recurring patterns observed for the fingerprint.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Quality of the gathered context, in [0, 1]. `None` when unavailable.
    pub quality_score: Option<f64>,
    /// Set when enrichment failed and the context is a neutral placeholder.
    #[serde(default)]
    pub degraded: bool,
    /// Why the context is degraded.
    pub note: Option<String>,
}

impl EnrichedContext {
    /// Placeholder used when the enrichment service is unavailable.
    pub fn degraded(note: impl Into<String>) -> Self {
        Self {
            degraded: true,
            note: Some(note.into()),
            ..Default::default()
        }
    }

    /// Mean success rate of the similar incidents, if any were found.
    pub fn historical_success_rate(&self) -> Option<f64> {
        if self.similar_incidents.is_empty() {
            return None;
        }
        let total: f64 = self
            .similar_incidents
            .iter()
            .map(|i| i.success_rate.clamp(0.0, 1.0))
            .sum();
        Some(total / self.similar_incidents.len() as f64)
    }
}

/// Whether a policy decision came from evaluated rules or a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyBasis {
    /// Rules were evaluated.
    Evaluated,
    /// No policy set was configured.
    NoPolicy,
    /// The evaluator failed and the decision defaulted to allow.
    FailOpen,
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Whether the decision may proceed.
    pub allow: bool,
    /// Reasons produced by matching deny rules.
    pub violations: Vec<String>,
    /// Set when the policy outcome overrides the confidence-based outcome.
    pub overrides_confidence: bool,
    /// Set when a rule demands human review.
    pub requires_approval: bool,
    /// How the decision was reached.
    pub basis: PolicyBasis,
    /// Names of the rules that matched.
    #[serde(default)]
    pub matched_rules: Vec<String>,
}

impl PolicyDecision {
    /// Allow decision used when no policy set is configured.
    pub fn no_policy() -> Self {
        Self {
            allow: true,
            violations: Vec::new(),
            overrides_confidence: false,
            requires_approval: false,
            basis: PolicyBasis::NoPolicy,
            matched_rules: Vec::new(),
        }
    }

    /// Allow decision used when the evaluator failed.
    pub fn fail_open() -> Self {
        Self {
            basis: PolicyBasis::FailOpen,
            ..Self::no_policy()
        }
    }

    /// Joined violation reasons.
    pub fn violation_summary(&self) -> String {
        self.violations.join("; ")
    }
}

/// Final outcome of an analysis record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    AutoApproved,
    PendingApproval,
    Approved,
    Rejected,
    Failed,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::AutoApproved => "auto_approved",
            DecisionOutcome::PendingApproval => "pending_approval",
            DecisionOutcome::Approved => "approved",
            DecisionOutcome::Rejected => "rejected",
            DecisionOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    PolicyDenied,
    LowConfidence,
    InvestigationUnavailable,
    OperatorRejected,
    ApprovalTimedOut,
}

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionReason {
    pub kind: RejectionKind,
    pub message: String,
}

impl RejectionReason {
    pub fn new(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Link from a record to its approval record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRef {
    pub approval_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

/// Who approved a handed-off remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalProvenance {
    /// `None` for auto-approved decisions.
    pub approval_id: Option<Uuid>,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
    pub message: Option<String>,
}

/// Payload handed to the downstream workflow system once a record is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationHandoff {
    pub record_id: Uuid,
    pub generation: u64,
    pub fingerprint: String,
    pub target: Option<TargetRef>,
    pub recommendations: Vec<Recommendation>,
    pub confidence_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub outcome: DecisionOutcome,
    pub approval: ApprovalProvenance,
    pub produced_at: DateTime<Utc>,
}

/// The durable state-machine instance for one analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Optimistic-concurrency version, bumped by the store on every write.
    pub version: u64,
    /// Restart generation, starting at 1.
    pub generation: u64,
    /// The accepted request.
    pub request: AnalysisRequest,
    /// Current phase.
    pub phase: Phase,
    /// Every phase entered, in order.
    pub phase_history: Vec<PhaseEntry>,
    /// Investigation backend bookkeeping.
    pub investigation_attempts: InvestigationAttempts,
    /// Context gathered before investigation.
    pub context: Option<EnrichedContext>,
    /// Investigation outcome.
    pub investigation: Option<InvestigationResult>,
    /// Confidence assessment.
    pub confidence: Option<ConfidenceAssessment>,
    /// Policy decision.
    pub policy: Option<PolicyDecision>,
    /// Approval record reference.
    pub approval_ref: Option<ApprovalRef>,
    /// Decision outcome once policy has been evaluated.
    pub outcome: Option<DecisionOutcome>,
    /// Rejection reason when rejected.
    pub rejection: Option<RejectionReason>,
    /// Human-readable terminal message.
    pub message: Option<String>,
    /// Payload produced for the downstream workflow.
    pub handoff: Option<RemediationHandoff>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// Creates a pending record for `request`.
    pub fn new(request: AnalysisRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 0,
            generation: 1,
            request,
            phase: Phase::Pending,
            phase_history: vec![PhaseEntry {
                phase: Phase::Pending,
                entered_at: now,
                generation: 1,
            }],
            investigation_attempts: InvestigationAttempts::default(),
            context: None,
            investigation: None,
            confidence: None,
            policy: None,
            approval_ref: None,
            outcome: None,
            rejection: None,
            message: None,
            handoff: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// When the current phase was entered.
    pub fn phase_entered_at(&self) -> Option<DateTime<Utc>> {
        self.phase_history.last().map(|entry| entry.entered_at)
    }

    /// Clears all derived state and returns to `Pending` under a new generation.
    pub fn reset_for_restart(&mut self, now: DateTime<Utc>) {
        self.generation += 1;
        self.phase = Phase::Pending;
        self.phase_history.push(PhaseEntry {
            phase: Phase::Pending,
            entered_at: now,
            generation: self.generation,
        });
        self.investigation_attempts = InvestigationAttempts::default();
        self.context = None;
        self.investigation = None;
        self.confidence = None;
        self.policy = None;
        self.approval_ref = None;
        self.outcome = None;
        self.rejection = None;
        self.message = None;
        self.handoff = None;
        self.updated_at = now;
    }
}
