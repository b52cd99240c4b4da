//! # ra-core
//!
//! Core data models and scoring for Remediation Analyst.
//!
//! This crate provides the analysis record model, the confidence engine, the
//! historical similarity service, and the storage seams the decision
//! orchestrator persists through.

pub mod analysis;
pub mod approval;
pub mod clock;
pub mod confidence;
pub mod historical;
pub mod store;
pub mod vector;

pub use analysis::{
    AlertMetadata, AnalysisRecord, AnalysisRequest, ApprovalProvenance, ApprovalRef,
    DecisionOutcome, EnrichedContext, HistoricalIncident, InvestigationAttempts,
    InvestigationResult, Phase, PhaseEntry, PolicyBasis, PolicyDecision, Recommendation,
    RejectionKind, RejectionReason, RemediationAction, RemediationHandoff, RiskLevel, Severity,
    TargetRef, ValidationError,
};
pub use approval::{
    ApprovalDecision, ApprovalRecord, ApprovalStore, InMemoryApprovalStore, InvestigationSummary,
    DEFAULT_APPROVAL_TIMEOUT,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use confidence::{
    ComponentScore, ConfidenceAssessment, ConfidenceBreakdown, ConfidenceConfig, ConfidenceEngine,
    ConfidenceLevel,
};
pub use historical::{HistoricalConfig, HistoricalSimilarityService, RankedIncident};
pub use store::{InMemoryRecordStore, RecordStore, StoreError, StoreResult};
