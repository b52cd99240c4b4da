//! # ra-controller
//!
//! Decision orchestrator for Remediation Analyst.
//!
//! The [`DecisionOrchestrator`] reconciles analysis records phase by phase:
//! validation, context preparation, investigation (with historical
//! fallback), confidence scoring, policy evaluation, and operator approval.
//! The [`Controller`] runs the orchestrator on a pool of workers.

pub mod config;
pub mod controller;
pub mod decision;
pub mod error;
pub mod orchestrator;
pub mod phase;
pub mod workflow;

pub use config::{CallTimeouts, ConnectorsConfig, ControllerConfig, EnrichmentConfig};
pub use controller::{Controller, ERROR_REQUEUE_DELAY};
pub use decision::{decide, ApprovalPrecedence, Decision, DecisionConfig};
pub use error::OrchestratorError;
pub use orchestrator::{Collaborators, DecisionOrchestrator, Requeue, AUTO_APPROVER};
pub use phase::{can_transition, TRANSITIONS};
pub use workflow::{HandoffError, RecordingWorkflowSink, TracingWorkflowSink, WorkflowSink};
