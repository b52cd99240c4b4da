//! Orchestrator errors.

use ra_core::{Phase, StoreError};
use ra_policy::ApprovalError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::HandoffError;

/// Errors that can occur while reconciling a record.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Analysis record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Record {0} did not settle within the tick limit")]
    TickLimit(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Record {0} has no hand-off to send")]
    NoHandoff(Uuid),

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

impl OrchestratorError {
    /// A stale write; the record must be re-read and the tick retried.
    pub fn is_conflict(&self) -> bool {
        match self {
            OrchestratorError::Store(e) => e.is_conflict(),
            OrchestratorError::Approval(ApprovalError::Store(e)) => e.is_conflict(),
            _ => false,
        }
    }

    /// The record was deleted underneath the caller.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OrchestratorError::RecordNotFound(_)
                | OrchestratorError::Store(StoreError::NotFound(_))
        )
    }
}
