//! Downstream workflow hand-off.
//!
//! Once a record reaches `Ready` the orchestrator passes its
//! [`RemediationHandoff`] to a [`WorkflowSink`]. Creating and running the
//! remediation itself happens on the other side of this seam.

use async_trait::async_trait;
use ra_core::RemediationHandoff;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::info;

/// Error returned by a workflow sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("workflow sink rejected hand-off: {0}")]
pub struct HandoffError(pub String);

/// Receiver of approved remediations.
#[async_trait]
pub trait WorkflowSink: Send + Sync {
    async fn hand_off(&self, handoff: &RemediationHandoff) -> Result<(), HandoffError>;
}

/// Sink that only logs the hand-off.
#[derive(Debug, Default)]
pub struct TracingWorkflowSink;

#[async_trait]
impl WorkflowSink for TracingWorkflowSink {
    async fn hand_off(&self, handoff: &RemediationHandoff) -> Result<(), HandoffError> {
        info!(
            record_id = %handoff.record_id,
            generation = handoff.generation,
            outcome = handoff.outcome.as_str(),
            decided_by = %handoff.approval.decided_by,
            recommendations = handoff.recommendations.len(),
            "Remediation handed off"
        );
        Ok(())
    }
}

/// Sink that keeps every hand-off in memory.
#[derive(Debug, Default)]
pub struct RecordingWorkflowSink {
    handoffs: Mutex<Vec<RemediationHandoff>>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingWorkflowSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent hand-offs fail.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    pub fn recover(&self) {
        *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn handoffs(&self) -> Vec<RemediationHandoff> {
        self.handoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.handoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WorkflowSink for RecordingWorkflowSink {
    async fn hand_off(&self, handoff: &RemediationHandoff) -> Result<(), HandoffError> {
        if let Some(message) = self
            .fail_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(HandoffError(message));
        }
        self.handoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handoff.clone());
        Ok(())
    }
}
