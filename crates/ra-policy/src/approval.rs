//! Approval coordination.
//!
//! An analysis record that needs human review owns exactly one child
//! [`ApprovalRecord`]. The coordinator creates it idempotently, polls it for
//! an operator decision and enforces the decision deadline. It never writes
//! the parent record; the orchestrator applies the poll result.

use chrono::{DateTime, Utc};
use ra_core::approval::DEFAULT_APPROVAL_TIMEOUT;
use ra_core::clock::duration_secs;
use ra_core::{
    AnalysisRecord, ApprovalDecision, ApprovalRecord, ApprovalStore, InvestigationSummary,
    StoreError,
};
use ra_observability::metrics::APPROVAL_OUTCOMES_TOTAL;
use ra_observability::{AuditEventType, AuditLog, AuditResult, MetricsSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur in approval workflows.
#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("Approval request not found for record {0}")]
    NotFound(Uuid),

    #[error("Record {0} has no investigation or confidence assessment to summarize")]
    MissingAssessment(Uuid),

    #[error("Approval store call timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Approval timing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Time an operator has to decide.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Upper bound on the re-poll interval.
    #[serde(with = "duration_secs")]
    pub poll_interval_cap: Duration,
    /// Bound on every approval store call.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_APPROVAL_TIMEOUT,
            poll_interval_cap: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of polling an approval.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalPoll {
    /// No decision yet; poll again after the given delay.
    Pending { requeue_after: Duration },
    Approved(ApprovalRecord),
    Rejected(ApprovalRecord),
    TimedOut(ApprovalRecord),
}

const ACTOR: &str = "approval-coordinator";

/// Creates and monitors approval records.
pub struct ApprovalCoordinator {
    store: Arc<dyn ApprovalStore>,
    config: ApprovalConfig,
    metrics: Arc<dyn MetricsSink>,
    audit: AuditLog,
}

impl ApprovalCoordinator {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        config: ApprovalConfig,
        metrics: Arc<dyn MetricsSink>,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            audit,
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// Returns the record's approval, creating it if absent.
    ///
    /// Safe to call on every tick: lookup by parent id comes first, and the
    /// store's create is itself idempotent. An approval left over from an
    /// earlier generation is replaced.
    #[instrument(skip(self, record, review_reasons), fields(record_id = %record.id))]
    pub async fn ensure_approval_requested(
        &self,
        record: &AnalysisRecord,
        review_reasons: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        if let Some(existing) = self.bounded(self.store.find_by_parent(record.id)).await? {
            if existing.parent_generation == record.generation {
                debug!(approval_id = %existing.id, "Approval already requested");
                return Ok(existing);
            }
            warn!(
                stale_generation = existing.parent_generation,
                "Replacing approval from an earlier generation"
            );
            self.bounded(self.store.delete_by_parent(record.id)).await?;
        }

        let summary = summarize(record, review_reasons)?;
        let approval = ApprovalRecord::new(
            record.id,
            record.generation,
            summary,
            now,
            self.config.timeout,
        );
        let stored = self.bounded(self.store.create_if_absent(approval)).await?;

        info!(approval_id = %stored.id, timeout_secs = stored.timeout.as_secs(), "Approval requested");
        self.audit
            .log_record_event(
                AuditEventType::ApprovalRequested,
                ACTOR,
                record.id,
                "Operator approval requested",
                serde_json::json!({
                    "approval_id": stored.id,
                    "confidence_score": stored.summary.confidence_score,
                    "review_reasons": stored.summary.review_reasons,
                    "deadline": stored.deadline(),
                }),
                AuditResult::Pending,
            )
            .await;

        Ok(stored)
    }

    /// Reads the approval owned by `parent_id` and reports its state.
    ///
    /// The deadline is checked on every poll: an undecided approval at or
    /// past `requested_at + timeout` is marked timed out.
    #[instrument(skip(self), fields(record_id = %parent_id))]
    pub async fn poll_decision(
        &self,
        parent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ApprovalPoll, ApprovalError> {
        let approval = self
            .bounded(self.store.find_by_parent(parent_id))
            .await?
            .ok_or(ApprovalError::NotFound(parent_id))?;

        let poll = match approval.decision {
            Some(ApprovalDecision::Approved) => ApprovalPoll::Approved(approval),
            Some(ApprovalDecision::Rejected) => ApprovalPoll::Rejected(approval),
            Some(ApprovalDecision::TimedOut) => ApprovalPoll::TimedOut(approval),
            None if approval.is_past_deadline(now) => {
                let timed_out = self
                    .bounded(self.store.mark_timed_out(parent_id, now))
                    .await?;
                // A decision may have landed between the read and the write.
                match timed_out.decision {
                    Some(ApprovalDecision::Approved) => ApprovalPoll::Approved(timed_out),
                    Some(ApprovalDecision::Rejected) => ApprovalPoll::Rejected(timed_out),
                    _ => {
                        warn!("Approval deadline passed without a decision");
                        self.audit
                            .log_record_event(
                                AuditEventType::ApprovalTimedOut,
                                ACTOR,
                                parent_id,
                                "Approval timed out",
                                serde_json::json!({ "deadline": timed_out.deadline() }),
                                AuditResult::Failure("timed out".to_string()),
                            )
                            .await;
                        ApprovalPoll::TimedOut(timed_out)
                    }
                }
            }
            None => {
                let requeue_after = approval.remaining(now).min(self.config.poll_interval_cap);
                return Ok(ApprovalPoll::Pending { requeue_after });
            }
        };

        let outcome = match &poll {
            ApprovalPoll::Approved(_) => "approved",
            ApprovalPoll::Rejected(_) => "rejected",
            ApprovalPoll::TimedOut(_) => "timed_out",
            ApprovalPoll::Pending { .. } => "pending",
        };
        self.metrics
            .increment_counter(APPROVAL_OUTCOMES_TOTAL, &[("outcome", outcome.to_string())], 1);
        Ok(poll)
    }

    /// Records an operator decision. Only decision fields are written.
    #[instrument(skip(self, message), fields(record_id = %parent_id))]
    pub async fn record_decision(
        &self,
        parent_id: Uuid,
        decision: ApprovalDecision,
        decided_by: &str,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let approval = match self
            .bounded(
                self.store
                    .record_decision(parent_id, decision, decided_by, message, now),
            )
            .await
        {
            Ok(approval) => approval,
            Err(ApprovalError::Store(StoreError::DeadlinePassed(id))) => {
                warn!(decision = %decision, decided_by, "Decision arrived after the approval deadline");
                self.audit
                    .log_record_event(
                        AuditEventType::ApprovalTimedOut,
                        decided_by,
                        parent_id,
                        "Late decision refused, approval timed out",
                        serde_json::json!({ "decision": decision, "decided_at": now }),
                        AuditResult::Failure("timed out".to_string()),
                    )
                    .await;
                return Err(StoreError::DeadlinePassed(id).into());
            }
            Err(e) => return Err(e),
        };

        info!(decision = %decision, decided_by, "Approval decided");
        let result = match decision {
            ApprovalDecision::Approved => AuditResult::Success,
            _ => AuditResult::Denied(approval.message.clone().unwrap_or_default()),
        };
        self.audit
            .log_record_event(
                AuditEventType::ApprovalDecided,
                decided_by,
                parent_id,
                &format!("Approval {}", decision),
                serde_json::json!({ "approval_id": approval.id, "message": approval.message }),
                result,
            )
            .await;
        Ok(approval)
    }

    /// Deletes the approval owned by `parent_id`, if any.
    pub async fn cancel(&self, parent_id: Uuid) -> Result<bool, ApprovalError> {
        self.bounded(self.store.delete_by_parent(parent_id)).await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, ApprovalError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result.map_err(ApprovalError::from),
            Err(_) => Err(ApprovalError::Timeout(self.config.call_timeout)),
        }
    }
}

fn summarize(
    record: &AnalysisRecord,
    review_reasons: Vec<String>,
) -> Result<InvestigationSummary, ApprovalError> {
    let (Some(investigation), Some(assessment)) = (&record.investigation, &record.confidence)
    else {
        return Err(ApprovalError::MissingAssessment(record.id));
    };

    Ok(InvestigationSummary {
        fingerprint: record.request.fingerprint.clone(),
        target: record.request.target.clone(),
        root_cause: investigation.root_cause.clone(),
        analysis: investigation.analysis.clone(),
        used_fallback: investigation.used_fallback,
        recommendations: investigation.recommendations.clone(),
        confidence_score: assessment.score,
        confidence_level: assessment.level,
        breakdown: assessment.breakdown.clone(),
        review_reasons,
    })
}
