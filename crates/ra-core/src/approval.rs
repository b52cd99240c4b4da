//! Approval records: the child entity through which an operator decides on a
//! remediation that was not auto-approved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::analysis::{Recommendation, TargetRef};
use crate::clock::{add_std, elapsed_between};
use crate::confidence::{ConfidenceBreakdown, ConfidenceLevel};
use crate::store::{StoreError, StoreResult};

/// Default time an operator has to decide.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Decision recorded on an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    TimedOut,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
            ApprovalDecision::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Snapshot of the investigation at the time approval was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationSummary {
    pub fingerprint: String,
    pub target: Option<TargetRef>,
    pub root_cause: String,
    pub analysis: String,
    pub used_fallback: bool,
    pub recommendations: Vec<Recommendation>,
    pub confidence_score: f64,
    pub confidence_level: ConfidenceLevel,
    pub breakdown: ConfidenceBreakdown,
    /// Policy rules that asked for review, if any.
    #[serde(default)]
    pub review_reasons: Vec<String>,
}

/// A request for an operator decision, owned by an analysis record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    /// Owning analysis record.
    pub parent_id: Uuid,
    /// Generation of the parent when this approval was requested.
    pub parent_generation: u64,
    pub summary: InvestigationSummary,
    pub requested_at: DateTime<Utc>,
    pub timeout: Duration,
    pub decision: Option<ApprovalDecision>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl ApprovalRecord {
    pub fn new(
        parent_id: Uuid,
        parent_generation: u64,
        summary: InvestigationSummary,
        requested_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            parent_generation,
            summary,
            requested_at,
            timeout,
            decision: None,
            decided_by: None,
            decided_at: None,
            message: None,
        }
    }

    /// `requested_at + timeout`, or `None` if that overflows.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        add_std(self.requested_at, self.timeout)
    }

    /// True once `now >= requested_at + timeout`.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Time left before the deadline, zero once passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.deadline() {
            Some(deadline) => elapsed_between(now, deadline),
            None => Duration::MAX,
        }
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }
}

/// Storage for approval records, indexed by parent.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Looks up the approval owned by `parent_id`.
    async fn find_by_parent(&self, parent_id: Uuid) -> StoreResult<Option<ApprovalRecord>>;

    /// Stores `approval` unless its parent already owns one, in which case the
    /// existing record is returned unchanged.
    async fn create_if_absent(&self, approval: ApprovalRecord) -> StoreResult<ApprovalRecord>;

    /// Records an operator decision. Only `Approved` and `Rejected` are
    /// accepted, and only on an undecided approval.
    ///
    /// A decision at or past the deadline is refused with
    /// [`StoreError::DeadlinePassed`] and the approval is marked timed out
    /// in the same write.
    async fn record_decision(
        &self,
        parent_id: Uuid,
        decision: ApprovalDecision,
        decided_by: &str,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<ApprovalRecord>;

    /// Marks an undecided approval as timed out. A decided approval is
    /// returned as-is.
    async fn mark_timed_out(&self, parent_id: Uuid, at: DateTime<Utc>)
        -> StoreResult<ApprovalRecord>;

    /// Removes the approval owned by `parent_id`. Returns whether one existed.
    async fn delete_by_parent(&self, parent_id: Uuid) -> StoreResult<bool>;
}

/// In-memory approval store keyed by parent id.
#[derive(Debug, Default)]
pub struct InMemoryApprovalStore {
    approvals: RwLock<HashMap<Uuid, ApprovalRecord>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of approval records.
    pub async fn len(&self) -> usize {
        self.approvals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.approvals.read().await.is_empty()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn find_by_parent(&self, parent_id: Uuid) -> StoreResult<Option<ApprovalRecord>> {
        Ok(self.approvals.read().await.get(&parent_id).cloned())
    }

    async fn create_if_absent(&self, approval: ApprovalRecord) -> StoreResult<ApprovalRecord> {
        let mut approvals = self.approvals.write().await;
        let stored = approvals
            .entry(approval.parent_id)
            .or_insert(approval);
        Ok(stored.clone())
    }

    async fn record_decision(
        &self,
        parent_id: Uuid,
        decision: ApprovalDecision,
        decided_by: &str,
        message: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<ApprovalRecord> {
        if decision == ApprovalDecision::TimedOut {
            return Err(StoreError::InvalidInput(
                "operators may only approve or reject".to_string(),
            ));
        }

        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .get_mut(&parent_id)
            .ok_or_else(|| StoreError::NotFound(format!("approval for {}", parent_id)))?;

        if approval.is_decided() {
            return Err(StoreError::AlreadyDecided(parent_id));
        }
        if approval.is_past_deadline(at) {
            approval.decision = Some(ApprovalDecision::TimedOut);
            approval.decided_at = Some(at);
            return Err(StoreError::DeadlinePassed(parent_id));
        }

        approval.decision = Some(decision);
        approval.decided_by = Some(decided_by.to_string());
        approval.decided_at = Some(at);
        approval.message = message;
        Ok(approval.clone())
    }

    async fn mark_timed_out(
        &self,
        parent_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<ApprovalRecord> {
        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .get_mut(&parent_id)
            .ok_or_else(|| StoreError::NotFound(format!("approval for {}", parent_id)))?;

        if !approval.is_decided() {
            approval.decision = Some(ApprovalDecision::TimedOut);
            approval.decided_at = Some(at);
        }
        Ok(approval.clone())
    }

    async fn delete_by_parent(&self, parent_id: Uuid) -> StoreResult<bool> {
        Ok(self.approvals.write().await.remove(&parent_id).is_some())
    }
}
