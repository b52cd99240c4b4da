//! Audit logging for Remediation Analyst.
//!
//! Every phase transition and every degraded or authoritative decision is
//! recorded here so an operator can reconstruct why a record ended where it
//! did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// An entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique entry ID.
    pub id: Uuid,
    /// Timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event type.
    pub event_type: AuditEventType,
    /// Actor (operator or system component).
    pub actor: String,
    /// Analysis record ID (if applicable).
    pub record_id: Option<Uuid>,
    /// Description of the event.
    pub description: String,
    /// Additional details.
    pub details: serde_json::Value,
    /// Result/outcome.
    pub result: AuditResult,
}

/// Types of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Analysis record accepted.
    RecordSubmitted,
    /// Phase transition committed.
    PhaseTransition,
    /// Record restarted with a new generation.
    RecordRestarted,
    /// Record and its children deleted.
    RecordDeleted,
    /// Context enrichment unavailable, neutral quality used.
    ContextDegraded,
    /// Investigation resolved from historical data.
    InvestigationFallback,
    /// Confidence computed.
    ConfidenceEvaluated,
    /// Policy evaluated and allowed.
    PolicyEvaluated,
    /// Policy produced violations.
    PolicyDenied,
    /// Policy evaluator failed, decision allowed anyway.
    PolicyFailOpen,
    /// No policy set configured.
    PolicyNotConfigured,
    /// Approval record created.
    ApprovalRequested,
    /// Operator decision reconciled.
    ApprovalDecided,
    /// Approval deadline passed without a decision.
    ApprovalTimedOut,
    /// Remediation payload handed to the downstream workflow.
    HandoffEmitted,
    /// Custom event.
    Custom(String),
}

/// Result of an audited operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure(String),
    Denied(String),
    Degraded(String),
    Pending,
}

/// Bounded in-memory audit log.
#[derive(Clone)]
pub struct AuditLog {
    /// In-memory log entries.
    entries: Arc<RwLock<VecDeque<AuditLogEntry>>>,
    /// Maximum entries to keep in memory.
    max_entries: usize,
    /// Whether to also log to tracing.
    log_to_tracing: bool,
}

impl AuditLog {
    /// Creates a new audit log.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries))),
            max_entries,
            log_to_tracing: true,
        }
    }

    /// Creates an audit log without tracing output.
    pub fn without_tracing(max_entries: usize) -> Self {
        Self {
            log_to_tracing: false,
            ..Self::new(max_entries)
        }
    }

    /// Logs an audit entry.
    pub async fn log(&self, entry: AuditLogEntry) {
        if self.log_to_tracing {
            info!(
                event_type = ?entry.event_type,
                actor = %entry.actor,
                record_id = ?entry.record_id,
                result = ?entry.result,
                "Audit: {}",
                entry.description
            );
        }

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Logs an event for an analysis record.
    pub async fn log_record_event(
        &self,
        event_type: AuditEventType,
        actor: &str,
        record_id: Uuid,
        description: &str,
        details: serde_json::Value,
        result: AuditResult,
    ) {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            actor: actor.to_string(),
            record_id: Some(record_id),
            description: description.to_string(),
            details,
            result,
        };
        self.log(entry).await;
    }

    /// Gets all entries.
    pub async fn get_entries(&self) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().await;
        entries.iter().cloned().collect()
    }

    /// Gets entries for a specific record.
    pub async fn get_record_entries(&self, record_id: Uuid) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.record_id == Some(record_id))
            .cloned()
            .collect()
    }

    /// Gets entries by event type.
    pub async fn get_entries_by_type(&self, event_type: AuditEventType) -> Vec<AuditLogEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Gets the number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Checks if the audit log is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(10000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_event() {
        let audit_log = AuditLog::without_tracing(100);
        let record_id = Uuid::new_v4();

        audit_log
            .log_record_event(
                AuditEventType::InvestigationFallback,
                "investigation",
                record_id,
                "Backend unavailable, using historical data",
                serde_json::json!({"attempts": 10}),
                AuditResult::Degraded("retry budget exhausted".into()),
            )
            .await;
        audit_log
            .log_record_event(
                AuditEventType::Custom("other".into()),
                "test",
                Uuid::new_v4(),
                "unrelated",
                serde_json::Value::Null,
                AuditResult::Success,
            )
            .await;

        let entries = audit_log.get_record_entries(record_id).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].details["attempts"], 10);
    }

    #[tokio::test]
    async fn test_max_entries() {
        let audit_log = AuditLog::without_tracing(5);

        for i in 0..10 {
            audit_log
                .log_record_event(
                    AuditEventType::Custom(format!("event-{}", i)),
                    "test",
                    Uuid::new_v4(),
                    &format!("Event {}", i),
                    serde_json::Value::Null,
                    AuditResult::Success,
                )
                .await;
        }

        assert_eq!(audit_log.len().await, 5);

        // Oldest events are evicted first
        let entries = audit_log.get_entries().await;
        assert!(matches!(
            &entries[0].event_type,
            AuditEventType::Custom(s) if s == "event-5"
        ));
    }

    #[tokio::test]
    async fn test_filter_by_type() {
        let audit_log = AuditLog::without_tracing(100);
        let record_id = Uuid::new_v4();

        for event_type in [
            AuditEventType::PolicyFailOpen,
            AuditEventType::PolicyEvaluated,
            AuditEventType::PolicyFailOpen,
        ] {
            audit_log
                .log_record_event(
                    event_type,
                    "policy",
                    record_id,
                    "policy",
                    serde_json::Value::Null,
                    AuditResult::Success,
                )
                .await;
        }

        let fail_open = audit_log
            .get_entries_by_type(AuditEventType::PolicyFailOpen)
            .await;
        assert_eq!(fail_open.len(), 2);
    }

    #[tokio::test]
    async fn test_entries_serialize_with_snake_case_types() {
        let audit_log = AuditLog::without_tracing(100);

        audit_log
            .log_record_event(
                AuditEventType::HandoffEmitted,
                "orchestrator",
                Uuid::new_v4(),
                "Test event",
                serde_json::Value::Null,
                AuditResult::Success,
            )
            .await;

        let json = serde_json::to_string(&audit_log.get_entries().await).unwrap();
        assert!(json.contains("handoff_emitted"));
    }
}
