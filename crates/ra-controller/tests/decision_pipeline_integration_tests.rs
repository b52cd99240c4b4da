//! Integration tests for the decision pipeline.
//!
//! Each test drives an analysis record through the orchestrator against
//! in-memory stores, scripted backends, and a manual clock:
//! - Auto-approval, operator approval, and every rejection path
//! - Investigation retries, circuit breaking, and historical fallback
//! - Approval idempotency, timeouts, restart, and delete cascade
//! - Optimistic-concurrency conflicts
//!
//! ```bash
//! cargo test --package ra-controller --test decision_pipeline_integration_tests
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use ra_connectors::{
    ConnectorError, ContextQueryResult, InvestigationResponse, MockContextEnricher,
    MockInvestigationBackend,
};
use ra_controller::{
    Collaborators, ControllerConfig, DecisionOrchestrator, RecordingWorkflowSink, Requeue,
    AUTO_APPROVER,
};
use ra_core::vector::{Embedder, FingerprintEmbedder, IncidentVectorStore, InMemoryIncidentStore};
use ra_core::{
    AlertMetadata, AnalysisRecord, AnalysisRequest, ApprovalDecision, ApprovalStore,
    DecisionOutcome, HistoricalIncident, InMemoryApprovalStore, InMemoryRecordStore, ManualClock,
    Phase, PolicyBasis, PolicyDecision, Recommendation, RecordStore, RejectionKind,
    RemediationAction, StoreResult, TargetRef,
};
use ra_observability::metrics::{DECISIONS_TOTAL, POLICY_FAIL_OPEN_TOTAL};
use ra_observability::{AuditEventType, AuditLog, AuditResult, InMemoryMetrics};
use ra_policy::{
    DecisionInput, PolicyError, PolicyEvaluator, PolicyRuleBuilder, RuleCondition, RuleEngine,
};

// ============================================================================
// Test Harness
// ============================================================================

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

fn response(confidence: f64, recommendations: &[f64]) -> InvestigationResponse {
    InvestigationResponse {
        root_cause: "memory limit too low for current traffic".into(),
        analysis: "container restarted 14 times with OOMKilled".into(),
        confidence,
        recommendations: recommendations
            .iter()
            .map(|c| Recommendation::new("increase_memory_limit", *c))
            .collect(),
        tools_used: vec!["kubectl".into()],
    }
}

fn request(fingerprint: &str) -> AnalysisRequest {
    AnalysisRequest::new(
        fingerprint,
        AlertMetadata {
            name: "PodOOMKilled".into(),
            environment: "staging".into(),
            ..Default::default()
        },
        TargetRef::new("Deployment", "payments", "api"),
    )
}

fn rich_context() -> ContextQueryResult {
    ContextQueryResult {
        similar_incidents: vec![HistoricalIncident {
            id: "inc-41".into(),
            fingerprint: "fp-oom".into(),
            timestamp: start_time() - chrono::Duration::days(3),
            root_cause: "memory limit too low".into(),
            remediation_actions: vec![RemediationAction::new("increase_memory_limit")],
            success_rate: 0.9,
        }],
        patterns: vec!["daily traffic peak".into()],
        quality_score: 0.9,
    }
}

/// Record store whose next update loses a race against another writer.
struct RacingRecordStore {
    inner: InMemoryRecordStore,
    armed: AtomicBool,
}

impl RacingRecordStore {
    fn new() -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            armed: AtomicBool::new(false),
        }
    }

    fn lose_next_update(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for RacingRecordStore {
    async fn insert(&self, record: AnalysisRecord) -> StoreResult<AnalysisRecord> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<AnalysisRecord>> {
        self.inner.get(id).await
    }

    async fn update(&self, record: AnalysisRecord) -> StoreResult<AnalysisRecord> {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(current) = self.inner.get(record.id).await? {
                self.inner.update(current).await?;
            }
        }
        self.inner.update(record).await
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        self.inner.delete(id).await
    }

    async fn list_ids(&self) -> StoreResult<Vec<Uuid>> {
        self.inner.list_ids().await
    }
}

/// Record store that deletes a record instead of writing it into `Approving`,
/// as a concurrent delete landing between read and write would.
struct DeletingRecordStore {
    inner: InMemoryRecordStore,
}

#[async_trait]
impl RecordStore for DeletingRecordStore {
    async fn insert(&self, record: AnalysisRecord) -> StoreResult<AnalysisRecord> {
        self.inner.insert(record).await
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<AnalysisRecord>> {
        self.inner.get(id).await
    }

    async fn update(&self, record: AnalysisRecord) -> StoreResult<AnalysisRecord> {
        if record.phase == Phase::Approving {
            self.inner.delete(record.id).await?;
        }
        self.inner.update(record).await
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        self.inner.delete(id).await
    }

    async fn list_ids(&self) -> StoreResult<Vec<Uuid>> {
        self.inner.list_ids().await
    }
}

struct UnreachablePolicy;

#[async_trait]
impl PolicyEvaluator for UnreachablePolicy {
    async fn evaluate(&self, _input: &DecisionInput) -> Result<PolicyDecision, PolicyError> {
        Err(PolicyError::Backend("policy service unreachable".into()))
    }
}

struct Setup {
    backend: MockInvestigationBackend,
    enricher: Option<Arc<MockContextEnricher>>,
    policy: Option<Arc<dyn PolicyEvaluator>>,
    records: Option<Arc<dyn RecordStore>>,
    config: ControllerConfig,
}

impl Setup {
    fn new(backend: MockInvestigationBackend) -> Self {
        Self {
            backend,
            enricher: None,
            policy: None,
            records: None,
            config: ControllerConfig::default(),
        }
    }

    fn enricher(mut self, enricher: MockContextEnricher) -> Self {
        self.enricher = Some(Arc::new(enricher));
        self
    }

    fn policy(mut self, policy: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = Some(policy);
        self
    }

    fn records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::new(start_time()));
        let backend = Arc::new(self.backend);
        let approvals = Arc::new(InMemoryApprovalStore::new());
        let incidents = Arc::new(InMemoryIncidentStore::new());
        let sink = Arc::new(RecordingWorkflowSink::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let audit = AuditLog::without_tracing(10_000);
        let records = self
            .records
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()) as Arc<dyn RecordStore>);

        let collaborators = Collaborators {
            records,
            approvals: approvals.clone(),
            backend: backend.clone(),
            enricher: self
                .enricher
                .map(|e| e as Arc<dyn ra_connectors::ContextEnricher>),
            vector_store: incidents.clone(),
            embedder: Arc::new(FingerprintEmbedder::default()),
            policy: self.policy,
            workflow: sink.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
            audit: audit.clone(),
        };

        Harness {
            orchestrator: DecisionOrchestrator::new(&self.config, collaborators),
            clock,
            backend,
            approvals,
            incidents,
            sink,
            metrics,
            audit,
        }
    }
}

struct Harness {
    orchestrator: DecisionOrchestrator,
    clock: Arc<ManualClock>,
    backend: Arc<MockInvestigationBackend>,
    approvals: Arc<InMemoryApprovalStore>,
    incidents: Arc<InMemoryIncidentStore>,
    sink: Arc<RecordingWorkflowSink>,
    metrics: Arc<InMemoryMetrics>,
    audit: AuditLog,
}

impl Harness {
    async fn submit(&self, fingerprint: &str) -> Uuid {
        self.orchestrator.submit(request(fingerprint)).await.unwrap()
    }

    async fn drive(&self, id: Uuid) -> (Requeue, AnalysisRecord) {
        self.orchestrator.drive(id).await.unwrap()
    }

    /// Drives the record, advancing the clock through every delay, until it
    /// settles or waits on something other than time.
    async fn drive_to_settled(&self, id: Uuid) -> AnalysisRecord {
        for _ in 0..50 {
            let (requeue, record) = self.drive(id).await;
            match requeue {
                Requeue::After(delay) => self.clock.advance(delay),
                _ => return record,
            }
        }
        panic!("record {} did not settle", id);
    }

    fn decisions(&self, outcome: &str) -> u64 {
        self.metrics
            .counter(DECISIONS_TOTAL, &[("outcome", outcome.to_string())])
    }
}

// ============================================================================
// Decision scenarios
// ============================================================================

#[tokio::test]
async fn test_high_confidence_is_auto_approved() {
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.9, &[0.8])))
        .enricher(MockContextEnricher::returning(rich_context()))
        .build();
    let id = harness.submit("fp-oom").await;

    let (requeue, record) = harness.drive(id).await;

    assert_eq!(requeue, Requeue::Done);
    assert_eq!(record.phase, Phase::Ready);
    assert_eq!(record.outcome, Some(DecisionOutcome::AutoApproved));
    let assessment = record.confidence.as_ref().unwrap();
    assert!((assessment.score - 87.0).abs() < 1e-9);
    assert!(harness.approvals.is_empty().await);

    let handoffs = harness.sink.handoffs();
    assert_eq!(handoffs.len(), 1);
    assert_eq!(handoffs[0].approval.decided_by, AUTO_APPROVER);
    assert!(handoffs[0].approval.approval_id.is_none());
    assert_eq!(handoffs[0].recommendations.len(), 1);
    assert_eq!(record.handoff.as_ref(), Some(&handoffs[0]));
    assert_eq!(harness.decisions("auto_approved"), 1);
}

#[tokio::test]
async fn test_medium_confidence_waits_for_operator_approval() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;

    let (requeue, record) = harness.drive(id).await;
    assert_eq!(record.phase, Phase::Approving);
    assert_eq!(record.outcome, Some(DecisionOutcome::PendingApproval));
    assert!((record.confidence.as_ref().unwrap().score - 70.0).abs() < 1e-9);
    assert_eq!(requeue, Requeue::After(Duration::from_secs(30)));
    assert!(record.approval_ref.is_some());
    assert!(harness.sink.is_empty());

    harness.clock.advance(Duration::from_secs(120));
    harness
        .orchestrator
        .record_decision(id, ApprovalDecision::Approved, "alice", Some("looks right".into()))
        .await
        .unwrap();

    let (requeue, record) = harness.drive(id).await;
    assert_eq!(requeue, Requeue::Done);
    assert_eq!(record.phase, Phase::Ready);
    assert_eq!(record.outcome, Some(DecisionOutcome::Approved));

    let handoff = record.handoff.unwrap();
    assert_eq!(handoff.approval.decided_by, "alice");
    assert_eq!(handoff.approval.message.as_deref(), Some("looks right"));
    assert_eq!(
        handoff.approval.approval_id,
        record.approval_ref.map(|r| r.approval_id)
    );
    assert_eq!(harness.sink.len(), 1);
}

#[tokio::test]
async fn test_policy_denial_overrides_confidence() {
    let freeze = PolicyRuleBuilder::new("maintenance_freeze")
        .when(RuleCondition::Always)
        .then_deny("maintenance window active")
        .build()
        .unwrap();
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7])))
        .policy(Arc::new(RuleEngine::new(vec![freeze])))
        .build();
    let id = harness.submit("fp-oom").await;

    let (_, record) = harness.drive(id).await;

    assert_eq!(record.phase, Phase::Rejected);
    let rejection = record.rejection.unwrap();
    assert_eq!(rejection.kind, RejectionKind::PolicyDenied);
    assert!(rejection.message.contains("maintenance window active"));
    assert!(!rejection.message.contains("confidence"));
    assert!(harness.approvals.is_empty().await);
    assert_eq!(
        harness
            .audit
            .get_entries_by_type(AuditEventType::PolicyDenied)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_low_confidence_is_rejected_without_approval() {
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.5, &[]))).build();
    let id = harness.submit("fp-oom").await;

    let (_, record) = harness.drive(id).await;

    assert_eq!(record.phase, Phase::Rejected);
    assert!((record.confidence.as_ref().unwrap().score - 35.0).abs() < 1e-9);
    assert_eq!(record.rejection.unwrap().kind, RejectionKind::LowConfidence);
    assert!(harness.approvals.is_empty().await);
    assert!(harness.sink.is_empty());
    assert_eq!(harness.decisions("rejected"), 1);
}

#[tokio::test]
async fn test_unavailable_backend_without_history_is_rejected() {
    let harness =
        Setup::new(MockInvestigationBackend::failing(ConnectorError::ServerError(503))).build();
    let id = harness.submit("fp-unknown").await;

    let record = harness.drive_to_settled(id).await;

    assert_eq!(record.phase, Phase::Rejected);
    let investigation = record.investigation.as_ref().unwrap();
    assert!(investigation.used_fallback);
    assert!((investigation.confidence - 0.30).abs() < 1e-9);
    assert!((record.confidence.as_ref().unwrap().score - 23.4).abs() < 1e-9);

    let rejection = record.rejection.unwrap();
    assert_eq!(rejection.kind, RejectionKind::InvestigationUnavailable);
    assert!(rejection.message.contains("no historical data"));
    assert!(harness.backend.call_count() >= 1);
    assert!(record.investigation_attempts.attempts <= 10);
    assert_eq!(
        harness
            .audit
            .get_entries_by_type(AuditEventType::InvestigationFallback)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn test_undecided_approval_times_out() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;
    let (_, record) = harness.drive(id).await;
    assert_eq!(record.phase, Phase::Approving);
    assert_eq!(record.approval_ref.unwrap().requested_at, start_time());

    harness.clock.advance(Duration::from_secs(16 * 60));
    let (requeue, record) = harness.drive(id).await;

    assert_eq!(requeue, Requeue::Done);
    assert_eq!(record.phase, Phase::Rejected);
    let rejection = record.rejection.unwrap();
    assert_eq!(rejection.kind, RejectionKind::ApprovalTimedOut);
    assert!(rejection.message.contains("timed out"));

    let approval = harness.approvals.find_by_parent(id).await.unwrap().unwrap();
    assert_eq!(approval.decision, Some(ApprovalDecision::TimedOut));
}

// ============================================================================
// Operator and policy paths
// ============================================================================

#[tokio::test]
async fn test_operator_rejection() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;
    harness.drive(id).await;

    harness
        .orchestrator
        .record_decision(id, ApprovalDecision::Rejected, "bob", Some("wrong target".into()))
        .await
        .unwrap();
    let (_, record) = harness.drive(id).await;

    assert_eq!(record.phase, Phase::Rejected);
    let rejection = record.rejection.unwrap();
    assert_eq!(rejection.kind, RejectionKind::OperatorRejected);
    assert_eq!(rejection.message, "rejected by bob: wrong target");
}

#[tokio::test]
async fn test_decision_before_deadline_wins_over_late_poll() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;
    harness.drive(id).await;

    harness.clock.advance(Duration::from_secs(14 * 60));
    harness
        .orchestrator
        .record_decision(id, ApprovalDecision::Approved, "alice", None)
        .await
        .unwrap();
    harness.clock.advance(Duration::from_secs(2 * 60));

    let (_, record) = harness.drive(id).await;
    assert_eq!(record.phase, Phase::Ready);
    assert_eq!(record.outcome, Some(DecisionOutcome::Approved));
}

#[tokio::test]
async fn test_decision_after_deadline_is_refused() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;
    harness.drive(id).await;

    harness.clock.advance(Duration::from_secs(20 * 60));
    let err = harness
        .orchestrator
        .record_decision(id, ApprovalDecision::Approved, "alice", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));

    harness.clock.advance(Duration::from_secs(60));
    let (requeue, record) = harness.drive(id).await;

    assert_eq!(requeue, Requeue::Done);
    assert_eq!(record.phase, Phase::Rejected);
    assert_ne!(record.outcome, Some(DecisionOutcome::Approved));
    let rejection = record.rejection.unwrap();
    assert_eq!(rejection.kind, RejectionKind::ApprovalTimedOut);
    assert!(rejection.message.contains("timed out"));
    assert!(harness.sink.is_empty());
}

#[tokio::test]
async fn test_policy_failure_fails_open() {
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.9, &[0.8])))
        .enricher(MockContextEnricher::returning(rich_context()))
        .policy(Arc::new(UnreachablePolicy))
        .build();
    let id = harness.submit("fp-oom").await;

    let (_, record) = harness.drive(id).await;

    assert_eq!(record.phase, Phase::Ready);
    assert_eq!(record.policy.unwrap().basis, PolicyBasis::FailOpen);
    assert_eq!(harness.metrics.counter_total(POLICY_FAIL_OPEN_TOTAL), 1);
}

#[tokio::test]
async fn test_review_rule_routes_high_confidence_to_operator() {
    let review = PolicyRuleBuilder::new("payments_review")
        .when(RuleCondition::NamespaceIn(vec!["payments".into()]))
        .then_require_approval()
        .build()
        .unwrap();
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.9, &[0.8])))
        .enricher(MockContextEnricher::returning(rich_context()))
        .policy(Arc::new(RuleEngine::new(vec![review])))
        .build();
    let id = harness.submit("fp-oom").await;

    let (_, record) = harness.drive(id).await;

    assert_eq!(record.phase, Phase::Approving);
    let approval = harness.approvals.find_by_parent(id).await.unwrap().unwrap();
    assert!(approval.summary.review_reasons[0].contains("payments_review"));
}

// ============================================================================
// Investigation and context paths
// ============================================================================

#[tokio::test]
async fn test_transient_failure_is_retried_with_backoff() {
    let backend = MockInvestigationBackend::succeeding(response(0.9, &[0.8]));
    backend.push_error(ConnectorError::Timeout("read timed out".into()));
    let harness = Setup::new(backend)
        .enricher(MockContextEnricher::returning(rich_context()))
        .build();
    let id = harness.submit("fp-oom").await;

    let (requeue, record) = harness.drive(id).await;
    assert_eq!(requeue, Requeue::After(Duration::from_secs(5)));
    assert_eq!(record.phase, Phase::Investigating);
    assert_eq!(record.investigation_attempts.attempts, 1);
    assert!(record.investigation_attempts.last_error.is_some());

    // An early wake-up does not call the backend again.
    let (requeue, _) = harness.drive(id).await;
    assert_eq!(requeue, Requeue::After(Duration::from_secs(5)));
    assert_eq!(harness.backend.call_count(), 1);

    harness.clock.advance(Duration::from_secs(5));
    let (_, record) = harness.drive(id).await;
    assert_eq!(record.phase, Phase::Ready);
    assert!(!record.investigation.unwrap().used_fallback);
    assert_eq!(harness.backend.call_count(), 2);
}

#[tokio::test]
async fn test_terminal_error_falls_back_to_similar_incidents() {
    let harness = Setup::new(MockInvestigationBackend::failing(
        ConnectorError::AuthenticationFailed("token rejected".into()),
    ))
    .build();
    let embedding = FingerprintEmbedder::default().embed("fp-oom").unwrap();
    harness
        .incidents
        .upsert(
            HistoricalIncident {
                id: "inc-7".into(),
                fingerprint: "fp-oom".into(),
                timestamp: start_time() - chrono::Duration::days(1),
                root_cause: "memory limit too low".into(),
                remediation_actions: vec![RemediationAction::new("increase_memory_limit")],
                success_rate: 0.9,
            },
            embedding,
        )
        .await
        .unwrap();
    let id = harness.submit("fp-oom").await;

    let (_, record) = harness.drive(id).await;

    assert_eq!(harness.backend.call_count(), 1);
    let investigation = record.investigation.unwrap();
    assert!(investigation.used_fallback);
    assert_eq!(investigation.root_cause, "memory limit too low");
    assert_eq!(
        investigation.recommendations[0].action,
        "increase_memory_limit"
    );
    assert!(record.confidence.is_some());
}

#[tokio::test]
async fn test_enrichment_failure_degrades_context() {
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7])))
        .enricher(MockContextEnricher::failing(ConnectorError::ConnectionFailed(
            "connection refused".into(),
        )))
        .build();
    let id = harness.submit("fp-oom").await;

    let (_, record) = harness.drive(id).await;

    let context = record.context.unwrap();
    assert!(context.degraded);
    assert!(context.note.unwrap().contains("connection refused"));
    assert!((record.confidence.unwrap().score - 70.0).abs() < 1e-9);

    let degraded = harness
        .audit
        .get_entries_by_type(AuditEventType::ContextDegraded)
        .await;
    assert_eq!(degraded.len(), 1);
    assert!(matches!(degraded[0].result, AuditResult::Degraded(_)));
}

#[tokio::test]
async fn test_invalid_request_fails_without_backend_call() {
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.9, &[0.8]))).build();
    let mut invalid = request("fp-oom");
    invalid.target = None;
    let id = harness.orchestrator.submit(invalid).await.unwrap();

    let (requeue, record) = harness.drive(id).await;

    assert_eq!(requeue, Requeue::Done);
    assert_eq!(record.phase, Phase::Failed);
    assert_eq!(record.outcome, Some(DecisionOutcome::Failed));
    assert!(record.message.unwrap().contains("target"));
    assert_eq!(harness.backend.call_count(), 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_repeated_reconcile_creates_one_approval() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;

    for _ in 0..5 {
        harness.drive(id).await;
        harness.clock.advance(Duration::from_secs(30));
    }

    assert_eq!(harness.approvals.len().await, 1);
    assert_eq!(
        harness
            .audit
            .get_entries_by_type(AuditEventType::ApprovalRequested)
            .await
            .len(),
        1
    );
    assert_eq!(harness.backend.call_count(), 1);
}

#[tokio::test]
async fn test_poll_interval_shrinks_near_deadline() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;
    harness.drive(id).await;

    harness.clock.advance(Duration::from_secs(15 * 60 - 10));
    let (requeue, record) = harness.drive(id).await;

    assert_eq!(record.phase, Phase::Approving);
    assert_eq!(requeue, Requeue::After(Duration::from_secs(10)));
}

#[tokio::test]
async fn test_restart_starts_new_generation() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;
    let (_, before) = harness.drive(id).await;
    assert_eq!(before.phase, Phase::Approving);
    let first_approval = before.approval_ref.unwrap().approval_id;

    let restarted = harness.orchestrator.restart(id).await.unwrap();
    assert_eq!(restarted.generation, 2);
    assert_eq!(restarted.phase, Phase::Pending);
    assert!(restarted.confidence.is_none());
    assert!(restarted.approval_ref.is_none());
    assert!(harness.approvals.is_empty().await);

    let (_, after) = harness.drive(id).await;
    assert_eq!(after.phase, Phase::Approving);
    let approval = harness.approvals.find_by_parent(id).await.unwrap().unwrap();
    assert_eq!(approval.parent_generation, 2);
    assert_ne!(approval.id, first_approval);
    assert_eq!(harness.backend.call_count(), 2);
}

#[tokio::test]
async fn test_delete_removes_approval() {
    let harness =
        Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7]))).build();
    let id = harness.submit("fp-oom").await;
    harness.drive(id).await;
    assert_eq!(harness.approvals.len().await, 1);

    assert!(harness.orchestrator.delete(id).await.unwrap());

    assert!(harness.orchestrator.get(id).await.unwrap().is_none());
    assert!(harness.approvals.is_empty().await);
    assert_eq!(harness.orchestrator.reconcile(id).await.unwrap(), Requeue::Done);
    assert!(!harness.orchestrator.delete(id).await.unwrap());
}

#[tokio::test]
async fn test_delete_during_approval_request_leaves_no_approval() {
    let records = Arc::new(DeletingRecordStore {
        inner: InMemoryRecordStore::new(),
    });
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7])))
        .records(records.clone())
        .build();
    let id = harness.submit("fp-oom").await;

    let err = harness.orchestrator.drive(id).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(harness.orchestrator.get(id).await.unwrap().is_none());
    assert!(harness.approvals.is_empty().await);
    assert_eq!(harness.orchestrator.reconcile(id).await.unwrap(), Requeue::Done);
}

#[tokio::test]
async fn test_reconcile_of_deleted_record_removes_leftover_approval() {
    let records = Arc::new(InMemoryRecordStore::new());
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.85, &[0.7])))
        .records(records.clone())
        .build();
    let id = harness.submit("fp-oom").await;
    harness.drive(id).await;
    assert_eq!(harness.approvals.len().await, 1);

    // Parent removed behind the orchestrator's back, child still stored.
    assert!(records.delete(id).await.unwrap());

    assert_eq!(harness.orchestrator.reconcile(id).await.unwrap(), Requeue::Done);
    assert!(harness.approvals.is_empty().await);
}

#[tokio::test]
async fn test_stale_write_requeues_immediately() {
    let records = Arc::new(RacingRecordStore::new());
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.9, &[0.8])))
        .records(records.clone())
        .build();
    let id = harness.submit("fp-oom").await;

    records.lose_next_update();
    let requeue = harness.orchestrator.reconcile(id).await.unwrap();
    assert_eq!(requeue, Requeue::Immediate);
    let record = harness.orchestrator.get(id).await.unwrap().unwrap();
    assert_eq!(record.phase, Phase::Pending);

    let requeue = harness.orchestrator.reconcile(id).await.unwrap();
    assert_eq!(requeue, Requeue::Immediate);
    let record = harness.orchestrator.get(id).await.unwrap().unwrap();
    assert_eq!(record.phase, Phase::Validating);
}

#[tokio::test]
async fn test_terminal_records_are_left_alone() {
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.5, &[]))).build();
    let id = harness.submit("fp-oom").await;
    let (_, settled) = harness.drive(id).await;

    assert_eq!(harness.orchestrator.reconcile(id).await.unwrap(), Requeue::Done);
    let record = harness.orchestrator.get(id).await.unwrap().unwrap();
    assert_eq!(record.version, settled.version);
}

#[tokio::test]
async fn test_failed_handoff_keeps_record_ready() {
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.9, &[0.8])))
        .enricher(MockContextEnricher::returning(rich_context()))
        .build();
    harness.sink.fail_with("workflow service unavailable");
    let id = harness.submit("fp-oom").await;

    let (_, record) = harness.drive(id).await;
    assert_eq!(record.phase, Phase::Ready);
    assert!(record.handoff.is_some());
    assert!(harness.sink.is_empty());
    let emitted = harness
        .audit
        .get_entries_by_type(AuditEventType::HandoffEmitted)
        .await;
    assert!(matches!(emitted[0].result, AuditResult::Failure(_)));

    harness.sink.recover();
    harness.orchestrator.resend_handoff(id).await.unwrap();
    assert_eq!(harness.sink.len(), 1);
}

#[tokio::test]
async fn test_phase_history_records_every_step() {
    let harness = Setup::new(MockInvestigationBackend::succeeding(response(0.9, &[0.8])))
        .enricher(MockContextEnricher::returning(rich_context()))
        .build();
    let id = harness.submit("fp-oom").await;

    let (_, record) = harness.drive(id).await;

    let phases: Vec<Phase> = record.phase_history.iter().map(|e| e.phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Pending,
            Phase::Validating,
            Phase::PreparingContext,
            Phase::Investigating,
            Phase::EvaluatingConfidence,
            Phase::EvaluatingPolicy,
            Phase::Ready,
        ]
    );
    let audited = harness.audit.get_record_entries(id).await;
    assert!(audited
        .iter()
        .any(|e| e.event_type == AuditEventType::ConfidenceEvaluated));
}
