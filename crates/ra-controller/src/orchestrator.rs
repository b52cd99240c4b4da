//! Decision orchestrator.
//!
//! Drives one [`AnalysisRecord`] through its phases. Each call to
//! [`DecisionOrchestrator::reconcile`] reads the record, performs at most
//! one phase step, persists the result through the versioned record store,
//! and tells the caller when to come back.

use chrono::{DateTime, Utc};
use ra_connectors::{
    AttemptOutcome, CircuitState, ContextEnricher, InvestigationBackend, InvestigationClient,
    InvestigationRequest,
};
use ra_core::vector::{Embedder, IncidentVectorStore};
use ra_core::{
    AnalysisRecord, AnalysisRequest, ApprovalDecision, ApprovalProvenance, ApprovalRecord,
    ApprovalRef, ApprovalStore, Clock, ConfidenceAssessment, ConfidenceEngine, DecisionOutcome,
    EnrichedContext, HistoricalSimilarityService, InvestigationResult, Phase, PhaseEntry,
    RecordStore, RejectionKind, RejectionReason, RemediationHandoff, StoreError,
};
use ra_observability::metrics::{
    CONFIDENCE_SCORE, DECISIONS_TOTAL, PHASE_TRANSITIONS_TOTAL, RECONCILE_DURATION_SECONDS,
};
use ra_observability::{AuditEventType, AuditLog, AuditResult, MetricsSink};
use ra_policy::{
    ApprovalCoordinator, ApprovalError, ApprovalPoll, DecisionInput, PolicyEvaluator, PolicyGate,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{CallTimeouts, ControllerConfig, EnrichmentConfig};
use crate::decision::{decide, Decision, DecisionConfig};
use crate::error::OrchestratorError;
use crate::phase::can_transition;
use crate::workflow::WorkflowSink;

/// Actor name used in audit entries.
const ACTOR: &str = "orchestrator";

/// `decided_by` recorded on auto-approved hand-offs.
pub const AUTO_APPROVER: &str = "system:auto-approval";

/// Upper bound on back-to-back ticks in [`DecisionOrchestrator::drive`].
const MAX_TICKS: usize = 64;

/// When the record should be reconciled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Right away; the record advanced or a stale write must be retried.
    Immediate,
    /// After the given delay.
    After(Duration),
    /// Not until something external changes the record.
    Done,
}

/// External services the orchestrator depends on.
pub struct Collaborators {
    pub records: Arc<dyn RecordStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub backend: Arc<dyn InvestigationBackend>,
    /// Context enrichment service; `None` means every record gets degraded context.
    pub enricher: Option<Arc<dyn ContextEnricher>>,
    pub vector_store: Arc<dyn IncidentVectorStore>,
    pub embedder: Arc<dyn Embedder>,
    /// Policy evaluator; `None` means every decision is allowed.
    pub policy: Option<Arc<dyn PolicyEvaluator>>,
    pub workflow: Arc<dyn WorkflowSink>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsSink>,
    pub audit: AuditLog,
}

/// Reconciles analysis records into remediation decisions.
pub struct DecisionOrchestrator {
    records: Arc<dyn RecordStore>,
    enricher: Option<Arc<dyn ContextEnricher>>,
    investigation: InvestigationClient,
    historical: HistoricalSimilarityService,
    confidence: ConfidenceEngine,
    policy: PolicyGate,
    approvals: ApprovalCoordinator,
    workflow: Arc<dyn WorkflowSink>,
    decision: DecisionConfig,
    enrichment: EnrichmentConfig,
    timeouts: CallTimeouts,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    audit: AuditLog,
}

impl DecisionOrchestrator {
    pub fn new(config: &ControllerConfig, c: Collaborators) -> Self {
        let investigation = InvestigationClient::new(
            c.backend,
            config.investigation.clone(),
            c.clock.clone(),
            c.metrics.clone(),
        );
        let historical =
            HistoricalSimilarityService::new(c.vector_store, c.embedder, config.historical.clone());
        let policy = PolicyGate::new(
            c.policy,
            config.timeouts.policy,
            c.metrics.clone(),
            c.audit.clone(),
        );
        let approvals = ApprovalCoordinator::new(
            c.approvals,
            config.approval.clone(),
            c.metrics.clone(),
            c.audit.clone(),
        );

        Self {
            records: c.records,
            enricher: c.enricher,
            investigation,
            historical,
            confidence: ConfidenceEngine::new(config.confidence.clone()),
            policy,
            approvals,
            workflow: c.workflow,
            decision: config.decision.clone(),
            enrichment: config.enrichment.clone(),
            timeouts: config.timeouts.clone(),
            clock: c.clock,
            metrics: c.metrics,
            audit: c.audit,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// State of the investigation backend's circuit breaker.
    pub fn circuit_state(&self) -> CircuitState {
        self.investigation.circuit_state()
    }

    /// Accepts a request and stores it as a `Pending` record.
    ///
    /// The request is not validated here; validation is the first phase.
    #[instrument(skip(self, request), fields(fingerprint = %request.fingerprint))]
    pub async fn submit(&self, request: AnalysisRequest) -> Result<Uuid, OrchestratorError> {
        let now = self.clock.now();
        let record = AnalysisRecord::new(request, now);
        let stored = self
            .bounded("record insert", self.records.insert(record))
            .await?;

        info!(record_id = %stored.id, "Analysis record submitted");
        self.audit
            .log_record_event(
                AuditEventType::RecordSubmitted,
                ACTOR,
                stored.id,
                "Analysis record submitted",
                serde_json::json!({
                    "fingerprint": stored.request.fingerprint,
                    "environment": stored.request.alert.environment,
                }),
                AuditResult::Success,
            )
            .await;
        Ok(stored.id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<AnalysisRecord>, OrchestratorError> {
        self.load(id).await
    }

    pub async fn list_ids(&self) -> Result<Vec<Uuid>, OrchestratorError> {
        self.bounded("record list", self.records.list_ids()).await
    }

    /// Performs one reconciliation step for `id`.
    ///
    /// A stale write is not an error: the step is abandoned and
    /// [`Requeue::Immediate`] is returned so the caller re-reads the record.
    #[instrument(skip(self), fields(record_id = %id))]
    pub async fn reconcile(&self, id: Uuid) -> Result<Requeue, OrchestratorError> {
        let started = Instant::now();
        let Some(record) = self.load(id).await? else {
            // A delete racing an approval request can leave the child behind.
            if self.approvals.cancel(id).await? {
                info!("Removed approval of deleted record");
            } else {
                debug!("Record no longer exists");
            }
            return Ok(Requeue::Done);
        };
        if record.is_terminal() {
            return Ok(Requeue::Done);
        }

        let phase = record.phase;
        let now = self.clock.now();
        let result = match phase {
            Phase::Pending => self.begin(record, now).await,
            Phase::Validating => self.validate(record, now).await,
            Phase::PreparingContext => self.prepare_context(record, now).await,
            Phase::Investigating => self.investigate(record, now).await,
            Phase::EvaluatingConfidence => self.evaluate_confidence(record, now).await,
            Phase::EvaluatingPolicy => self.evaluate_policy(record, now).await,
            Phase::Approving => self.await_approval(record, now).await,
            Phase::Ready | Phase::Rejected | Phase::Failed => Ok(Requeue::Done),
        };

        self.metrics.record_histogram(
            RECONCILE_DURATION_SECONDS,
            &[("phase", phase.as_str().to_string())],
            started.elapsed().as_secs_f64(),
        );

        match result {
            Err(e) if e.is_conflict() => {
                debug!(error = %e, "Stale write, record will be re-read");
                Ok(Requeue::Immediate)
            }
            other => other,
        }
    }

    /// Reconciles `id` until it needs to wait or is finished.
    ///
    /// Returns the last requeue decision and the record as stored.
    pub async fn drive(&self, id: Uuid) -> Result<(Requeue, AnalysisRecord), OrchestratorError> {
        for _ in 0..MAX_TICKS {
            match self.reconcile(id).await? {
                Requeue::Immediate => continue,
                requeue => {
                    let record = self
                        .load(id)
                        .await?
                        .ok_or(OrchestratorError::RecordNotFound(id))?;
                    return Ok((requeue, record));
                }
            }
        }
        Err(OrchestratorError::TickLimit(id))
    }

    /// Starts the record over under a new generation.
    ///
    /// Derived state is cleared and any approval from the previous
    /// generation is deleted.
    #[instrument(skip(self), fields(record_id = %id))]
    pub async fn restart(&self, id: Uuid) -> Result<AnalysisRecord, OrchestratorError> {
        let mut record = self
            .load(id)
            .await?
            .ok_or(OrchestratorError::RecordNotFound(id))?;
        let from = record.phase;
        let now = self.clock.now();
        record.reset_for_restart(now);
        let saved = self.save(record).await?;

        if self.approvals.cancel(id).await? {
            debug!("Removed approval from previous generation");
        }

        info!(from = %from, generation = saved.generation, "Analysis record restarted");
        self.metrics.increment_counter(
            PHASE_TRANSITIONS_TOTAL,
            &[
                ("from", from.as_str().to_string()),
                ("to", Phase::Pending.as_str().to_string()),
            ],
            1,
        );
        self.audit
            .log_record_event(
                AuditEventType::RecordRestarted,
                ACTOR,
                id,
                "Analysis record restarted",
                serde_json::json!({ "from": from, "generation": saved.generation }),
                AuditResult::Success,
            )
            .await;
        Ok(saved)
    }

    /// Deletes the record together with its approval.
    #[instrument(skip(self), fields(record_id = %id))]
    pub async fn delete(&self, id: Uuid) -> Result<bool, OrchestratorError> {
        let existed = self.bounded("record delete", self.records.delete(id)).await?;
        let approval_removed = self.approvals.cancel(id).await?;

        if existed {
            info!(approval_removed, "Analysis record deleted");
            self.audit
                .log_record_event(
                    AuditEventType::RecordDeleted,
                    ACTOR,
                    id,
                    "Analysis record deleted",
                    serde_json::json!({ "approval_removed": approval_removed }),
                    AuditResult::Success,
                )
                .await;
        }
        Ok(existed)
    }

    /// Records an operator decision on the approval owned by `parent_id`.
    ///
    /// The parent picks the decision up on its next reconcile.
    pub async fn record_decision(
        &self,
        parent_id: Uuid,
        decision: ApprovalDecision,
        decided_by: &str,
        message: Option<String>,
    ) -> Result<ApprovalRecord, OrchestratorError> {
        let approval = self
            .approvals
            .record_decision(parent_id, decision, decided_by, message, self.clock.now())
            .await?;
        Ok(approval)
    }

    /// Sends the stored hand-off of a `Ready` record to the workflow sink again.
    pub async fn resend_handoff(&self, id: Uuid) -> Result<(), OrchestratorError> {
        let record = self
            .load(id)
            .await?
            .ok_or(OrchestratorError::RecordNotFound(id))?;
        let Some(handoff) = &record.handoff else {
            return Err(OrchestratorError::NoHandoff(id));
        };
        self.emit_handoff(handoff).await
    }

    async fn begin(&self, record: AnalysisRecord, now: DateTime<Utc>) -> Result<Requeue, OrchestratorError> {
        self.transition(record, Phase::Validating, now).await?;
        Ok(Requeue::Immediate)
    }

    async fn validate(&self, record: AnalysisRecord, now: DateTime<Utc>) -> Result<Requeue, OrchestratorError> {
        if let Err(e) = record.request.validate() {
            warn!(error = %e, "Request failed validation");
            return self
                .fail(record, format!("validation failed: {}", e), now)
                .await;
        }
        self.transition(record, Phase::PreparingContext, now).await?;
        Ok(Requeue::Immediate)
    }

    async fn prepare_context(
        &self,
        mut record: AnalysisRecord,
        now: DateTime<Utc>,
    ) -> Result<Requeue, OrchestratorError> {
        let context = match &self.enricher {
            None => EnrichedContext::degraded("context enrichment not configured"),
            Some(enricher) => {
                let query = enricher.query(
                    &record.request.fingerprint,
                    self.enrichment.time_window,
                    self.enrichment.max_results,
                );
                match timeout(self.enrichment.timeout, query).await {
                    Ok(Ok(result)) => EnrichedContext::from(result),
                    Ok(Err(e)) => EnrichedContext::degraded(format!("context enrichment failed: {}", e)),
                    Err(_) => EnrichedContext::degraded(format!(
                        "context enrichment timed out after {}s",
                        self.enrichment.timeout.as_secs()
                    )),
                }
            }
        };

        if context.degraded {
            let note = context.note.clone().unwrap_or_default();
            warn!(note = %note, "Continuing with degraded context");
            self.audit
                .log_record_event(
                    AuditEventType::ContextDegraded,
                    ACTOR,
                    record.id,
                    "Context enrichment degraded",
                    serde_json::json!({ "note": note }),
                    AuditResult::Degraded(note.clone()),
                )
                .await;
        } else {
            debug!(
                similar_incidents = context.similar_incidents.len(),
                quality = ?context.quality_score,
                "Context prepared"
            );
        }

        record.context = Some(context);
        self.transition(record, Phase::Investigating, now).await?;
        Ok(Requeue::Immediate)
    }

    async fn investigate(
        &self,
        mut record: AnalysisRecord,
        now: DateTime<Utc>,
    ) -> Result<Requeue, OrchestratorError> {
        let request = InvestigationRequest {
            fingerprint: record.request.fingerprint.clone(),
            alert: record.request.alert.clone(),
            target: record.request.target.clone(),
            enriched_context: record.context.clone(),
        };
        let mut attempts = record.investigation_attempts.clone();

        match self.investigation.attempt(&request, &mut attempts, now).await {
            AttemptOutcome::Completed(result) => {
                record.investigation_attempts = attempts;
                record.investigation = Some(result);
                self.transition(record, Phase::EvaluatingConfidence, now).await?;
                Ok(Requeue::Immediate)
            }
            AttemptOutcome::RetryAfter(delay) => {
                if attempts != record.investigation_attempts {
                    record.investigation_attempts = attempts;
                    record.updated_at = now;
                    self.save(record).await?;
                }
                Ok(Requeue::After(delay))
            }
            AttemptOutcome::FallbackRequired(reason) => {
                let result = self.historical.find_similar(&record.request, now).await;
                warn!(
                    reason = %reason,
                    recommendations = result.recommendations.len(),
                    confidence = result.confidence,
                    "Using historical fallback"
                );
                self.audit
                    .log_record_event(
                        AuditEventType::InvestigationFallback,
                        ACTOR,
                        record.id,
                        "Investigation replaced by historical fallback",
                        serde_json::json!({
                            "reason": reason.label(),
                            "attempts": attempts.attempts,
                            "last_error": attempts.last_error,
                            "recommendations": result.recommendations.len(),
                            "confidence": result.confidence,
                        }),
                        AuditResult::Degraded(reason.to_string()),
                    )
                    .await;

                record.investigation_attempts = attempts;
                record.investigation = Some(result);
                self.transition(record, Phase::EvaluatingConfidence, now).await?;
                Ok(Requeue::Immediate)
            }
        }
    }

    async fn evaluate_confidence(
        &self,
        mut record: AnalysisRecord,
        now: DateTime<Utc>,
    ) -> Result<Requeue, OrchestratorError> {
        let Some(investigation) = record.investigation.clone() else {
            return self
                .fail(record, "investigation result missing".to_string(), now)
                .await;
        };
        let context = record.context.as_ref();
        let quality = context.filter(|c| !c.degraded).and_then(|c| c.quality_score);
        let historical_rate = context.and_then(EnrichedContext::historical_success_rate);

        let assessment = self.confidence.calculate(
            &investigation,
            investigation.used_fallback,
            quality,
            historical_rate,
        );

        info!(score = assessment.score, level = %assessment.level.as_str(), "Confidence evaluated");
        self.metrics.record_histogram(
            CONFIDENCE_SCORE,
            &[("level", assessment.level.as_str().to_string())],
            assessment.score,
        );
        self.audit
            .log_record_event(
                AuditEventType::ConfidenceEvaluated,
                ACTOR,
                record.id,
                &format!("Confidence {:.1} ({})", assessment.score, assessment.level.as_str()),
                serde_json::to_value(&assessment).unwrap_or(serde_json::Value::Null),
                AuditResult::Success,
            )
            .await;

        record.confidence = Some(assessment);
        self.transition(record, Phase::EvaluatingPolicy, now).await?;
        Ok(Requeue::Immediate)
    }

    async fn evaluate_policy(
        &self,
        mut record: AnalysisRecord,
        now: DateTime<Utc>,
    ) -> Result<Requeue, OrchestratorError> {
        let (Some(investigation), Some(assessment)) =
            (record.investigation.clone(), record.confidence.clone())
        else {
            return self
                .fail(record, "confidence assessment missing".to_string(), now)
                .await;
        };

        let input = DecisionInput::from_record(&record, &assessment, now);
        let policy = self.policy.evaluate(record.id, &input).await;
        let decision = decide(
            &assessment,
            &investigation,
            &policy,
            &self.decision,
            &record.request.alert.environment,
        );
        record.policy = Some(policy);

        match decision {
            Decision::AutoApprove => {
                let provenance = ApprovalProvenance {
                    approval_id: None,
                    decided_by: AUTO_APPROVER.to_string(),
                    decided_at: now,
                    message: None,
                };
                record.outcome = Some(DecisionOutcome::AutoApproved);
                record.message = Some(format!(
                    "auto-approved with confidence {:.1}",
                    assessment.score
                ));
                record.handoff = Some(build_handoff(
                    &record,
                    &investigation,
                    &assessment,
                    DecisionOutcome::AutoApproved,
                    provenance,
                    now,
                ));
                self.complete(record, now).await
            }
            Decision::RequireApproval { reasons } => {
                let approval = self
                    .approvals
                    .ensure_approval_requested(&record, reasons, now)
                    .await?;
                let requeue_after = approval
                    .remaining(now)
                    .min(self.approvals.config().poll_interval_cap);

                record.approval_ref = Some(ApprovalRef {
                    approval_id: approval.id,
                    requested_at: approval.requested_at,
                });
                record.outcome = Some(DecisionOutcome::PendingApproval);
                record.message = Some("awaiting operator approval".to_string());
                let id = record.id;
                if let Err(e) = self.transition(record, Phase::Approving, now).await {
                    if e.is_not_found() && self.approvals.cancel(id).await? {
                        info!("Record deleted while requesting approval, approval removed");
                    }
                    return Err(e);
                }
                self.count_decision(DecisionOutcome::PendingApproval);
                Ok(Requeue::After(requeue_after))
            }
            Decision::Reject(reason) => self.reject(record, reason, now).await,
        }
    }

    async fn await_approval(
        &self,
        mut record: AnalysisRecord,
        now: DateTime<Utc>,
    ) -> Result<Requeue, OrchestratorError> {
        let poll = match self.approvals.poll_decision(record.id, now).await {
            Ok(poll) => poll,
            Err(ApprovalError::NotFound(_)) => {
                return self
                    .fail(record, "approval record missing".to_string(), now)
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        match poll {
            ApprovalPoll::Pending { requeue_after } => Ok(Requeue::After(requeue_after)),
            ApprovalPoll::Approved(approval) => {
                let (Some(investigation), Some(assessment)) =
                    (record.investigation.clone(), record.confidence.clone())
                else {
                    return self
                        .fail(record, "confidence assessment missing".to_string(), now)
                        .await;
                };
                let decided_by = approval.decided_by.clone().unwrap_or_default();
                let provenance = ApprovalProvenance {
                    approval_id: Some(approval.id),
                    decided_by: decided_by.clone(),
                    decided_at: approval.decided_at.unwrap_or(now),
                    message: approval.message.clone(),
                };
                record.outcome = Some(DecisionOutcome::Approved);
                record.message = Some(format!("approved by {}", decided_by));
                record.handoff = Some(build_handoff(
                    &record,
                    &investigation,
                    &assessment,
                    DecisionOutcome::Approved,
                    provenance,
                    now,
                ));
                self.complete(record, now).await
            }
            ApprovalPoll::Rejected(approval) => {
                let by = approval.decided_by.as_deref().unwrap_or("operator");
                let message = match &approval.message {
                    Some(m) => format!("rejected by {}: {}", by, m),
                    None => format!("rejected by {}", by),
                };
                self.reject(
                    record,
                    RejectionReason::new(RejectionKind::OperatorRejected, message),
                    now,
                )
                .await
            }
            ApprovalPoll::TimedOut(approval) => {
                let message = format!(
                    "approval timed out after {}s without a decision",
                    approval.timeout.as_secs()
                );
                self.reject(
                    record,
                    RejectionReason::new(RejectionKind::ApprovalTimedOut, message),
                    now,
                )
                .await
            }
        }
    }

    /// Commits a record that already carries its hand-off, then emits it.
    async fn complete(&self, record: AnalysisRecord, now: DateTime<Utc>) -> Result<Requeue, OrchestratorError> {
        let outcome = record.outcome.unwrap_or(DecisionOutcome::Approved);
        let saved = self.transition(record, Phase::Ready, now).await?;
        self.count_decision(outcome);

        if let Some(handoff) = &saved.handoff {
            // The record stays Ready with its payload; resend_handoff retries.
            if let Err(e) = self.emit_handoff(handoff).await {
                warn!(error = %e, "Hand-off to workflow failed");
            }
        }
        Ok(Requeue::Done)
    }

    async fn reject(
        &self,
        mut record: AnalysisRecord,
        reason: RejectionReason,
        now: DateTime<Utc>,
    ) -> Result<Requeue, OrchestratorError> {
        info!(kind = ?reason.kind, reason = %reason.message, "Remediation rejected");
        record.outcome = Some(DecisionOutcome::Rejected);
        record.message = Some(reason.message.clone());
        record.rejection = Some(reason);
        self.transition(record, Phase::Rejected, now).await?;
        self.count_decision(DecisionOutcome::Rejected);
        Ok(Requeue::Done)
    }

    async fn fail(
        &self,
        mut record: AnalysisRecord,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<Requeue, OrchestratorError> {
        warn!(reason = %message, "Analysis failed");
        record.outcome = Some(DecisionOutcome::Failed);
        record.message = Some(message);
        self.transition(record, Phase::Failed, now).await?;
        self.count_decision(DecisionOutcome::Failed);
        Ok(Requeue::Done)
    }

    async fn emit_handoff(&self, handoff: &RemediationHandoff) -> Result<(), OrchestratorError> {
        let result = match timeout(self.timeouts.workflow, self.workflow.hand_off(handoff)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(OrchestratorError::Handoff(e)),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: "workflow hand-off",
                after: self.timeouts.workflow,
            }),
        };

        let audit_result = match &result {
            Ok(()) => {
                info!(record_id = %handoff.record_id, outcome = handoff.outcome.as_str(), "Remediation handed off");
                AuditResult::Success
            }
            Err(e) => AuditResult::Failure(e.to_string()),
        };
        self.audit
            .log_record_event(
                AuditEventType::HandoffEmitted,
                ACTOR,
                handoff.record_id,
                "Remediation handed to workflow",
                serde_json::json!({
                    "generation": handoff.generation,
                    "outcome": handoff.outcome,
                    "decided_by": handoff.approval.decided_by,
                    "recommendations": handoff.recommendations.len(),
                }),
                audit_result,
            )
            .await;
        result
    }

    /// Moves `record` to `to` and persists it.
    async fn transition(
        &self,
        mut record: AnalysisRecord,
        to: Phase,
        now: DateTime<Utc>,
    ) -> Result<AnalysisRecord, OrchestratorError> {
        let from = record.phase;
        if !can_transition(from, to) {
            return Err(OrchestratorError::InvalidTransition { from, to });
        }

        record.phase = to;
        record.phase_history.push(PhaseEntry {
            phase: to,
            entered_at: now,
            generation: record.generation,
        });
        record.updated_at = now;
        let saved = self.save(record).await?;

        info!(record_id = %saved.id, from = %from, to = %to, "Phase transition");
        self.metrics.increment_counter(
            PHASE_TRANSITIONS_TOTAL,
            &[
                ("from", from.as_str().to_string()),
                ("to", to.as_str().to_string()),
            ],
            1,
        );
        self.audit
            .log_record_event(
                AuditEventType::PhaseTransition,
                ACTOR,
                saved.id,
                &format!("{} -> {}", from, to),
                serde_json::json!({
                    "from": from,
                    "to": to,
                    "generation": saved.generation,
                    "message": saved.message,
                }),
                AuditResult::Success,
            )
            .await;
        Ok(saved)
    }

    fn count_decision(&self, outcome: DecisionOutcome) {
        self.metrics.increment_counter(
            DECISIONS_TOTAL,
            &[("outcome", outcome.as_str().to_string())],
            1,
        );
    }

    async fn load(&self, id: Uuid) -> Result<Option<AnalysisRecord>, OrchestratorError> {
        self.bounded("record read", self.records.get(id)).await
    }

    async fn save(&self, record: AnalysisRecord) -> Result<AnalysisRecord, OrchestratorError> {
        self.bounded("record update", self.records.update(record)).await
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match timeout(self.timeouts.store, fut).await {
            Ok(result) => result.map_err(OrchestratorError::from),
            Err(_) => Err(OrchestratorError::Timeout {
                operation,
                after: self.timeouts.store,
            }),
        }
    }
}

fn build_handoff(
    record: &AnalysisRecord,
    investigation: &InvestigationResult,
    assessment: &ConfidenceAssessment,
    outcome: DecisionOutcome,
    approval: ApprovalProvenance,
    now: DateTime<Utc>,
) -> RemediationHandoff {
    RemediationHandoff {
        record_id: record.id,
        generation: record.generation,
        fingerprint: record.request.fingerprint.clone(),
        target: record.request.target.clone(),
        recommendations: investigation.recommendations.clone(),
        confidence_score: assessment.score,
        confidence_level: assessment.level,
        outcome,
        approval,
        produced_at: now,
    }
}
