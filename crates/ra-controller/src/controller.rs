//! Reconciliation controller.
//!
//! A fixed pool of workers pulls record ids from a queue and hands each to
//! [`DecisionOrchestrator::reconcile`]. Delayed requeues are parked on a timer
//! task and pushed back onto the queue when it fires. Every task stops when
//! shutdown is signalled.

use ra_core::AnalysisRequest;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::orchestrator::{DecisionOrchestrator, Requeue};

/// Delay before retrying a record whose reconcile returned an error.
pub const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// How long shutdown waits for workers to finish their current record.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

struct Shared {
    orchestrator: Arc<DecisionOrchestrator>,
    queue_tx: mpsc::UnboundedSender<Uuid>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Uuid>>,
    /// Ids currently sitting in the queue.
    queued: Mutex<HashSet<Uuid>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Shared {
    fn enqueue(&self, id: Uuid) {
        let newly_queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        if newly_queued && self.queue_tx.send(id).is_err() {
            debug!(record_id = %id, "Queue closed, dropping record");
        }
    }

    fn take(&self, id: Uuid) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Runs reconcile workers over a shared queue.
pub struct Controller {
    shared: Arc<Shared>,
    workers: usize,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(orchestrator: Arc<DecisionOrchestrator>, workers: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                orchestrator,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                queued: Mutex::new(HashSet::new()),
                shutdown_rx,
            }),
            workers: workers.max(1),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<DecisionOrchestrator> {
        &self.shared.orchestrator
    }

    /// Stores a new request and queues it.
    pub async fn submit(&self, request: AnalysisRequest) -> Result<Uuid, OrchestratorError> {
        let id = self.shared.orchestrator.submit(request).await?;
        self.enqueue(id);
        Ok(id)
    }

    /// Queues `id` for reconciliation. A record already in the queue is not
    /// queued twice.
    pub fn enqueue(&self, id: Uuid) {
        self.shared.enqueue(id);
    }

    /// Queues every stored record, e.g. after a process restart.
    pub async fn resync(&self) -> Result<usize, OrchestratorError> {
        let ids = self.shared.orchestrator.list_ids().await?;
        for id in &ids {
            self.shared.enqueue(*id);
        }
        info!(records = ids.len(), "Queued stored records for reconciliation");
        Ok(ids.len())
    }

    /// Spawns the worker pool.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        info!(workers = self.workers, "Starting reconcile workers");
        for worker in 0..self.workers {
            handles.push(tokio::spawn(run_worker(worker, Arc::clone(&self.shared))));
        }
    }

    /// Signals shutdown and waits for the workers to stop.
    pub async fn shutdown(&self) {
        info!("Initiating controller shutdown");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Worker terminated abnormally"),
                Err(_) => warn!("Timeout waiting for worker to stop"),
            }
        }
        info!("Controller shutdown complete");
    }
}

async fn run_worker(worker: usize, shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_rx.clone();
    debug!(worker, "Worker started");

    loop {
        if shared.is_shutting_down() {
            break;
        }
        let next = tokio::select! {
            id = async { shared.queue_rx.lock().await.recv().await } => id,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(id) = next else {
            break;
        };
        shared.take(id);

        let reconcile = shared
            .orchestrator
            .reconcile(id)
            .instrument(ra_observability::record_span!(id, worker = worker));
        match reconcile.await {
            Ok(Requeue::Immediate) => shared.enqueue(id),
            Ok(Requeue::After(delay)) => schedule(&shared, id, delay),
            Ok(Requeue::Done) => debug!(worker, record_id = %id, "Record settled"),
            Err(e) => {
                error!(worker, record_id = %id, error = %e, "Reconcile failed");
                schedule(&shared, id, ERROR_REQUEUE_DELAY);
            }
        }
    }

    debug!(worker, "Worker shutting down");
}

/// Re-queues `id` after `delay` unless shutdown comes first.
fn schedule(shared: &Arc<Shared>, id: Uuid, delay: Duration) {
    let shared = Arc::clone(shared);
    let mut shutdown_rx = shared.shutdown_rx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => shared.enqueue(id),
            _ = shutdown_rx.changed() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::orchestrator::Collaborators;
    use crate::workflow::RecordingWorkflowSink;
    use chrono::{TimeZone, Utc};
    use ra_connectors::{InvestigationResponse, MockInvestigationBackend};
    use ra_core::vector::{FingerprintEmbedder, InMemoryIncidentStore};
    use ra_core::{
        AlertMetadata, InMemoryApprovalStore, InMemoryRecordStore, ManualClock, Phase,
        Recommendation, TargetRef,
    };
    use ra_observability::{AuditLog, NoopMetrics};

    fn controller(sink: Arc<RecordingWorkflowSink>) -> Controller {
        let backend = MockInvestigationBackend::succeeding(InvestigationResponse {
            root_cause: "memory limit too low".into(),
            analysis: "container OOM killed".into(),
            confidence: 0.95,
            recommendations: vec![Recommendation::new("increase_memory_limit", 0.95)],
            tools_used: vec![],
        });
        let collaborators = Collaborators {
            records: Arc::new(InMemoryRecordStore::new()),
            approvals: Arc::new(InMemoryApprovalStore::new()),
            backend: Arc::new(backend),
            enricher: None,
            vector_store: Arc::new(InMemoryIncidentStore::new()),
            embedder: Arc::new(FingerprintEmbedder::new(64)),
            policy: None,
            workflow: sink,
            clock: Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            )),
            metrics: Arc::new(NoopMetrics),
            audit: AuditLog::without_tracing(1000),
        };
        let orchestrator = DecisionOrchestrator::new(&ControllerConfig::default(), collaborators);
        Controller::new(Arc::new(orchestrator), 2)
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

    async fn wait_for_phase(controller: &Controller, id: Uuid, phase: Phase) {
        for _ in 0..200 {
            let record = controller.orchestrator().get(id).await.unwrap().unwrap();
            if record.phase == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("record {} never reached {}", id, phase);
    }

    #[tokio::test]
    async fn test_workers_drive_records_to_completion() {
        let sink = Arc::new(RecordingWorkflowSink::new());
        let controller = controller(sink.clone());
        controller.start();

        let first = controller.submit(request("fp-1")).await.unwrap();
        let second = controller.submit(request("fp-2")).await.unwrap();

        wait_for_phase(&controller, first, Phase::Ready).await;
        wait_for_phase(&controller, second, Phase::Ready).await;
        assert_eq!(sink.len(), 2);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let sink = Arc::new(RecordingWorkflowSink::new());
        let controller = controller(sink);
        let id = Uuid::new_v4();

        controller.enqueue(id);
        controller.enqueue(id);
        assert_eq!(controller.shared.queued.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resync_queues_stored_records() {
        let sink = Arc::new(RecordingWorkflowSink::new());
        let controller = controller(sink.clone());
        let id = controller.orchestrator().submit(request("fp-1")).await.unwrap();

        assert_eq!(controller.resync().await.unwrap(), 1);
        controller.start();
        wait_for_phase(&controller, id, Phase::Ready).await;
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_without_work() {
        let sink = Arc::new(RecordingWorkflowSink::new());
        let controller = controller(sink);
        controller.start();
        controller.shutdown().await;
        assert!(controller.handles.lock().unwrap().is_empty());
    }
}
