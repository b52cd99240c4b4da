//! In-memory backends for tests and local runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::traits::{
    ConnectorError, ConnectorResult, ContextEnricher, ContextQueryResult, InvestigationBackend,
    InvestigationRequest, InvestigationResponse,
};

/// Scripted investigation backend.
///
/// Queued responses are returned first, in order; after that every call gets
/// the default response.
#[derive(Debug)]
pub struct MockInvestigationBackend {
    name: String,
    queued: Mutex<VecDeque<ConnectorResult<InvestigationResponse>>>,
    default: Mutex<ConnectorResult<InvestigationResponse>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<InvestigationRequest>>,
}

impl MockInvestigationBackend {
    fn with_default(default: ConnectorResult<InvestigationResponse>) -> Self {
        Self {
            name: "mock-investigation".to_string(),
            queued: Mutex::new(VecDeque::new()),
            default: Mutex::new(default),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answers with `response`.
    pub fn succeeding(response: InvestigationResponse) -> Self {
        Self::with_default(Ok(response))
    }

    /// Always fails with `error`.
    pub fn failing(error: ConnectorError) -> Self {
        Self::with_default(Err(error))
    }

    /// Queues a response ahead of the default.
    pub fn push_response(&self, response: InvestigationResponse) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(response));
    }

    /// Queues an error ahead of the default.
    pub fn push_error(&self, error: ConnectorError) {
        self.queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(error));
    }

    /// Replaces the default answer.
    pub fn set_default(&self, result: ConnectorResult<InvestigationResponse>) {
        *self.default.lock().unwrap_or_else(PoisonError::into_inner) = result;
    }

    /// Delays every answer, to exercise call timeouts.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<InvestigationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl InvestigationBackend for MockInvestigationBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn investigate(
        &self,
        request: &InvestigationRequest,
    ) -> ConnectorResult<InvestigationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match queued {
            Some(result) => result,
            None => self
                .default
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Context enricher with a fixed answer.
#[derive(Debug)]
pub struct MockContextEnricher {
    result: Mutex<ConnectorResult<ContextQueryResult>>,
    calls: AtomicUsize,
}

impl MockContextEnricher {
    pub fn returning(result: ContextQueryResult) -> Self {
        Self {
            result: Mutex::new(Ok(result)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: ConnectorError) -> Self {
        Self {
            result: Mutex::new(Err(error)),
            calls: AtomicUsize::new(0),
        }
    }

    /// Enricher that knows nothing.
    pub fn empty() -> Self {
        Self::returning(ContextQueryResult::default())
    }

    pub fn set_result(&self, result: ConnectorResult<ContextQueryResult>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = result;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContextEnricher for MockContextEnricher {
    fn name(&self) -> &str {
        "mock-enricher"
    }

    async fn query(
        &self,
        _fingerprint: &str,
        _time_window: Duration,
        max_results: usize,
    ) -> ConnectorResult<ContextQueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut result = self
            .result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        result.similar_incidents.truncate(max_results);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ra_core::analysis::AlertMetadata;

    fn request() -> InvestigationRequest {
        InvestigationRequest {
            fingerprint: "fp".into(),
            alert: AlertMetadata::default(),
            target: None,
            enriched_context: None,
        }
    }

    fn response(confidence: f64) -> InvestigationResponse {
        InvestigationResponse {
            root_cause: "rc".into(),
            analysis: "an".into(),
            confidence,
            recommendations: vec![],
            tools_used: vec![],
        }
    }

    #[tokio::test]
    async fn test_queued_then_default() {
        let backend = MockInvestigationBackend::succeeding(response(0.9));
        backend.push_error(ConnectorError::ServerError(500));
        backend.push_response(response(0.4));

        assert!(backend.investigate(&request()).await.is_err());
        assert_eq!(backend.investigate(&request()).await.unwrap().confidence, 0.4);
        assert_eq!(backend.investigate(&request()).await.unwrap().confidence, 0.9);
        assert_eq!(backend.call_count(), 3);
        assert_eq!(backend.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_enricher_truncates_and_fails() {
        let enricher = MockContextEnricher::empty();
        let result = enricher.query("fp", Duration::from_secs(3600), 5).await.unwrap();
        assert!(result.similar_incidents.is_empty());

        enricher.set_result(Err(ConnectorError::ConnectionFailed("down".into())));
        assert!(enricher.query("fp", Duration::from_secs(3600), 5).await.is_err());
        assert_eq!(enricher.call_count(), 2);
    }
}
