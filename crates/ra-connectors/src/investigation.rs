//! Investigation client.
//!
//! Wraps an [`InvestigationBackend`] with retry budgeting, exponential
//! backoff and a circuit breaker. Failures never escape as errors: the
//! caller gets either a result or a [`FallbackReason`] telling it to use
//! historical data instead.
//!
//! Two entry points are provided. [`InvestigationClient::attempt`] performs
//! at most one backend call and returns [`AttemptOutcome::RetryAfter`] when
//! the caller should come back later, which lets a reconciler suspend
//! instead of sleeping. [`InvestigationClient::investigate`] loops over
//! `attempt` and sleeps between calls, for standalone use.

use chrono::{DateTime, Utc};
use ra_core::analysis::{InvestigationAttempts, InvestigationResult};
use ra_core::clock::{add_std, duration_secs, elapsed_between, Clock};
use ra_observability::metrics::{
    MetricsSink, CIRCUIT_STATE, INVESTIGATION_ATTEMPTS_TOTAL, INVESTIGATION_FALLBACKS_TOTAL,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::traits::{ConnectorError, InvestigationBackend, InvestigationRequest};

/// Investigation client tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationClientConfig {
    pub backoff: BackoffPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Deadline for a single backend call.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
}

impl Default for InvestigationClientConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Why the primary investigation path was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum FallbackReason {
    /// The circuit breaker is open.
    CircuitOpen,
    /// The backend rejected the request or answered with garbage.
    Terminal { error: String },
    /// Attempt cap or deadline reached.
    BudgetExhausted { attempts: u32, elapsed_secs: u64 },
}

impl FallbackReason {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FallbackReason::CircuitOpen => "circuit_open",
            FallbackReason::Terminal { .. } => "terminal_error",
            FallbackReason::BudgetExhausted { .. } => "budget_exhausted",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::CircuitOpen => write!(f, "investigation backend circuit open"),
            FallbackReason::Terminal { error } => {
                write!(f, "investigation backend rejected request: {}", error)
            }
            FallbackReason::BudgetExhausted {
                attempts,
                elapsed_secs,
            } => write!(
                f,
                "investigation retry budget exhausted after {} attempt(s) over {}s",
                attempts, elapsed_secs
            ),
        }
    }
}

/// Outcome of a single cooperative attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed(InvestigationResult),
    /// Call again after the given delay.
    RetryAfter(Duration),
    FallbackRequired(FallbackReason),
}

/// Outcome of a full investigation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvestigationOutcome {
    Completed(InvestigationResult),
    FallbackRequired(FallbackReason),
}

/// Fault-tolerant client for the investigation backend.
pub struct InvestigationClient {
    backend: Arc<dyn InvestigationBackend>,
    breaker: CircuitBreaker,
    config: InvestigationClientConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
}

impl InvestigationClient {
    pub fn new(
        backend: Arc<dyn InvestigationBackend>,
        config: InvestigationClientConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            config,
            clock,
            metrics,
        }
    }

    pub fn config(&self) -> &InvestigationClientConfig {
        &self.config
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Performs at most one backend call.
    ///
    /// `attempts` is updated in place with the bookkeeping the caller must
    /// persist between attempts.
    #[instrument(skip(self, request, attempts), fields(fingerprint = %request.fingerprint, attempt = attempts.attempts))]
    pub async fn attempt(
        &self,
        request: &InvestigationRequest,
        attempts: &mut InvestigationAttempts,
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        if let Some(next) = attempts.next_attempt_at {
            if now < next {
                return AttemptOutcome::RetryAfter(elapsed_between(now, next));
            }
        }

        let elapsed = attempts
            .first_attempt_at
            .map(|first| elapsed_between(first, now))
            .unwrap_or(Duration::ZERO);
        if self.config.backoff.is_exhausted(attempts.attempts, elapsed) {
            return self.fallback(FallbackReason::BudgetExhausted {
                attempts: attempts.attempts,
                elapsed_secs: elapsed.as_secs(),
            });
        }

        match self.breaker.try_acquire(now) {
            Admission::Allowed => {}
            Admission::Probe => debug!("Circuit half-open, sending probe"),
            Admission::Rejected { retry_after } => {
                debug!(retry_after_secs = retry_after.as_secs(), "Circuit open, skipping backend");
                return self.fallback(FallbackReason::CircuitOpen);
            }
        }

        let call_index = attempts.attempts;
        attempts.attempts += 1;
        attempts.first_attempt_at.get_or_insert(now);
        attempts.next_attempt_at = None;

        let call = self.backend.investigate(request);
        let response = match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(response) => response,
            Err(_) => Err(ConnectorError::Timeout(format!(
                "no response within {}s",
                self.config.call_timeout.as_secs()
            ))),
        };
        let result = response.and_then(|r| r.into_result());

        match result {
            Ok(result) => {
                let state = self.breaker.record_success(now);
                self.record_attempt("success", state);
                attempts.last_error = None;
                info!(
                    backend = self.backend.name(),
                    confidence = result.confidence,
                    "Investigation completed"
                );
                AttemptOutcome::Completed(result)
            }
            Err(error) => {
                let state = self.breaker.record_failure(now);
                attempts.last_error = Some(error.to_string());

                if !error.is_retryable() {
                    self.record_attempt("terminal_error", state);
                    warn!(error = %error, "Investigation backend returned terminal error");
                    return self.fallback(FallbackReason::Terminal {
                        error: error.to_string(),
                    });
                }
                self.record_attempt("retryable_error", state);

                let elapsed = attempts
                    .first_attempt_at
                    .map(|first| elapsed_between(first, now))
                    .unwrap_or(Duration::ZERO);
                if self.config.backoff.is_exhausted(attempts.attempts, elapsed) {
                    return self.fallback(FallbackReason::BudgetExhausted {
                        attempts: attempts.attempts,
                        elapsed_secs: elapsed.as_secs(),
                    });
                }

                let mut delay = self.config.backoff.delay_for_attempt(call_index);
                if let Some(requested) = error.retry_after() {
                    delay = delay.max(requested.min(self.config.backoff.max_delay));
                }
                attempts.next_attempt_at = add_std(now, delay);
                warn!(
                    error = %error,
                    attempt = attempts.attempts,
                    retry_in_secs = delay.as_secs(),
                    "Investigation attempt failed, will retry"
                );
                AttemptOutcome::RetryAfter(delay)
            }
        }
    }

    /// Runs attempts until completion or fallback, sleeping between them.
    pub async fn investigate(&self, request: &InvestigationRequest) -> InvestigationOutcome {
        let mut attempts = InvestigationAttempts::default();
        loop {
            let now = self.clock.now();
            match self.attempt(request, &mut attempts, now).await {
                AttemptOutcome::Completed(result) => return InvestigationOutcome::Completed(result),
                AttemptOutcome::FallbackRequired(reason) => {
                    return InvestigationOutcome::FallbackRequired(reason)
                }
                AttemptOutcome::RetryAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    attempts.next_attempt_at = None;
                }
            }
        }
    }

    fn record_attempt(&self, outcome: &'static str, state: CircuitState) {
        self.metrics.increment_counter(
            INVESTIGATION_ATTEMPTS_TOTAL,
            &[("outcome", outcome.to_string())],
            1,
        );
        self.metrics.set_gauge(CIRCUIT_STATE, &[], state.as_gauge());
    }

    fn fallback(&self, reason: FallbackReason) -> AttemptOutcome {
        warn!(reason = %reason, "Falling back to historical investigation");
        self.metrics.increment_counter(
            INVESTIGATION_FALLBACKS_TOTAL,
            &[("reason", reason.label().to_string())],
            1,
        );
        AttemptOutcome::FallbackRequired(reason)
    }
}
