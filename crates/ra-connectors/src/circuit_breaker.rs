//! Circuit breaker for the investigation backend.
//!
//! `Closed` admits every call. After `failure_threshold` consecutive failures
//! inside `window` the breaker opens and rejects calls for `cool_down`. The
//! first call after the cool-down is admitted as a single probe
//! (`HalfOpen`): success closes the breaker, failure reopens it.
//!
//! The lock is held only while admitting or recording, never across the
//! backend call itself.

use chrono::{DateTime, Utc};
use ra_core::clock::{add_std, duration_secs, elapsed_between};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge value: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Breaker tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Failures older than this no longer count.
    #[serde(with = "duration_secs")]
    pub window: Duration,
    /// How long the breaker stays open before admitting a probe.
    #[serde(with = "duration_secs")]
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cool_down: Duration::from_secs(30),
        }
    }
}

/// Answer to a request for permission to call the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, call normally.
    Allowed,
    /// Breaker half-open, this call is the probe.
    Probe,
    /// Breaker open; `retry_after` until the next probe may be attempted.
    Rejected { retry_after: Duration },
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_started_at: Option<DateTime<Utc>>,
}

/// Thread-safe circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_started_at: None,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, as last recorded.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Asks permission to call the backend at `now`.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let reopen_at = inner
                    .opened_at
                    .and_then(|opened| add_std(opened, self.config.cool_down));
                match reopen_at {
                    Some(at) if now < at => Admission::Rejected {
                        retry_after: elapsed_between(now, at),
                    },
                    _ => {
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_started_at = Some(now);
                        Admission::Probe
                    }
                }
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back must not wedge the breaker.
                let stale_at = inner
                    .probe_started_at
                    .and_then(|started| add_std(started, self.config.cool_down));
                match stale_at {
                    Some(at) if now < at => Admission::Rejected {
                        retry_after: elapsed_between(now, at),
                    },
                    _ => {
                        inner.probe_started_at = Some(now);
                        Admission::Probe
                    }
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, _now: DateTime<Utc>) -> CircuitState {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.probe_started_at = None;
        inner.state
    }

    /// Records a failed call.
    pub fn record_failure(&self, now: DateTime<Utc>) -> CircuitState {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_started_at = None;
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                while let Some(oldest) = inner.failures.front() {
                    if elapsed_between(*oldest, now) > self.config.window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                }
            }
        }
        inner.state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
