//! # ra-connectors
//!
//! Clients for the external services Remediation Analyst depends on.
//!
//! This crate provides the investigation and enrichment traits, their HTTP
//! and in-memory implementations, and the fault-tolerant investigation client
//! (retry budget, exponential backoff, circuit breaker).

pub mod backoff;
pub mod circuit_breaker;
pub mod http;
pub mod investigation;
pub mod mock;
pub mod traits;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use http::{HttpClient, HttpContextEnricher, HttpInvestigationBackend};
pub use investigation::{
    AttemptOutcome, FallbackReason, InvestigationClient, InvestigationClientConfig,
    InvestigationOutcome,
};
pub use mock::{MockContextEnricher, MockInvestigationBackend};
pub use traits::{
    AuthConfig, ConnectorConfig, ConnectorError, ConnectorResult, ContextEnricher,
    ContextQueryResult, InvestigationBackend, InvestigationRequest, InvestigationResponse,
    RateLimitConfig,
};
