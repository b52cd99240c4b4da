//! # ra-observability
//!
//! Logging, metrics, and audit infrastructure for Remediation Analyst.
//!
//! This crate provides structured logging with tracing, a metrics sink
//! capability that components receive by injection, and an audit trail of
//! every decision the engine makes.

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::{AuditEventType, AuditLog, AuditLogEntry, AuditResult};
pub use logging::{init_logging, init_logging_with_config, LoggingConfig};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, RecorderMetrics};
