//! Connector traits and shared types.
//!
//! The investigation backend and the context-enrichment service are external
//! collaborators. Everything the engine needs from them goes through the two
//! traits defined here.

use async_trait::async_trait;
use ra_core::analysis::{
    AlertMetadata, EnrichedContext, HistoricalIncident, InvestigationResult, Recommendation,
    TargetRef,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in connector operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Server error: status {0}")]
    ServerError(u16),

    #[error("Client error: status {status}: {message}")]
    ClientError { status: u16, message: String },

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Whether a later attempt could succeed.
    ///
    /// Timeouts, connection errors, 5xx and 429 are retryable; 4xx and
    /// malformed responses are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::ConnectionFailed(_)
                | ConnectorError::ServerError(_)
                | ConnectorError::RateLimited(_)
                | ConnectorError::Timeout(_)
                | ConnectorError::RequestFailed(_)
        )
    }

    /// Minimum wait requested by the remote side.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ConnectorError::RateLimited(secs) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::AuthenticationFailed(_) => "auth",
            ConnectorError::ConnectionFailed(_) => "connection",
            ConnectorError::RequestFailed(_) => "request",
            ConnectorError::ServerError(_) => "server",
            ConnectorError::ClientError { .. } => "client",
            ConnectorError::RateLimited(_) => "rate_limited",
            ConnectorError::NotFound(_) => "not_found",
            ConnectorError::InvalidResponse(_) => "invalid_response",
            ConnectorError::ConfigError(_) => "config",
            ConnectorError::Timeout(_) => "timeout",
            ConnectorError::Internal(_) => "internal",
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Authentication configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,
    /// API key sent in a header.
    ApiKey { key: String, header_name: String },
    /// Bearer token.
    BearerToken { token: String },
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::None => f.write_str("None"),
            AuthConfig::ApiKey { header_name, .. } => f
                .debug_struct("ApiKey")
                .field("key", &"[REDACTED]")
                .field("header_name", header_name)
                .finish(),
            AuthConfig::BearerToken { .. } => f
                .debug_struct("BearerToken")
                .field("token", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Client-side rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per period.
    pub max_requests: u32,
    /// Period in seconds.
    pub period_secs: u64,
    /// Maximum burst size.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            period_secs: 60,
            burst_size: 10,
        }
    }
}

/// Configuration for an HTTP connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Connector name/identifier.
    pub name: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Additional headers to include.
    pub headers: HashMap<String, String>,
    /// Optional client-side rate limit.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: "http://localhost:8080".to_string(),
            auth: AuthConfig::None,
            timeout_secs: 30,
            verify_tls: true,
            headers: HashMap::new(),
            rate_limit: None,
        }
    }
}

/// Payload sent to the investigation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationRequest {
    pub fingerprint: String,
    pub alert: AlertMetadata,
    pub target: Option<TargetRef>,
    /// Context gathered before investigation.
    pub enriched_context: Option<EnrichedContext>,
}

/// Body returned by the investigation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationResponse {
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub analysis: String,
    pub confidence: f64,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    #[serde(default)]
    pub tools_used: Vec<String>,
}

impl InvestigationResponse {
    /// Validates ranges and converts into a primary-path result.
    pub fn into_result(self) -> ConnectorResult<InvestigationResult> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ConnectorError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if let Some(bad) = self
            .recommendations
            .iter()
            .find(|r| !(0.0..=1.0).contains(&r.confidence))
        {
            return Err(ConnectorError::InvalidResponse(format!(
                "recommendation {} confidence {} outside [0, 1]",
                bad.action, bad.confidence
            )));
        }

        Ok(InvestigationResult {
            root_cause: self.root_cause,
            analysis: self.analysis,
            confidence: self.confidence,
            recommendations: self.recommendations,
            tools_used: self.tools_used,
            used_fallback: false,
        })
    }
}

/// The external AI-investigation backend.
#[async_trait]
pub trait InvestigationBackend: Send + Sync {
    /// Name for logs and metrics.
    fn name(&self) -> &str;

    /// Investigates an alert. One call, no retries.
    async fn investigate(
        &self,
        request: &InvestigationRequest,
    ) -> ConnectorResult<InvestigationResponse>;
}

/// Result of a context-enrichment query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextQueryResult {
    #[serde(default)]
    pub similar_incidents: Vec<HistoricalIncident>,
    #[serde(default)]
    pub patterns: Vec<String>,
    pub quality_score: f64,
}

impl From<ContextQueryResult> for EnrichedContext {
    fn from(result: ContextQueryResult) -> Self {
        EnrichedContext {
            similar_incidents: result.similar_incidents,
            patterns: result.patterns,
            quality_score: Some(result.quality_score.clamp(0.0, 1.0)),
            degraded: false,
            note: None,
        }
    }
}

/// The context-enrichment query service.
#[async_trait]
pub trait ContextEnricher: Send + Sync {
    /// Name for logs and metrics.
    fn name(&self) -> &str;

    /// Looks up context for a fingerprint over the trailing `time_window`.
    async fn query(
        &self,
        fingerprint: &str,
        time_window: Duration,
        max_results: usize,
    ) -> ConnectorResult<ContextQueryResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ConnectorError::Timeout("slow".into()).is_retryable());
        assert!(ConnectorError::ConnectionFailed("refused".into()).is_retryable());
        assert!(ConnectorError::ServerError(503).is_retryable());
        assert!(ConnectorError::RateLimited(5).is_retryable());

        assert!(!ConnectorError::ClientError {
            status: 422,
            message: "bad alert".into()
        }
        .is_retryable());
        assert!(!ConnectorError::InvalidResponse("not json".into()).is_retryable());
        assert!(!ConnectorError::AuthenticationFailed("401".into()).is_retryable());
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        assert_eq!(
            ConnectorError::RateLimited(7).retry_after(),
            Some(Duration::from_secs(7))
        );
        assert_eq!(ConnectorError::ServerError(500).retry_after(), None);
    }

    #[test]
    fn test_response_validation() {
        let ok = InvestigationResponse {
            root_cause: "oom".into(),
            analysis: "heap".into(),
            confidence: 0.9,
            recommendations: vec![Recommendation::new("restart_pod", 0.8)],
            tools_used: vec!["kubectl".into()],
        };
        let result = ok.clone().into_result().unwrap();
        assert!(!result.used_fallback);
        assert_eq!(result.recommendations.len(), 1);

        let bad = InvestigationResponse {
            confidence: 1.4,
            ..ok.clone()
        };
        assert!(matches!(
            bad.into_result(),
            Err(ConnectorError::InvalidResponse(_))
        ));

        let bad_rec = InvestigationResponse {
            recommendations: vec![Recommendation::new("scale", -0.1)],
            ..ok
        };
        assert!(bad_rec.into_result().is_err());
    }

    #[test]
    fn test_context_conversion_clamps_quality() {
        let context: EnrichedContext = ContextQueryResult {
            quality_score: 1.7,
            ..Default::default()
        }
        .into();
        assert_eq!(context.quality_score, Some(1.0));
        assert!(!context.degraded);
    }

    #[test]
    fn test_auth_debug_redacts_secrets() {
        let auth = AuthConfig::BearerToken {
            token: "s3cr3t".into(),
        };
        assert!(!format!("{:?}", auth).contains("s3cr3t"));
    }
}
