//! Controller configuration.
//!
//! Loaded from YAML with `${VAR}` substitution. Every field has a default,
//! so an empty file yields a working configuration.

use anyhow::{bail, Context, Result};
use ra_connectors::{
    ConnectorConfig, ContextEnricher, HttpContextEnricher, HttpInvestigationBackend,
    InvestigationBackend, InvestigationClientConfig,
};
use ra_core::clock::duration_secs;
use ra_core::{ConfidenceConfig, HistoricalConfig};
use ra_observability::{init_logging_with_config, LoggingConfig};
use ra_policy::{load_policy_set, substitute_env_vars, ApprovalConfig, RuleEngine};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::decision::DecisionConfig;

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of reconcile workers.
    pub workers: usize,
    pub decision: DecisionConfig,
    pub confidence: ConfidenceConfig,
    pub investigation: InvestigationClientConfig,
    pub historical: HistoricalConfig,
    pub approval: ApprovalConfig,
    pub enrichment: EnrichmentConfig,
    pub timeouts: CallTimeouts,
    pub connectors: ConnectorsConfig,
    pub logging: LoggingConfig,
    /// Policy file; no file means every decision is allowed with basis `no_policy`.
    pub policy_file: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            decision: DecisionConfig::default(),
            confidence: ConfidenceConfig::default(),
            investigation: InvestigationClientConfig::default(),
            historical: HistoricalConfig::default(),
            approval: ApprovalConfig::default(),
            enrichment: EnrichmentConfig::default(),
            timeouts: CallTimeouts::default(),
            connectors: ConnectorsConfig::default(),
            logging: LoggingConfig::default(),
            policy_file: None,
        }
    }
}

/// Context enrichment query settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// How far back the enrichment service looks.
    #[serde(with = "duration_secs")]
    pub time_window: Duration,
    pub max_results: usize,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            time_window: Duration::from_secs(7 * 24 * 60 * 60),
            max_results: 10,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Deadlines for calls not covered by a component's own settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallTimeouts {
    #[serde(with = "duration_secs")]
    pub store: Duration,
    #[serde(with = "duration_secs")]
    pub policy: Duration,
    #[serde(with = "duration_secs")]
    pub workflow: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            store: Duration::from_secs(5),
            policy: Duration::from_secs(5),
            workflow: Duration::from_secs(10),
        }
    }
}

/// HTTP endpoints of the external services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorsConfig {
    pub investigation: Option<ConnectorConfig>,
    pub enrichment: Option<ConnectorConfig>,
    #[serde(with = "duration_secs")]
    pub enrichment_cache_ttl: Duration,
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            investigation: None,
            enrichment: None,
            enrichment_cache_ttl: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    /// Loads configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let contents = substitute_env_vars(contents)?;
        let config: Self =
            serde_yaml::from_str(&contents).context("Failed to parse controller config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        let d = &self.decision;
        if !(0.0..=100.0).contains(&d.manual_review_threshold)
            || !(0.0..=100.0).contains(&d.auto_approve_threshold)
        {
            bail!("decision thresholds must be within [0, 100]");
        }
        if d.manual_review_threshold > d.auto_approve_threshold {
            bail!(
                "manual_review_threshold ({}) exceeds auto_approve_threshold ({})",
                d.manual_review_threshold,
                d.auto_approve_threshold
            );
        }
        for (env, threshold) in &d.environment_thresholds {
            if !(0.0..=100.0).contains(threshold) {
                bail!("auto-approve threshold for '{}' must be within [0, 100]", env);
            }
        }
        if self.approval.timeout.is_zero() {
            bail!("approval timeout must be non-zero");
        }
        if self.investigation.backoff.max_attempts == 0 {
            bail!("investigation retry budget must allow at least one attempt");
        }
        Ok(())
    }

    /// Installs the global tracing subscriber described by `logging`.
    ///
    /// Fails if a subscriber is already installed.
    pub fn init_logging(&self) -> Result<()> {
        init_logging_with_config(&self.logging).context("Failed to initialize logging")
    }

    /// Compiles the configured policy file, if any.
    pub fn load_policy(&self) -> Result<Option<RuleEngine>> {
        let Some(path) = &self.policy_file else {
            return Ok(None);
        };
        let policy_set = load_policy_set(path)
            .with_context(|| format!("Failed to load policy file: {}", path.display()))?;
        Ok(Some(RuleEngine::from_config(&policy_set)?))
    }

    /// HTTP investigation backend, if configured.
    pub fn investigation_backend(&self) -> Result<Option<Arc<dyn InvestigationBackend>>> {
        match &self.connectors.investigation {
            Some(config) => {
                let backend = HttpInvestigationBackend::new(config.clone())
                    .context("Failed to build investigation backend")?;
                Ok(Some(Arc::new(backend)))
            }
            None => Ok(None),
        }
    }

    /// HTTP context enricher, if configured.
    pub fn context_enricher(&self) -> Result<Option<Arc<dyn ContextEnricher>>> {
        match &self.connectors.enrichment {
            Some(config) => {
                let enricher =
                    HttpContextEnricher::new(config.clone(), self.connectors.enrichment_cache_ttl)
                        .context("Failed to build context enricher")?;
                Ok(Some(Arc::new(enricher)))
            }
            None => Ok(None),
        }
    }
}
