//! YAML loader for policy sets.
//!
//! A policy file lists rules; each rule has a `when` block whose fields are
//! ANDed together, an `effect`, and for deny rules a `reason`:
//!
//! ```yaml
//! rules:
//!   - name: protect_kube_system
//!     effect: deny
//!     reason: "kube-system is never remediated automatically"
//!     when:
//!       namespace_pattern: "^kube-"
//!   - name: weekend_review
//!     effect: require_approval
//!     when:
//!       environments: [production]
//!       time_window: { start_hour: 0, end_hour: 24, days_of_week: [0, 6] }
//! ```

use crate::engine::RuleEngine;
use crate::rules::{PolicyRule, RuleCondition, RuleEffect, TimeWindow};
use ra_core::ConfidenceLevel;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid regex pattern '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Top-level policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySetConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// One rule as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub effect: EffectConfig,
    /// Required for `deny`.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub when: ConditionConfig,
}

fn default_priority() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectConfig {
    Allow,
    Deny,
    RequireApproval,
}

/// Condition block; every populated field must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub score_at_least: Option<f64>,
    #[serde(default)]
    pub score_below: Option<f64>,
    #[serde(default)]
    pub levels: Vec<ConfidenceLevel>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub namespace_pattern: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    /// Matches when any of the nested blocks matches.
    #[serde(default)]
    pub any: Vec<ConditionConfig>,
    /// Matches when the nested block does not.
    #[serde(default)]
    pub not: Option<Box<ConditionConfig>>,
}

impl ConditionConfig {
    /// Converts the block into conditions that are ANDed by the rule.
    pub fn to_conditions(&self) -> Vec<RuleCondition> {
        let mut conditions = Vec::new();

        if let Some(threshold) = self.score_at_least {
            conditions.push(RuleCondition::ScoreAtLeast(threshold));
        }
        if let Some(threshold) = self.score_below {
            conditions.push(RuleCondition::ScoreBelow(threshold));
        }
        if !self.levels.is_empty() {
            conditions.push(RuleCondition::LevelIn(self.levels.clone()));
        }
        if !self.actions.is_empty() {
            conditions.push(RuleCondition::ActionTypeIn(self.actions.clone()));
        }
        if !self.environments.is_empty() {
            conditions.push(RuleCondition::EnvironmentIn(self.environments.clone()));
        }
        if !self.namespaces.is_empty() {
            conditions.push(RuleCondition::NamespaceIn(self.namespaces.clone()));
        }
        if let Some(pattern) = &self.namespace_pattern {
            conditions.push(RuleCondition::NamespaceMatches(pattern.clone()));
        }
        let mut labels: Vec<_> = self.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            conditions.push(RuleCondition::LabelEquals {
                key: key.clone(),
                value: value.clone(),
            });
        }
        if let Some(window) = &self.time_window {
            conditions.push(RuleCondition::InTimeWindow(window.clone()));
        }
        if !self.any.is_empty() {
            conditions.push(RuleCondition::Or(
                self.any
                    .iter()
                    .map(|c| RuleCondition::And(c.to_conditions()))
                    .collect(),
            ));
        }
        if let Some(inner) = &self.not {
            conditions.push(RuleCondition::Not(Box::new(RuleCondition::And(
                inner.to_conditions(),
            ))));
        }

        conditions
    }

    fn validate(&self, rule: &str) -> Result<(), ConfigError> {
        if let Some(pattern) = &self.namespace_pattern {
            validate_regex(pattern)?;
        }
        for threshold in [self.score_at_least, self.score_below].into_iter().flatten() {
            if !(0.0..=100.0).contains(&threshold) {
                return Err(ConfigError::InvalidValue(format!(
                    "rule '{}': score threshold {} outside [0, 100]",
                    rule, threshold
                )));
            }
        }
        if let Some(window) = &self.time_window {
            if window.start_hour > 23 || window.end_hour > 24 {
                return Err(ConfigError::InvalidValue(format!(
                    "rule '{}': time window hours must be within 0-24",
                    rule
                )));
            }
            if window.days_of_week.iter().any(|d| *d > 6) {
                return Err(ConfigError::InvalidValue(format!(
                    "rule '{}': days_of_week must be within 0-6",
                    rule
                )));
            }
        }
        for nested in &self.any {
            nested.validate(rule)?;
        }
        if let Some(inner) = &self.not {
            inner.validate(rule)?;
        }
        Ok(())
    }
}

impl RuleConfig {
    pub fn to_rule(&self) -> Result<PolicyRule, ConfigError> {
        let effect = match self.effect {
            EffectConfig::Allow => RuleEffect::Allow,
            EffectConfig::RequireApproval => RuleEffect::RequireApproval,
            EffectConfig::Deny => {
                let reason = self
                    .reason
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField(format!("{}.reason", self.name)))?;
                RuleEffect::Deny(reason)
            }
        };

        let mut rule = PolicyRule::new(self.name.clone(), self.when.to_conditions(), effect)
            .with_priority(self.priority);
        rule.description = self.description.clone();
        rule.enabled = self.enabled;
        Ok(rule)
    }
}

impl PolicySetConfig {
    /// Parses and validates a policy set from YAML text, substituting
    /// `${VAR}` references first.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let config: PolicySetConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the loaded configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::MissingField("rules[].name".to_string()));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            if rule.effect == EffectConfig::Deny && rule.reason.is_none() {
                return Err(ConfigError::MissingField(format!("{}.reason", rule.name)));
            }
            rule.when.validate(&rule.name)?;
        }
        Ok(())
    }

    pub fn to_rules(&self) -> Result<Vec<PolicyRule>, ConfigError> {
        self.rules.iter().map(RuleConfig::to_rule).collect()
    }
}

impl RuleEngine {
    /// Compiles a validated policy set into an engine.
    pub fn from_config(config: &PolicySetConfig) -> Result<Self, ConfigError> {
        Ok(RuleEngine::new(config.to_rules()?))
    }
}

/// Loads and validates a policy set from a YAML file.
pub fn load_policy_set(path: &Path) -> Result<PolicySetConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    PolicySetConfig::from_yaml_str(&content)
}

/// Replaces `${VAR_NAME}` with the value of the environment variable.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").map_err(|e| {
        ConfigError::InvalidRegex {
            pattern: "env var".to_string(),
            message: e.to_string(),
        }
    })?;
    let mut result = input.to_string();
    let mut errors = Vec::new();

    for cap in re.captures_iter(input) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        match env::var(var_name.as_str()) {
            Ok(value) => result = result.replace(full_match.as_str(), &value),
            Err(_) => errors.push(var_name.as_str().to_string()),
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::EnvVarNotFound(errors.join(", ")));
    }

    Ok(result)
}

fn validate_regex(pattern: &str) -> Result<(), ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidRegex {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DecisionInput;
    use chrono::{TimeZone, Utc};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_valid_yaml() -> &'static str {
        r#"
rules:
  - name: protect_kube_system
    description: "System namespaces are never remediated automatically"
    effect: deny
    reason: "kube-system is protected"
    priority: 10
    when:
      namespace_pattern: "^kube-"
  - name: low_confidence_production
    effect: deny
    reason: "score too low for production"
    when:
      environments: [production]
      score_below: 50
  - name: night_review
    effect: require_approval
    when:
      environments: [production]
      time_window:
        start_hour: 22
        end_hour: 6
  - name: team_exemption
    effect: allow
    enabled: false
    when:
      labels:
        team: sre
"#
    }

    fn input(namespace: &str, score: f64, hour: u32) -> DecisionInput {
        DecisionInput {
            score,
            level: ConfidenceLevel::from_score(score),
            action_types: vec![],
            environment: "production".into(),
            namespace: Some(namespace.into()),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 4, hour, 0, 0).unwrap(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_load_valid_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(create_valid_yaml().as_bytes()).unwrap();

        let config = load_policy_set(file.path()).unwrap();
        assert_eq!(config.rules.len(), 4);
        assert_eq!(config.rules[0].effect, EffectConfig::Deny);
        assert!(!config.rules[3].enabled);
    }

    #[test]
    fn test_engine_from_config() {
        let config = PolicySetConfig::from_yaml_str(create_valid_yaml()).unwrap();
        let engine = RuleEngine::from_config(&config).unwrap();
        assert_eq!(engine.rules()[0].name, "protect_kube_system");

        let denied = engine.evaluate_rules(&input("kube-system", 95.0, 12)).unwrap();
        assert!(!denied.allow);
        assert_eq!(denied.violations.len(), 1);

        let review = engine.evaluate_rules(&input("payments", 95.0, 23)).unwrap();
        assert!(review.allow);
        assert!(review.requires_approval);

        let clean = engine.evaluate_rules(&input("payments", 95.0, 12)).unwrap();
        assert!(clean.allow);
        assert!(!clean.requires_approval);
    }

    #[test]
    fn test_missing_file() {
        let result = load_policy_set(Path::new("/nonexistent/policy.yaml"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = PolicySetConfig::from_yaml_str("rules: [ { name: x, effect: explode } ]");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_regex_pattern() {
        let yaml = r#"
rules:
  - name: bad
    effect: deny
    reason: "bad"
    when:
      namespace_pattern: "[invalid(regex"
"#;
        let result = PolicySetConfig::from_yaml_str(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidRegex { .. })));
    }

    #[test]
    fn test_nested_invalid_regex_pattern() {
        let yaml = r#"
rules:
  - name: bad
    effect: require_approval
    when:
      any:
        - namespace_pattern: "(unclosed"
"#;
        let result = PolicySetConfig::from_yaml_str(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidRegex { .. })));
    }

    #[test]
    fn test_deny_requires_reason() {
        let yaml = r#"
rules:
  - name: no_reason
    effect: deny
"#;
        let result = PolicySetConfig::from_yaml_str(yaml);
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_duplicate_rule_names() {
        let yaml = r#"
rules:
  - name: twice
    effect: allow
  - name: twice
    effect: allow
"#;
        let result = PolicySetConfig::from_yaml_str(yaml);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("RA_POLICY_TEST_NAMESPACE", "payments");
        let yaml = r#"
rules:
  - name: protect
    effect: deny
    reason: "protected"
    when:
      namespaces: ["${RA_POLICY_TEST_NAMESPACE}"]
"#;
        let config = PolicySetConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.rules[0].when.namespaces, vec!["payments".to_string()]);
        env::remove_var("RA_POLICY_TEST_NAMESPACE");
    }

    #[test]
    fn test_missing_env_var() {
        let result = substitute_env_vars("namespace: ${RA_POLICY_TEST_DOES_NOT_EXIST}");
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(_))));
    }

    #[test]
    fn test_any_and_not_blocks() {
        let when = ConditionConfig {
            any: vec![
                ConditionConfig {
                    namespaces: vec!["a".into()],
                    ..Default::default()
                },
                ConditionConfig {
                    namespaces: vec!["b".into()],
                    ..Default::default()
                },
            ],
            not: Some(Box::new(ConditionConfig {
                score_below: Some(60.0),
                ..Default::default()
            })),
            ..Default::default()
        };
        let rule = PolicyRule::new("combo", when.to_conditions(), RuleEffect::RequireApproval);

        assert!(rule.matches(&input("b", 70.0, 12)).unwrap());
        assert!(!rule.matches(&input("b", 40.0, 12)).unwrap());
        assert!(!rule.matches(&input("c", 70.0, 12)).unwrap());
    }
}
