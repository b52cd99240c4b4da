//! Policy rule definitions.
//!
//! A rule is a conjunction of conditions evaluated against a
//! [`DecisionInput`] plus the effect applied when all of them hold.

use crate::engine::{DecisionInput, PolicyError};
use chrono::{Datelike, Timelike};
use ra_core::ConfidenceLevel;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A policy rule that can be evaluated against a decision input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique name for this rule.
    pub name: String,
    /// Description of what this rule does.
    pub description: Option<String>,
    /// Conditions that must all be true for this rule to match.
    pub conditions: Vec<RuleCondition>,
    /// Effect when the rule matches.
    pub effect: RuleEffect,
    /// Priority (lower = evaluated first). Only affects the order of
    /// reported violations; every matching rule contributes.
    pub priority: u32,
    /// Whether this rule is enabled.
    pub enabled: bool,
}

impl PolicyRule {
    /// Creates a new policy rule.
    pub fn new(name: impl Into<String>, conditions: Vec<RuleCondition>, effect: RuleEffect) -> Self {
        Self {
            name: name.into(),
            description: None,
            conditions,
            effect,
            priority: 100,
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Checks if this rule matches the given input.
    ///
    /// A rule with no conditions matches everything.
    pub fn matches(&self, input: &DecisionInput) -> Result<bool, PolicyError> {
        if !self.enabled {
            return Ok(false);
        }
        for condition in &self.conditions {
            if !condition.evaluate(input)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Recurring window of hours on selected days, evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start hour (0-23, inclusive).
    pub start_hour: u32,
    /// End hour (0-23, exclusive). A value below `start_hour` wraps midnight.
    pub end_hour: u32,
    /// Days of the week (0=Sunday, 6=Saturday). Empty means every day.
    #[serde(default)]
    pub days_of_week: Vec<u32>,
}

impl TimeWindow {
    pub fn contains(&self, timestamp: &chrono::DateTime<chrono::Utc>) -> bool {
        let hour = timestamp.hour();
        let weekday = timestamp.weekday().num_days_from_sunday();

        if !self.days_of_week.is_empty() && !self.days_of_week.contains(&weekday) {
            return false;
        }

        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // e.g. 22..6
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Conditions that can be used in policy rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCondition {
    /// Confidence score must be at or above the threshold.
    ScoreAtLeast(f64),
    /// Confidence score must be strictly below the threshold.
    ScoreBelow(f64),
    /// Confidence level must be in the given list.
    LevelIn(Vec<ConfidenceLevel>),
    /// At least one recommended action type must be in the list.
    ActionTypeIn(Vec<String>),
    /// Environment must be in the given list.
    EnvironmentIn(Vec<String>),
    /// Namespace must be in the given list.
    NamespaceIn(Vec<String>),
    /// Namespace must match the regex.
    NamespaceMatches(String),
    /// Alert label must equal the value.
    LabelEquals { key: String, value: String },
    /// Evaluation time must fall inside the window.
    InTimeWindow(TimeWindow),
    /// All sub-conditions must match.
    And(Vec<RuleCondition>),
    /// Any sub-condition must match.
    Or(Vec<RuleCondition>),
    /// Sub-condition must NOT match.
    Not(Box<RuleCondition>),
    /// Always true.
    Always,
    /// Always false.
    Never,
}

impl RuleCondition {
    /// Evaluates this condition against the given input.
    pub fn evaluate(&self, input: &DecisionInput) -> Result<bool, PolicyError> {
        let matched = match self {
            RuleCondition::ScoreAtLeast(threshold) => input.score >= *threshold,

            RuleCondition::ScoreBelow(threshold) => input.score < *threshold,

            RuleCondition::LevelIn(levels) => levels.contains(&input.level),

            RuleCondition::ActionTypeIn(types) => {
                input.action_types.iter().any(|a| types.contains(a))
            }

            RuleCondition::EnvironmentIn(envs) => envs.contains(&input.environment),

            RuleCondition::NamespaceIn(namespaces) => input
                .namespace
                .as_ref()
                .is_some_and(|ns| namespaces.contains(ns)),

            RuleCondition::NamespaceMatches(pattern) => {
                let re = Regex::new(pattern).map_err(|e| PolicyError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                input.namespace.as_deref().is_some_and(|ns| re.is_match(ns))
            }

            RuleCondition::LabelEquals { key, value } => input.labels.get(key) == Some(value),

            RuleCondition::InTimeWindow(window) => window.contains(&input.timestamp),

            RuleCondition::And(conditions) => {
                for c in conditions {
                    if !c.evaluate(input)? {
                        return Ok(false);
                    }
                }
                true
            }

            RuleCondition::Or(conditions) => {
                for c in conditions {
                    if c.evaluate(input)? {
                        return Ok(true);
                    }
                }
                false
            }

            RuleCondition::Not(condition) => !condition.evaluate(input)?,

            RuleCondition::Always => true,

            RuleCondition::Never => false,
        };
        Ok(matched)
    }
}

/// Effect to apply when a rule matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    /// Explicitly allow.
    Allow,
    /// Deny with a reason.
    Deny(String),
    /// Demand human review before proceeding.
    RequireApproval,
}

/// Builder for creating policy rules.
pub struct PolicyRuleBuilder {
    name: String,
    description: Option<String>,
    conditions: Vec<RuleCondition>,
    effect: Option<RuleEffect>,
    priority: u32,
    enabled: bool,
}

impl PolicyRuleBuilder {
    /// Creates a new rule builder with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            conditions: vec![],
            effect: None,
            priority: 100,
            enabled: true,
        }
    }

    pub fn description(mut self, desc: &str) -> Self {
        self.description = Some(desc.to_string());
        self
    }

    /// Adds a condition.
    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then_allow(mut self) -> Self {
        self.effect = Some(RuleEffect::Allow);
        self
    }

    pub fn then_deny(mut self, reason: &str) -> Self {
        self.effect = Some(RuleEffect::Deny(reason.to_string()));
        self
    }

    pub fn then_require_approval(mut self) -> Self {
        self.effect = Some(RuleEffect::RequireApproval);
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Builds the policy rule.
    pub fn build(self) -> Result<PolicyRule, &'static str> {
        let effect = self.effect.ok_or("Effect must be specified")?;

        Ok(PolicyRule {
            name: self.name,
            description: self.description,
            conditions: self.conditions,
            effect,
            priority: self.priority,
            enabled: self.enabled,
        })
    }
}
