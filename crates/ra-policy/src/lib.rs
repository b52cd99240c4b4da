//! # ra-policy
//!
//! Policy evaluation and approval coordination for Remediation Analyst.
//!
//! Rules are declared in YAML, compiled into a [`RuleEngine`], and consulted
//! through a [`PolicyGate`] that fails open. Decisions that need a human are
//! routed through the [`ApprovalCoordinator`].

pub mod approval;
pub mod config;
pub mod engine;
pub mod rules;

pub use approval::{ApprovalConfig, ApprovalCoordinator, ApprovalError, ApprovalPoll};
pub use config::{load_policy_set, substitute_env_vars, ConfigError, PolicySetConfig};
pub use engine::{DecisionInput, PolicyError, PolicyEvaluator, PolicyGate, RuleEngine};
pub use rules::{PolicyRule, PolicyRuleBuilder, RuleCondition, RuleEffect, TimeWindow};
