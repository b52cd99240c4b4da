//! Integration tests for policy files evaluated through the policy gate.
//!
//! ```bash
//! cargo test --package ra-policy --test policy_set_integration_tests
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::NamedTempFile;
use uuid::Uuid;

use ra_core::{ConfidenceLevel, PolicyBasis};
use ra_observability::{AuditEventType, AuditLog, InMemoryMetrics};
use ra_policy::{load_policy_set, DecisionInput, PolicyGate, RuleEngine};

const POLICY: &str = r#"
rules:
  - name: protect_kube_system
    effect: deny
    reason: "kube-system is never remediated automatically"
    priority: 10
    when:
      namespace_pattern: "^kube-"
  - name: weekend_review
    effect: require_approval
    when:
      environments: [production]
      time_window: { start_hour: 0, end_hour: 24, days_of_week: [0, 6] }
  - name: no_deletes
    effect: deny
    reason: "delete actions are not allowed"
    when:
      actions: [delete_pod]
  - name: disabled_freeze
    effect: deny
    reason: "never applies"
    enabled: false
"#;

// 2024-05-01 is a Wednesday, 2024-05-04 a Saturday.
fn wednesday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap()
}

fn saturday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 4, 14, 0, 0).unwrap()
}

fn input(namespace: &str, environment: &str, actions: &[&str], at: DateTime<Utc>) -> DecisionInput {
    DecisionInput {
        score: 85.0,
        level: ConfidenceLevel::High,
        action_types: actions.iter().map(|a| a.to_string()).collect(),
        environment: environment.to_string(),
        namespace: Some(namespace.to_string()),
        timestamp: at,
        labels: HashMap::new(),
    }
}

fn gate_from_file() -> (PolicyGate, AuditLog) {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(POLICY.as_bytes()).unwrap();
    let policy_set = load_policy_set(file.path()).unwrap();
    let engine = RuleEngine::from_config(&policy_set).unwrap();
    assert_eq!(engine.rules().len(), 4);

    let audit = AuditLog::without_tracing(100);
    let gate = PolicyGate::new(
        Some(Arc::new(engine)),
        Duration::from_secs(5),
        Arc::new(InMemoryMetrics::new()),
        audit.clone(),
    );
    (gate, audit)
}

#[tokio::test]
async fn test_weekday_production_is_allowed() {
    let (gate, _) = gate_from_file();
    let decision = gate
        .evaluate(
            Uuid::new_v4(),
            &input("payments", "production", &["increase_memory_limit"], wednesday()),
        )
        .await;

    assert!(decision.allow);
    assert!(!decision.requires_approval);
    assert_eq!(decision.basis, PolicyBasis::Evaluated);
}

#[tokio::test]
async fn test_weekend_production_requires_review() {
    let (gate, _) = gate_from_file();
    let decision = gate
        .evaluate(
            Uuid::new_v4(),
            &input("payments", "production", &["increase_memory_limit"], saturday()),
        )
        .await;

    assert!(decision.allow);
    assert!(decision.requires_approval);
    assert!(decision.overrides_confidence);
    assert_eq!(decision.matched_rules, vec!["weekend_review".to_string()]);
}

#[tokio::test]
async fn test_every_matching_deny_rule_is_reported() {
    let (gate, audit) = gate_from_file();
    let record_id = Uuid::new_v4();
    let decision = gate
        .evaluate(record_id, &input("kube-system", "staging", &["delete_pod"], wednesday()))
        .await;

    assert!(!decision.allow);
    assert_eq!(decision.violations.len(), 2);
    assert!(decision.violations[0].starts_with("protect_kube_system"));
    assert!(decision.violation_summary().contains("delete actions are not allowed"));
    assert!(!decision
        .violations
        .iter()
        .any(|v| v.contains("never applies")));

    let denied = audit.get_entries_by_type(AuditEventType::PolicyDenied).await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].record_id, Some(record_id));
}

#[tokio::test]
async fn test_missing_policy_set_allows_with_no_policy_basis() {
    let audit = AuditLog::without_tracing(100);
    let gate = PolicyGate::new(
        None,
        Duration::from_secs(5),
        Arc::new(InMemoryMetrics::new()),
        audit.clone(),
    );

    let decision = gate
        .evaluate(Uuid::new_v4(), &input("payments", "production", &[], wednesday()))
        .await;

    assert!(decision.allow);
    assert_eq!(decision.basis, PolicyBasis::NoPolicy);
    assert_eq!(
        audit
            .get_entries_by_type(AuditEventType::PolicyNotConfigured)
            .await
            .len(),
        1
    );
}

#[test]
fn test_invalid_pattern_is_rejected_at_load() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
rules:
  - name: broken
    effect: deny
    reason: "bad pattern"
    when:
      namespace_pattern: "(["
"#,
    )
    .unwrap();

    assert!(load_policy_set(file.path()).is_err());
}
