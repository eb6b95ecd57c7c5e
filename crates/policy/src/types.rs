//! Policy rule and result types.

use chrono::{DateTime, Utc};
use common::{TenantId, UserId};
use serde::{Deserialize, Serialize};

/// The context a policy is evaluated under.
///
/// Constructed per evaluation call and never persisted. `requested_at` is
/// supplied by the caller so that evaluation itself stays clock-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyContext {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// Name of the operation being gated (e.g. "provision_service").
    pub operation: String,
    pub requested_at: DateTime<Utc>,
}

impl PolicyContext {
    /// Creates a context timestamped now.
    pub fn new(tenant_id: TenantId, user_id: UserId, operation: impl Into<String>) -> Self {
        Self {
            tenant_id,
            user_id,
            operation: operation.into(),
            requested_at: Utc::now(),
        }
    }
}

/// How severely a failing rule affects the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// A failure flips the decision to deny.
    Blocking,
    /// A failure is reported but does not affect admission.
    Advisory,
}

/// Comparison applied between the payload field and the expected value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operator {
    /// Field must equal the expected value exactly.
    Equals,
    /// Field and expected value must both be numeric; field must be greater.
    GreaterThan,
    /// Expected value is an array the field must be a member of.
    InSet,
    /// Expected value is a regular expression the field (a string) must match.
    MatchesPattern,
    /// A registered named predicate decides. Predicates must be
    /// deterministic for versioned decisions to stay reproducible.
    Custom { predicate: String },
}

/// A single declarative rule within a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Rule name, unique within its definition.
    pub name: String,
    /// Dot-notation path into the payload (e.g. "customer.creditScore").
    pub field: String,
    #[serde(flatten)]
    pub operator: Operator,
    /// The value the field is compared against.
    pub expected: serde_json::Value,
    /// Relative importance for the weighted score.
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub severity: Severity,
}

fn default_weight() -> f64 {
    1.0
}

impl PolicyRule {
    /// Creates a blocking rule with weight 1.0.
    pub fn blocking(
        name: impl Into<String>,
        field: impl Into<String>,
        operator: Operator,
        expected: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            operator,
            expected,
            weight: 1.0,
            severity: Severity::Blocking,
        }
    }

    /// Creates an advisory rule with weight 1.0.
    pub fn advisory(
        name: impl Into<String>,
        field: impl Into<String>,
        operator: Operator,
        expected: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            field: field.into(),
            operator,
            expected,
            weight: 1.0,
            severity: Severity::Advisory,
        }
    }

    /// Sets the rule weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// A named, versioned group of rules.
///
/// Definitions are read-only at evaluation time; changing a policy means
/// publishing a new version, never mutating an existing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub name: String,
    /// Semantic version string, e.g. "1.2.0".
    pub version: String,
    pub rules: Vec<PolicyRule>,
}

impl PolicyDefinition {
    /// Creates a definition.
    pub fn new(name: impl Into<String>, version: impl Into<String>, rules: Vec<PolicyRule>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            rules,
        }
    }
}

/// The outcome of evaluating one rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: String,
    pub field: String,
    pub passed: bool,
    pub severity: Severity,
    pub weight: f64,
}

/// The outcome of a policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyResult {
    /// True iff no blocking rule failed. Advisory failures still appear in
    /// `failed_rules` but do not flip this.
    pub admitted: bool,
    /// Every rule that failed, blocking or advisory.
    pub failed_rules: Vec<RuleResult>,
    /// Weighted fraction of passed rules (passed weight / total weight).
    pub score: f64,
    /// The definition version that produced this decision.
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_serialization_flattens_operator() {
        let rule = PolicyRule::blocking(
            "creditScore",
            "creditScore",
            Operator::GreaterThan,
            serde_json::json!(600),
        );
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["op"], "greater_than");
        assert_eq!(json["expected"], 600);
        assert_eq!(json["severity"], "blocking");
    }

    #[test]
    fn custom_operator_carries_predicate_name() {
        let rule = PolicyRule::advisory(
            "region_check",
            "region",
            Operator::Custom {
                predicate: "allowed_region".to_string(),
            },
            serde_json::Value::Null,
        );
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["op"], "custom");
        assert_eq!(json["predicate"], "allowed_region");

        let back: PolicyRule = serde_json::from_value(json).unwrap();
        assert_eq!(back.operator, rule.operator);
    }

    #[test]
    fn weight_defaults_to_one() {
        let rule: PolicyRule = serde_json::from_value(serde_json::json!({
            "name": "r",
            "field": "f",
            "op": "equals",
            "expected": 1,
            "severity": "advisory"
        }))
        .unwrap();
        assert_eq!(rule.weight, 1.0);
    }

    #[test]
    fn definition_round_trips_through_json() {
        let definition = PolicyDefinition::new(
            "residential_basic",
            "1.0.0",
            vec![PolicyRule::blocking(
                "creditScore",
                "creditScore",
                Operator::GreaterThan,
                serde_json::json!(600),
            )],
        );
        let json = serde_json::to_value(&definition).unwrap();
        let back: PolicyDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(back.name, "residential_basic");
        assert_eq!(back.rules.len(), 1);
    }
}
