//! Policy evaluation engine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use store::{PolicyDefinitionRecord, PolicyStore};

use crate::error::{PolicyError, Result};
use crate::path;
use crate::types::{
    Operator, PolicyContext, PolicyDefinition, PolicyResult, PolicyRule, RuleResult, Severity,
};

/// Signature for registered custom predicates.
///
/// Receives the resolved field value, the rule's expected value and the
/// evaluation context. Must be deterministic: the same inputs must always
/// produce the same answer, or pinned-version decisions stop being
/// reproducible.
pub type PredicateFn =
    dyn Fn(&serde_json::Value, &serde_json::Value, &PolicyContext) -> bool + Send + Sync;

/// Which version of a policy to evaluate.
#[derive(Debug, Clone, Copy)]
pub enum VersionSelector<'a> {
    /// The currently active version.
    Latest,
    /// A pinned version, for reproducing past decisions.
    Exact(&'a str),
}

/// Evaluates versioned policy definitions against a context and payload.
///
/// Stateless apart from the predicate registry (populated at construction
/// time) and a cache of compiled patterns; evaluation has no side effects.
pub struct PolicyEngine<S: PolicyStore> {
    store: S,
    predicates: HashMap<String, Arc<PredicateFn>>,
    /// Compiled `MatchesPattern` expressions keyed by pattern source.
    /// Invalid patterns are cached as `None` so they are compiled (and
    /// warned about) once, not on every evaluation.
    pattern_cache: RwLock<HashMap<String, Option<regex::Regex>>>,
}

impl<S: PolicyStore> PolicyEngine<S> {
    /// Creates a new engine with an empty predicate registry.
    pub fn new(store: S) -> Self {
        Self {
            store,
            predicates: HashMap::new(),
            pattern_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a named custom predicate for `Operator::Custom` rules.
    pub fn register_predicate<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&serde_json::Value, &serde_json::Value, &PolicyContext) -> bool
            + Send
            + Sync
            + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    /// Stores a new policy version, optionally activating it.
    pub async fn publish(&self, definition: &PolicyDefinition, activate: bool) -> Result<()> {
        let record = PolicyDefinitionRecord::new(
            definition.name.clone(),
            definition.version.clone(),
            serde_json::to_value(&definition.rules)?,
        );
        self.store.save_definition(record).await?;
        if activate {
            self.store
                .activate_version(&definition.name, &definition.version)
                .await?;
        }
        Ok(())
    }

    /// Makes an already-stored version the active one.
    pub async fn activate(&self, name: &str, version: &str) -> Result<()> {
        Ok(self.store.activate_version(name, version).await?)
    }

    /// Loads and evaluates a policy.
    ///
    /// `VersionSelector::Exact` is the determinism contract: for a pinned
    /// version, the same context and payload always yield the same result.
    #[tracing::instrument(skip(self, context, payload), fields(policy = name))]
    pub async fn evaluate(
        &self,
        name: &str,
        version: VersionSelector<'_>,
        context: &PolicyContext,
        payload: &serde_json::Value,
    ) -> Result<PolicyResult> {
        let record = match version {
            VersionSelector::Latest => self
                .store
                .get_active_definition(name)
                .await?
                .ok_or_else(|| PolicyError::NoActiveVersion(name.to_string()))?,
            VersionSelector::Exact(v) => self
                .store
                .get_definition(name, v)
                .await?
                .ok_or_else(|| PolicyError::NotFound {
                    name: name.to_string(),
                    version: v.to_string(),
                })?,
        };

        let rules: Vec<PolicyRule> = serde_json::from_value(record.rules)?;
        let definition = PolicyDefinition::new(record.name, record.version, rules);
        let result = self.evaluate_definition(&definition, context, payload);

        metrics::counter!("policy_evaluations_total").increment(1);
        if !result.admitted {
            metrics::counter!("policy_denials_total").increment(1);
            tracing::info!(
                policy = name,
                version = %result.version,
                failed = result.failed_rules.len(),
                "policy denied"
            );
        }
        Ok(result)
    }

    /// Evaluates an in-memory definition. Pure and synchronous.
    ///
    /// Every rule is evaluated — no short-circuit on the first failure — so
    /// the caller can present a complete explanation.
    pub fn evaluate_definition(
        &self,
        definition: &PolicyDefinition,
        context: &PolicyContext,
        payload: &serde_json::Value,
    ) -> PolicyResult {
        let mut failed_rules = Vec::new();
        let mut total_weight = 0.0;
        let mut passed_weight = 0.0;
        let mut admitted = true;

        for rule in &definition.rules {
            let passed = self.rule_passes(rule, context, payload);
            total_weight += rule.weight;
            if passed {
                passed_weight += rule.weight;
            } else {
                if rule.severity == Severity::Blocking {
                    admitted = false;
                }
                failed_rules.push(RuleResult {
                    rule: rule.name.clone(),
                    field: rule.field.clone(),
                    passed: false,
                    severity: rule.severity,
                    weight: rule.weight,
                });
            }
        }

        let score = if total_weight > 0.0 {
            passed_weight / total_weight
        } else {
            1.0
        };

        PolicyResult {
            admitted,
            failed_rules,
            score,
            version: definition.version.clone(),
        }
    }

    fn rule_passes(
        &self,
        rule: &PolicyRule,
        context: &PolicyContext,
        payload: &serde_json::Value,
    ) -> bool {
        // A missing target field fails the rule; malformed payloads fail
        // closed instead of erroring.
        let Some(actual) = path::lookup(payload, &rule.field) else {
            return false;
        };

        match &rule.operator {
            Operator::Equals => actual == &rule.expected,
            Operator::GreaterThan => match (actual.as_f64(), rule.expected.as_f64()) {
                (Some(actual), Some(expected)) => actual > expected,
                _ => false,
            },
            Operator::InSet => rule
                .expected
                .as_array()
                .is_some_and(|set| set.contains(actual)),
            Operator::MatchesPattern => {
                let (Some(actual), Some(pattern)) = (actual.as_str(), rule.expected.as_str())
                else {
                    return false;
                };
                match self.compiled_pattern(&rule.name, pattern) {
                    Some(re) => re.is_match(actual),
                    None => false,
                }
            }
            Operator::Custom { predicate } => match self.predicates.get(predicate) {
                Some(f) => f(actual, &rule.expected, context),
                None => {
                    tracing::warn!(
                        rule = %rule.name,
                        predicate = %predicate,
                        "unknown custom predicate, failing closed"
                    );
                    false
                }
            },
        }
    }

    /// Returns the compiled form of a pattern, compiling it at most once.
    /// `None` means the pattern is invalid and the rule fails closed.
    fn compiled_pattern(&self, rule: &str, pattern: &str) -> Option<regex::Regex> {
        {
            let cache = self
                .pattern_cache
                .read()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(pattern) {
                return cached.clone();
            }
        }

        let compiled = match regex::Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(rule = %rule, error = %e, "invalid pattern, failing closed");
                None
            }
        };
        self.pattern_cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{TenantId, UserId};
    use serde_json::json;
    use store::InMemoryStore;

    fn make_context() -> PolicyContext {
        PolicyContext::new(TenantId::new(), UserId::new(), "provision_service")
    }

    fn residential_basic() -> PolicyDefinition {
        PolicyDefinition::new(
            "residential_basic",
            "1.0.0",
            vec![PolicyRule::blocking(
                "creditScore",
                "creditScore",
                Operator::GreaterThan,
                json!(600),
            )],
        )
    }

    #[test]
    fn blocking_failure_denies() {
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result = engine.evaluate_definition(
            &residential_basic(),
            &make_context(),
            &json!({"creditScore": 550}),
        );

        assert!(!result.admitted);
        assert_eq!(result.failed_rules.len(), 1);
        assert_eq!(result.failed_rules[0].rule, "creditScore");
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn passing_payload_admits() {
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result = engine.evaluate_definition(
            &residential_basic(),
            &make_context(),
            &json!({"creditScore": 720}),
        );

        assert!(result.admitted);
        assert!(result.failed_rules.is_empty());
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn advisory_failure_does_not_flip_admission() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![
                PolicyRule::blocking("score", "creditScore", Operator::GreaterThan, json!(600)),
                PolicyRule::advisory("country", "country", Operator::Equals, json!("DE")),
            ],
        );
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result = engine.evaluate_definition(
            &definition,
            &make_context(),
            &json!({"creditScore": 700, "country": "FR"}),
        );

        assert!(result.admitted);
        assert_eq!(result.failed_rules.len(), 1);
        assert_eq!(result.failed_rules[0].rule, "country");
        assert_eq!(result.score, 0.5);
    }

    #[test]
    fn all_rules_are_evaluated_not_short_circuited() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![
                PolicyRule::blocking("a", "a", Operator::Equals, json!(1)),
                PolicyRule::blocking("b", "b", Operator::Equals, json!(2)),
            ],
        );
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result =
            engine.evaluate_definition(&definition, &make_context(), &json!({"a": 0, "b": 0}));

        assert_eq!(result.failed_rules.len(), 2);
    }

    #[test]
    fn missing_field_fails_closed() {
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result =
            engine.evaluate_definition(&residential_basic(), &make_context(), &json!({}));

        assert!(!result.admitted);
        assert_eq!(result.failed_rules[0].rule, "creditScore");
    }

    #[test]
    fn weighted_score() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![
                PolicyRule::advisory("heavy", "a", Operator::Equals, json!(1)).with_weight(3.0),
                PolicyRule::advisory("light", "b", Operator::Equals, json!(1)).with_weight(1.0),
            ],
        );
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result =
            engine.evaluate_definition(&definition, &make_context(), &json!({"a": 1, "b": 0}));

        assert_eq!(result.score, 0.75);
    }

    #[test]
    fn empty_rule_set_admits_with_full_score() {
        let definition = PolicyDefinition::new("p", "1.0.0", vec![]);
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result = engine.evaluate_definition(&definition, &make_context(), &json!({}));

        assert!(result.admitted);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn in_set_operator() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![PolicyRule::blocking(
                "plan",
                "plan",
                Operator::InSet,
                json!(["basic", "premium"]),
            )],
        );
        let engine = PolicyEngine::new(InMemoryStore::new());
        let context = make_context();

        let ok = engine.evaluate_definition(&definition, &context, &json!({"plan": "basic"}));
        assert!(ok.admitted);

        let denied =
            engine.evaluate_definition(&definition, &context, &json!({"plan": "enterprise"}));
        assert!(!denied.admitted);
    }

    #[test]
    fn pattern_operator() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![PolicyRule::blocking(
                "email",
                "email",
                Operator::MatchesPattern,
                json!("^[^@]+@example\\.com$"),
            )],
        );
        let engine = PolicyEngine::new(InMemoryStore::new());
        let context = make_context();

        let ok =
            engine.evaluate_definition(&definition, &context, &json!({"email": "a@example.com"}));
        assert!(ok.admitted);

        let denied =
            engine.evaluate_definition(&definition, &context, &json!({"email": "a@other.org"}));
        assert!(!denied.admitted);
    }

    #[test]
    fn invalid_pattern_fails_closed() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![PolicyRule::blocking(
                "email",
                "email",
                Operator::MatchesPattern,
                json!("("),
            )],
        );
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result =
            engine.evaluate_definition(&definition, &make_context(), &json!({"email": "x"}));
        assert!(!result.admitted);
    }

    #[test]
    fn patterns_are_compiled_once_and_reused() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![
                PolicyRule::blocking(
                    "email",
                    "email",
                    Operator::MatchesPattern,
                    json!("^[^@]+@example\\.com$"),
                ),
                PolicyRule::advisory("bad", "email", Operator::MatchesPattern, json!("(")),
            ],
        );
        let engine = PolicyEngine::new(InMemoryStore::new());
        let context = make_context();

        let first =
            engine.evaluate_definition(&definition, &context, &json!({"email": "a@example.com"}));
        // Second evaluation resolves both patterns from the cache, including
        // the invalid one, which must keep failing closed.
        let second =
            engine.evaluate_definition(&definition, &context, &json!({"email": "a@example.com"}));

        for result in [first, second] {
            assert!(result.admitted);
            assert_eq!(result.failed_rules.len(), 1);
            assert_eq!(result.failed_rules[0].rule, "bad");
        }
        let cache = engine
            .pattern_cache
            .read()
            .unwrap_or_else(|e| e.into_inner());
        assert_eq!(cache.len(), 2);
        assert!(cache["^[^@]+@example\\.com$"].is_some());
        assert!(cache["("].is_none());
    }

    #[test]
    fn custom_predicate_dispatch() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![PolicyRule::blocking(
                "even_units",
                "units",
                Operator::Custom {
                    predicate: "is_even".to_string(),
                },
                serde_json::Value::Null,
            )],
        );
        let mut engine = PolicyEngine::new(InMemoryStore::new());
        engine.register_predicate("is_even", |actual, _expected, _context| {
            actual.as_i64().is_some_and(|n| n % 2 == 0)
        });
        let context = make_context();

        let ok = engine.evaluate_definition(&definition, &context, &json!({"units": 4}));
        assert!(ok.admitted);

        let denied = engine.evaluate_definition(&definition, &context, &json!({"units": 3}));
        assert!(!denied.admitted);
    }

    #[test]
    fn unknown_predicate_fails_closed() {
        let definition = PolicyDefinition::new(
            "p",
            "1.0.0",
            vec![PolicyRule::blocking(
                "r",
                "f",
                Operator::Custom {
                    predicate: "not_registered".to_string(),
                },
                serde_json::Value::Null,
            )],
        );
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result = engine.evaluate_definition(&definition, &make_context(), &json!({"f": 1}));
        assert!(!result.admitted);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let engine = PolicyEngine::new(InMemoryStore::new());
        let context = make_context();
        let payload = json!({"creditScore": 550});
        let definition = residential_basic();

        let first = engine.evaluate_definition(&definition, &context, &payload);
        let second = engine.evaluate_definition(&definition, &context, &payload);

        assert_eq!(first.admitted, second.admitted);
        assert_eq!(first.score, second.score);
        assert_eq!(first.failed_rules.len(), second.failed_rules.len());
    }

    #[tokio::test]
    async fn evaluate_resolves_active_version() {
        let store = InMemoryStore::new();
        let engine = PolicyEngine::new(store);

        let v1 = residential_basic();
        engine.publish(&v1, true).await.unwrap();

        let mut v2 = residential_basic();
        v2.version = "2.0.0".to_string();
        v2.rules[0].expected = json!(500);
        engine.publish(&v2, true).await.unwrap();

        let context = make_context();
        let payload = json!({"creditScore": 550});

        // Active (v2) admits a 550 score; pinned v1 still denies it.
        let latest = engine
            .evaluate("residential_basic", VersionSelector::Latest, &context, &payload)
            .await
            .unwrap();
        assert!(latest.admitted);
        assert_eq!(latest.version, "2.0.0");

        let pinned = engine
            .evaluate(
                "residential_basic",
                VersionSelector::Exact("1.0.0"),
                &context,
                &payload,
            )
            .await
            .unwrap();
        assert!(!pinned.admitted);
    }

    #[tokio::test]
    async fn evaluate_unknown_policy_errors() {
        let engine = PolicyEngine::new(InMemoryStore::new());
        let result = engine
            .evaluate(
                "nope",
                VersionSelector::Latest,
                &make_context(),
                &json!({}),
            )
            .await;
        assert!(matches!(result, Err(PolicyError::NoActiveVersion(_))));

        let result = engine
            .evaluate(
                "nope",
                VersionSelector::Exact("1.0.0"),
                &make_context(),
                &json!({}),
            )
            .await;
        assert!(matches!(result, Err(PolicyError::NotFound { .. })));
    }
}
