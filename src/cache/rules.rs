//! Rule-driven TTL policy.
//!
//! Rules are evaluated in declaration order; the first rule whose glob
//! pattern and method set match wins, even when it disables caching.
//! A `ttl = 0` or `enabled = false` rule is a deliberate override that
//! shadows later, broader patterns. Requests matching no rule fall back to
//! the global default TTL and cacheable-method list.

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_TTL_SECS: u64 = 300;

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

fn default_enabled() -> bool {
    true
}

/// Write-time (and header) conditions narrowing a rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    /// Request must carry these header values for the rule to apply.
    pub headers: Option<HashMap<String, String>>,
    /// Response status must be in this set; checked at write time since the
    /// status is only known after the upstream responds.
    pub status_codes: Option<Vec<u16>>,
    /// Serialized response size bounds, checked at write time.
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

/// One line of the TTL policy, as written in `sosta.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheRule {
    /// Glob with `*`; matching is case-sensitive and anchored.
    pub pattern: String,
    /// Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: RuleConditions,
}

/// Outcome of lookup-time resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub cacheable: bool,
    pub ttl: u64,
    /// Index of the winning rule, if any; used for write-time conditions.
    pub rule_index: Option<usize>,
}

impl Decision {
    fn never() -> Self {
        Self {
            cacheable: false,
            ttl: 0,
            rule_index: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid cache rule pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
}

struct CompiledRule {
    regex: Regex,
    rule: CacheRule,
}

/// Resolves TTL and cacheability for a request, and re-checks the winning
/// rule's conditions once the response is known.
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    default_ttl: u64,
    default_methods: Vec<String>,
}

impl RuleEngine {
    /// Compiles every pattern up front; an invalid pattern is a
    /// configuration error caught at startup.
    pub fn new(
        rules: Vec<CacheRule>,
        default_ttl: u64,
        default_methods: Vec<String>,
    ) -> Result<Self, RuleError> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                let pattern = rule.pattern.clone();
                let escaped = regex::escape(&pattern).replace(r"\*", ".*");
                Regex::new(&format!("^{escaped}$"))
                    .map(|regex| CompiledRule { regex, rule })
                    .map_err(|err| RuleError::InvalidPattern {
                        pattern,
                        message: err.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules: compiled,
            default_ttl,
            default_methods,
        })
    }

    pub fn with_defaults(rules: Vec<CacheRule>) -> Result<Self, RuleError> {
        Self::new(rules, default_ttl(), default_methods())
    }

    /// Lookup-time resolution: the first rule matching pattern + method
    /// (+ header conditions) wins; disabled or zero-TTL winners mean
    /// "never cache this".
    pub fn resolve(&self, method: &str, path: &str, headers: &[(String, String)]) -> Decision {
        for (index, compiled) in self.rules.iter().enumerate() {
            if !compiled.regex.is_match(path) {
                continue;
            }
            let rule = &compiled.rule;
            if !rule.methods.is_empty()
                && !rule
                    .methods
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(method))
            {
                continue;
            }
            if !headers_satisfied(&rule.conditions, headers) {
                continue;
            }

            if !rule.enabled || rule.ttl == 0 {
                return Decision::never();
            }
            return Decision {
                cacheable: true,
                ttl: rule.ttl,
                rule_index: Some(index),
            };
        }

        // Fallback: global default TTL, default cacheable methods.
        if self
            .default_methods
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(method))
        {
            Decision {
                cacheable: true,
                ttl: self.default_ttl,
                rule_index: None,
            }
        } else {
            Decision::never()
        }
    }

    /// Whether the winning rule names an explicit status-code list.
    pub fn has_status_condition(&self, decision: &Decision) -> bool {
        decision
            .rule_index
            .and_then(|index| self.rules.get(index))
            .is_some_and(|compiled| compiled.rule.conditions.status_codes.is_some())
    }

    /// Write-time check: status-code and size conditions of the winning
    /// rule, known only after the upstream responded.
    pub fn write_allowed(&self, decision: &Decision, status: u16, size: u64) -> bool {
        let Some(index) = decision.rule_index else {
            return true;
        };
        let Some(compiled) = self.rules.get(index) else {
            return true;
        };
        let conditions = &compiled.rule.conditions;

        if let Some(statuses) = &conditions.status_codes {
            if !statuses.contains(&status) {
                return false;
            }
        }
        if conditions.min_size.is_some_and(|min| size < min) {
            return false;
        }
        if conditions.max_size.is_some_and(|max| size > max) {
            return false;
        }
        true
    }
}

fn headers_satisfied(conditions: &RuleConditions, headers: &[(String, String)]) -> bool {
    let Some(required) = &conditions.headers else {
        return true;
    };
    required.iter().all(|(name, value)| {
        headers
            .iter()
            .any(|(have_name, have_value)| have_name.eq_ignore_ascii_case(name) && have_value == value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, ttl: u64) -> CacheRule {
        CacheRule {
            pattern: pattern.to_string(),
            methods: Vec::new(),
            ttl,
            enabled: true,
            conditions: RuleConditions::default(),
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = RuleEngine::with_defaults(vec![rule("/api/special", 10), rule("*", 300)])
            .expect("engine");

        let special = engine.resolve("GET", "/api/special", &[]);
        assert_eq!(special.ttl, 10);
        assert!(special.cacheable);

        let other = engine.resolve("GET", "/anything/else", &[]);
        assert_eq!(other.ttl, 300);
    }

    #[test]
    fn disabled_rule_shadows_later_broad_rule() {
        let mut never = rule("/api/private/*", 60);
        never.enabled = false;
        let engine =
            RuleEngine::with_defaults(vec![never, rule("*", 300)]).expect("engine");

        let decision = engine.resolve("GET", "/api/private/secrets", &[]);
        assert!(!decision.cacheable);

        let public = engine.resolve("GET", "/api/public", &[]);
        assert!(public.cacheable);
    }

    #[test]
    fn zero_ttl_means_never_cache() {
        let engine =
            RuleEngine::with_defaults(vec![rule("/volatile", 0), rule("*", 300)]).expect("engine");
        assert!(!engine.resolve("GET", "/volatile", &[]).cacheable);
    }

    #[test]
    fn method_mismatch_skips_the_rule() {
        let mut get_only = rule("/api/*", 60);
        get_only.methods = vec!["GET".into()];
        let engine = RuleEngine::with_defaults(vec![get_only]).expect("engine");

        assert!(engine.resolve("get", "/api/items", &[]).cacheable);
        // POST is not a default cacheable method either.
        assert!(!engine.resolve("POST", "/api/items", &[]).cacheable);
    }

    #[test]
    fn fallback_uses_default_ttl_and_methods() {
        let engine = RuleEngine::new(vec![], 120, vec!["GET".into()]).expect("engine");

        let get = engine.resolve("GET", "/whatever", &[]);
        assert!(get.cacheable);
        assert_eq!(get.ttl, 120);
        assert_eq!(get.rule_index, None);

        assert!(!engine.resolve("DELETE", "/whatever", &[]).cacheable);
    }

    #[test]
    fn matching_is_case_sensitive_on_path() {
        let engine = RuleEngine::new(vec![rule("/API/*", 60)], 0, vec!["GET".into()])
            .expect("engine");
        assert!(!engine.resolve("GET", "/api/items", &[]).cacheable);
    }

    #[test]
    fn status_code_condition_applies_at_write_time() {
        let mut only_ok = rule("/api/*", 60);
        only_ok.conditions.status_codes = Some(vec![200]);
        let engine = RuleEngine::with_defaults(vec![only_ok]).expect("engine");

        let decision = engine.resolve("GET", "/api/items", &[]);
        assert!(decision.cacheable);
        assert!(engine.write_allowed(&decision, 200, 100));
        assert!(!engine.write_allowed(&decision, 404, 100));
    }

    #[test]
    fn size_bounds_apply_at_write_time() {
        let mut bounded = rule("/api/*", 60);
        bounded.conditions.min_size = Some(10);
        bounded.conditions.max_size = Some(1_000);
        let engine = RuleEngine::with_defaults(vec![bounded]).expect("engine");

        let decision = engine.resolve("GET", "/api/items", &[]);
        assert!(engine.write_allowed(&decision, 200, 500));
        assert!(!engine.write_allowed(&decision, 200, 5));
        assert!(!engine.write_allowed(&decision, 200, 5_000));
    }

    #[test]
    fn header_condition_gates_the_rule() {
        let mut tenant_only = rule("/api/*", 60);
        tenant_only.conditions.headers =
            Some(HashMap::from([("x-tenant-id".to_string(), "acme".to_string())]));
        let engine = RuleEngine::new(vec![tenant_only], 0, vec!["GET".into()]).expect("engine");

        let with = engine.resolve(
            "GET",
            "/api/items",
            &[("X-Tenant-Id".to_string(), "acme".to_string())],
        );
        assert!(with.cacheable);

        let without = engine.resolve("GET", "/api/items", &[]);
        assert!(!without.cacheable);
    }

    #[test]
    fn fallback_decision_has_no_write_conditions() {
        let engine = RuleEngine::with_defaults(vec![]).expect("engine");
        let decision = engine.resolve("GET", "/x", &[]);
        assert!(engine.write_allowed(&decision, 500, u64::MAX));
    }
}
