//! Policy evaluation: a fixed, ordered list of tagged rules applied to a
//! work descriptor.
//!
//! Evaluation is pure apart from the injected clock used by window rules.
//! Every rule contributes exactly one trace entry, whatever its outcome, so a
//! receipt always shows the full rule list in declaration order.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Timelike;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::error::{PlatformError, Result};

pub const RESOURCE_TOKENS: &str = "tokens";
pub const RESOURCE_PAYLOAD_BYTES: &str = "payload_bytes";

/// Ceiling on canonical payload size admitted through the default rules.
pub const MAX_PAYLOAD_BYTES: u64 = 256 * 1024;

// ---------------------------------------------------------------------------
// Rule definitions (configuration form)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyRule {
    /// Record a per-class limit and block when the estimate exceeds it.
    Quota {
        name: String,
        #[serde(default = "match_all")]
        topic: String,
        resource: String,
        limit: u64,
    },
    /// Identifying fields force local-only routing.
    Pii { name: String, fields: Vec<String> },
    /// Matching topics require a confirmation phrase at commit.
    Commitment { name: String, topic: String },
    /// Matching topics are only admitted between `open_hour` and
    /// `close_hour` (UTC, end exclusive). `open_hour > close_hour` wraps
    /// midnight.
    Window {
        name: String,
        topic: String,
        open_hour: u32,
        close_hour: u32,
    },
}

fn match_all() -> String {
    ".*".to_string()
}

impl PolicyRule {
    pub fn name(&self) -> &str {
        match self {
            PolicyRule::Quota { name, .. }
            | PolicyRule::Pii { name, .. }
            | PolicyRule::Commitment { name, .. }
            | PolicyRule::Window { name, .. } => name,
        }
    }
}

pub fn default_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule::Quota {
            name: "payload_size".into(),
            topic: match_all(),
            resource: RESOURCE_PAYLOAD_BYTES.into(),
            limit: MAX_PAYLOAD_BYTES,
        },
        PolicyRule::Quota {
            name: "chat_tokens".into(),
            topic: "^chat:".into(),
            resource: RESOURCE_TOKENS.into(),
            limit: 4000,
        },
        PolicyRule::Pii {
            name: "pii_local".into(),
            fields: vec!["email".into(), "phone".into(), "cpf".into(), "ssn".into()],
        },
        PolicyRule::Commitment {
            name: "commitment".into(),
            topic: ":commit$".into(),
        },
    ]
}

// ---------------------------------------------------------------------------
// Decision types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    #[default]
    Any,
    LocalOnly,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    NotApplicable,
    Blocked,
    LocalOnly,
    ConfirmRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub rule_name: String,
    pub outcome: Outcome,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub route: Route,
    pub quotas: BTreeMap<String, u64>,
    pub trace: Vec<PolicyEntry>,
    pub blocked: bool,
    pub confirm_required: bool,
    pub outbound_allowed: bool,
}

impl Decision {
    /// The first entry that blocked admission, if any.
    pub fn blocking_entry(&self) -> Option<&PolicyEntry> {
        self.trace.iter().find(|e| e.outcome == Outcome::Blocked)
    }

    /// Convert a blocked decision into the matching error.
    pub fn ensure_admitted(&self) -> Result<()> {
        match self.blocking_entry() {
            Some(entry) => Err(PlatformError::PolicyBlocked {
                rule: entry.rule_name.clone(),
                reason: entry.detail.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// What policy sees of a unit of work.
#[derive(Debug, Clone, Copy)]
pub struct WorkDescriptor<'a> {
    pub tenant: &'a str,
    pub topic: &'a str,
    pub payload: &'a Value,
    pub estimates: &'a BTreeMap<String, u64>,
    pub requested_route: Option<Route>,
}

// ---------------------------------------------------------------------------
// Estimates
// ---------------------------------------------------------------------------

/// Resource estimates derived from the canonical payload bytes.
pub fn estimate(canonical_payload: &[u8]) -> BTreeMap<String, u64> {
    let chars = String::from_utf8_lossy(canonical_payload).chars().count() as u64;
    BTreeMap::from([
        (RESOURCE_PAYLOAD_BYTES.to_string(), canonical_payload.len() as u64),
        (RESOURCE_TOKENS.to_string(), chars.div_ceil(4)),
    ])
}

/// Combine computed and caller-declared estimates, keeping the larger
/// value per resource.
pub fn merge_estimates(
    computed: BTreeMap<String, u64>,
    declared: &BTreeMap<String, u64>,
) -> BTreeMap<String, u64> {
    let mut merged = computed;
    for (k, v) in declared {
        let slot = merged.entry(k.clone()).or_insert(0);
        *slot = (*slot).max(*v);
    }
    merged
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

enum CompiledRule {
    Quota {
        name: String,
        topic: Regex,
        resource: String,
        limit: u64,
    },
    Pii {
        name: String,
        fields: Vec<String>,
    },
    Commitment {
        name: String,
        topic: Regex,
    },
    Window {
        name: String,
        topic: Regex,
        open_hour: u32,
        close_hour: u32,
    },
}

pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
    clock: Arc<dyn Clock>,
}

impl PolicyEngine {
    /// Compile `rules`. Topic patterns are compiled once here.
    pub fn new(rules: &[PolicyRule], clock: Arc<dyn Clock>) -> Result<Self> {
        let compile = |name: &str, pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                PlatformError::InvalidConfig(format!("rule '{name}': bad topic pattern: {e}"))
            })
        };
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            compiled.push(match rule {
                PolicyRule::Quota {
                    name,
                    topic,
                    resource,
                    limit,
                } => CompiledRule::Quota {
                    name: name.clone(),
                    topic: compile(name, topic)?,
                    resource: resource.clone(),
                    limit: *limit,
                },
                PolicyRule::Pii { name, fields } => CompiledRule::Pii {
                    name: name.clone(),
                    fields: fields.iter().map(|f| f.to_lowercase()).collect(),
                },
                PolicyRule::Commitment { name, topic } => CompiledRule::Commitment {
                    name: name.clone(),
                    topic: compile(name, topic)?,
                },
                PolicyRule::Window {
                    name,
                    topic,
                    open_hour,
                    close_hour,
                } => {
                    if *open_hour > 23 || *close_hour > 24 {
                        return Err(PlatformError::InvalidConfig(format!(
                            "rule '{name}': hours must be within 0..=24"
                        )));
                    }
                    CompiledRule::Window {
                        name: name.clone(),
                        topic: compile(name, topic)?,
                        open_hour: *open_hour,
                        close_hour: *close_hour,
                    }
                }
            });
        }
        Ok(Self {
            rules: compiled,
            clock,
        })
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules
            .iter()
            .map(|r| match r {
                CompiledRule::Quota { name, .. }
                | CompiledRule::Pii { name, .. }
                | CompiledRule::Commitment { name, .. }
                | CompiledRule::Window { name, .. } => name.as_str(),
            })
            .collect()
    }

    pub fn evaluate(&self, work: &WorkDescriptor<'_>) -> Decision {
        let mut decision = Decision {
            route: work.requested_route.unwrap_or_default(),
            quotas: BTreeMap::new(),
            trace: Vec::with_capacity(self.rules.len()),
            blocked: false,
            confirm_required: false,
            outbound_allowed: true,
        };

        for rule in &self.rules {
            let entry = match rule {
                CompiledRule::Quota {
                    name,
                    topic,
                    resource,
                    limit,
                } => {
                    if !topic.is_match(work.topic) {
                        entry(name, Outcome::NotApplicable, "topic not covered")
                    } else {
                        let slot = decision.quotas.entry(resource.clone()).or_insert(*limit);
                        *slot = (*slot).min(*limit);
                        match work.estimates.get(resource) {
                            Some(est) if est > limit => {
                                decision.blocked = true;
                                entry(
                                    name,
                                    Outcome::Blocked,
                                    format!("{resource} estimate {est} exceeds limit {limit}"),
                                )
                            }
                            Some(est) => entry(
                                name,
                                Outcome::Pass,
                                format!("{resource} {est} within {limit}"),
                            ),
                            None => entry(
                                name,
                                Outcome::Pass,
                                format!("{resource} limit {limit} recorded"),
                            ),
                        }
                    }
                }
                CompiledRule::Pii { name, fields } => match find_identifying(work.payload, fields, "")
                {
                    Some(path) => {
                        decision.route = Route::LocalOnly;
                        decision.outbound_allowed = false;
                        entry(
                            name,
                            Outcome::LocalOnly,
                            format!("identifying field '{path}' forces local routing"),
                        )
                    }
                    None => entry(name, Outcome::Pass, "no identifying fields"),
                },
                CompiledRule::Commitment { name, topic } => {
                    if topic.is_match(work.topic) {
                        decision.confirm_required = true;
                        entry(
                            name,
                            Outcome::ConfirmRequired,
                            "externally effectful topic requires confirmation",
                        )
                    } else {
                        entry(name, Outcome::NotApplicable, "topic not covered")
                    }
                }
                CompiledRule::Window {
                    name,
                    topic,
                    open_hour,
                    close_hour,
                } => {
                    if !topic.is_match(work.topic) {
                        entry(name, Outcome::NotApplicable, "topic not covered")
                    } else {
                        let hour = self.clock.now().hour();
                        if in_window(hour, *open_hour, *close_hour) {
                            entry(
                                name,
                                Outcome::Pass,
                                format!("hour {hour} inside {open_hour:02}-{close_hour:02} UTC"),
                            )
                        } else {
                            decision.blocked = true;
                            entry(
                                name,
                                Outcome::Blocked,
                                format!("hour {hour} outside {open_hour:02}-{close_hour:02} UTC"),
                            )
                        }
                    }
                }
            };
            decision.trace.push(entry);
        }

        if decision.route == Route::LocalOnly {
            decision.outbound_allowed = false;
        }
        tracing::debug!(
            tenant = work.tenant,
            topic = work.topic,
            blocked = decision.blocked,
            confirm = decision.confirm_required,
            "policy evaluated"
        );
        decision
    }
}

fn entry(rule_name: &str, outcome: Outcome, detail: impl Into<String>) -> PolicyEntry {
    PolicyEntry {
        rule_name: rule_name.to_string(),
        outcome,
        detail: detail.into(),
    }
}

fn in_window(hour: u32, open: u32, close: u32) -> bool {
    if open <= close {
        hour >= open && hour < close
    } else {
        hour >= open || hour < close
    }
}

/// Depth-first search for an object key containing one of `fields`
/// (case-insensitive). Returns the dotted path of the first hit.
fn find_identifying(value: &Value, fields: &[String], prefix: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                let lower = key.to_lowercase();
                if fields.iter().any(|f| lower.contains(f.as_str())) {
                    return Some(path);
                }
                if let Some(hit) = find_identifying(&map[key], fields, &path) {
                    return Some(hit);
                }
            }
            None
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, v)| find_identifying(v, fields, &format!("{prefix}[{i}]"))),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn engine(rules: &[PolicyRule]) -> PolicyEngine {
        PolicyEngine::new(rules, Arc::new(SystemClock)).unwrap()
    }

    fn eval(engine: &PolicyEngine, topic: &str, payload: Value) -> Decision {
        let est = estimate(&crate::canon::canonicalize(&payload, crate::canon::CanonProfile::RAW).unwrap());
        engine.evaluate(&WorkDescriptor {
            tenant: "acme",
            topic,
            payload: &payload,
            estimates: &est,
            requested_route: None,
        })
    }

    #[test]
    fn trace_lists_every_rule_in_order() {
        let e = engine(&default_rules());
        for topic in ["vcx:commit", "chat:ask", "misc"] {
            let d = eval(&e, topic, json!({"x": 1}));
            let names: Vec<&str> = d.trace.iter().map(|t| t.rule_name.as_str()).collect();
            assert_eq!(names, e.rule_names(), "topic {topic}");
        }
    }

    #[test]
    fn identifying_field_forces_local_route() {
        let e = engine(&default_rules());
        let payload = json!({"contact": {"Work_Email": "a@b.c"}});
        let est = BTreeMap::new();
        let d = e.evaluate(&WorkDescriptor {
            tenant: "acme",
            topic: "crm:sync",
            payload: &payload,
            estimates: &est,
            requested_route: Some(Route::Outbound),
        });
        assert_eq!(d.route, Route::LocalOnly);
        assert!(!d.outbound_allowed);
        let pii = d.trace.iter().find(|t| t.rule_name == "pii_local").unwrap();
        assert_eq!(pii.outcome, Outcome::LocalOnly);
        assert!(pii.detail.contains("contact.Work_Email"));
    }

    #[test]
    fn identifying_field_inside_array() {
        let e = engine(&default_rules());
        let d = eval(&e, "crm:sync", json!({"people": [{"name": "x"}, {"ssn": "1"}]}));
        assert_eq!(d.route, Route::LocalOnly);
    }

    #[test]
    fn commit_topic_requires_confirmation() {
        let e = engine(&default_rules());
        assert!(eval(&e, "vcx:commit", json!({})).confirm_required);
        assert!(!eval(&e, "vcx:preview", json!({})).confirm_required);
    }

    #[test]
    fn chat_token_quota_blocks_large_payload() {
        let e = engine(&default_rules());
        let big = "x".repeat(20_000);
        let d = eval(&e, "chat:ask", json!({ "prompt": big }));
        assert!(d.blocked);
        assert_eq!(d.quotas.get(RESOURCE_TOKENS), Some(&4000));
        let err = d.ensure_admitted().unwrap_err();
        assert!(matches!(err, PlatformError::PolicyBlocked { ref rule, .. } if rule == "chat_tokens"));
    }

    #[test]
    fn blocked_rule_does_not_short_circuit() {
        let e = engine(&default_rules());
        let big = "x".repeat(20_000);
        let d = eval(&e, "chat:commit", json!({ "prompt": big, "email": "x" }));
        assert!(d.blocked);
        assert!(d.confirm_required);
        assert_eq!(d.route, Route::LocalOnly);
        assert_eq!(d.trace.len(), 4);
    }

    #[test]
    fn declared_estimates_take_the_max() {
        let computed = BTreeMap::from([("tokens".to_string(), 10), ("payload_bytes".to_string(), 40)]);
        let declared = BTreeMap::from([("tokens".to_string(), 5000), ("gpu_seconds".to_string(), 3)]);
        let merged = merge_estimates(computed, &declared);
        assert_eq!(merged["tokens"], 5000);
        assert_eq!(merged["payload_bytes"], 40);
        assert_eq!(merged["gpu_seconds"], 3);
    }

    #[test]
    fn token_estimate_rounds_up() {
        let est = estimate(b"12345");
        assert_eq!(est[RESOURCE_TOKENS], 2);
        assert_eq!(est[RESOURCE_PAYLOAD_BYTES], 5);
    }

    #[test]
    fn window_rule_follows_injected_clock() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap()));
        let rules = vec![PolicyRule::Window {
            name: "business_hours".into(),
            topic: "^hdl:".into(),
            open_hour: 8,
            close_hour: 18,
        }];
        let e = PolicyEngine::new(&rules, clock.clone()).unwrap();
        assert!(!eval(&e, "hdl:commit", json!({})).blocked);
        clock.advance(chrono::Duration::hours(10));
        let d = eval(&e, "hdl:commit", json!({}));
        assert!(d.blocked);
        assert_eq!(d.trace[0].outcome, Outcome::Blocked);
        assert_eq!(eval(&e, "vcx:commit", json!({})).trace[0].outcome, Outcome::NotApplicable);
    }

    #[test]
    fn overnight_window_wraps() {
        assert!(in_window(23, 22, 6));
        assert!(in_window(3, 22, 6));
        assert!(!in_window(12, 22, 6));
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let rules = vec![PolicyRule::Commitment {
            name: "broken".into(),
            topic: "(".into(),
        }];
        assert!(matches!(
            PolicyEngine::new(&rules, Arc::new(SystemClock)),
            Err(PlatformError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rules_parse_from_yaml() {
        let yaml = r#"
- kind: quota
  name: gpu
  topic: "^science:"
  resource: gpu_seconds
  limit: 600
- kind: commitment
  name: commits
  topic: ":commit$"
"#;
        let rules: Vec<PolicyRule> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name(), "gpu");
    }
}
