//! Two-phase intent resolution.
//!
//! `propose` turns a draft into a validated plan preview (or a repair
//! request while attempts remain); `commit` confirms a live preview and
//! enqueues it. `submit` runs the same plan and policy path for a complete
//! work unit without the repair loop.
//!
//! Previews live only in memory and expire after the configured TTL. A
//! preview whose plan was already committed keeps resolving to its commit
//! record through the queue, so only unconsumed previews can expire.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canon::{self, CanonProfile};
use crate::clock::Clock;
use crate::error::{PlatformError, Result};
use crate::policy::{self, Decision, PolicyEngine, PolicyEntry, Route, WorkDescriptor};
use crate::queue::LeaseQueue;
use crate::registry::{ActionSpec, FieldIssue, SchemaRegistry};
use crate::types::{CommitResponse, WorkUnit};

/// Failing drafts get this many repair rounds before SCHEMA_INVALID.
pub const MAX_REPAIR_ATTEMPTS: u32 = 2;

pub const PLAN_TYPE: &str = "veriq.plan/v1";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub tenant: String,
    pub schema_id: String,
    /// Latest registered version when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    pub payload: Value,
    /// Zero-based repair round, supplied by the caller.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_route: Option<Route>,
    #[serde(default)]
    pub estimates: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    DraftReceived,
    Repairing,
    Validated,
    Proposed,
    Committed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub attempt: u32,
    pub missing: Vec<String>,
    pub invalid: Vec<FieldIssue>,
    pub hints: Vec<String>,
    /// Repair rounds left after this one.
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPreview {
    pub plan_hash: String,
    pub dag: Value,
    pub tenant: String,
    pub topic: String,
    pub schema_id: String,
    pub schema_version: u32,
    pub policy_trace: Vec<PolicyEntry>,
    pub quotas: BTreeMap<String, u64>,
    pub estimates: BTreeMap<String, u64>,
    pub route: Route,
    pub outbound_allowed: bool,
    pub confirm_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_phrase: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProposeOutcome {
    Proposed {
        state: IntentState,
        preview: PlanPreview,
    },
    RepairRequired {
        state: IntentState,
        repair_request: RepairRequest,
    },
}

impl ProposeOutcome {
    pub fn preview(&self) -> Option<&PlanPreview> {
        match self {
            ProposeOutcome::Proposed { preview, .. } => Some(preview),
            ProposeOutcome::RepairRequired { .. } => None,
        }
    }

    pub fn repair_request(&self) -> Option<&RepairRequest> {
        match self {
            ProposeOutcome::RepairRequired { repair_request, .. } => Some(repair_request),
            ProposeOutcome::Proposed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub plan_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_phrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idem_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub work: WorkUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_phrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_route: Option<Route>,
    #[serde(default)]
    pub estimates: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Preview cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedPlan {
    preview: PlanPreview,
    work: WorkUnit,
    decision: Decision,
}

#[derive(Debug, Default)]
struct PreviewCache {
    entries: Mutex<HashMap<String, CachedPlan>>,
}

impl PreviewCache {
    fn insert(&self, plan: CachedPlan, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, p| p.preview.expires_at > now);
        entries.insert(plan.preview.plan_hash.clone(), plan);
    }

    fn live(&self, plan_hash: &str, now: DateTime<Utc>) -> Option<CachedPlan> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, p| p.preview.expires_at > now);
        entries.get(plan_hash).cloned()
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct IntentSettings {
    pub preview_ttl: Duration,
    pub default_confirm_phrase: String,
    pub plan_profile: CanonProfile,
    pub max_payload_bytes: u64,
}

impl Default for IntentSettings {
    fn default() -> Self {
        Self {
            preview_ttl: Duration::minutes(10),
            default_confirm_phrase: "DUAL_CONTROL".into(),
            plan_profile: CanonProfile::PLAN,
            max_payload_bytes: 4 * policy::MAX_PAYLOAD_BYTES,
        }
    }
}

/// A resolved plan before it is cached or enqueued.
struct Plan {
    plan_hash: String,
    dag: Value,
    work: WorkUnit,
    estimates: BTreeMap<String, u64>,
    decision: Decision,
}

pub struct IntentResolver {
    registry: Arc<dyn SchemaRegistry>,
    policy: Arc<PolicyEngine>,
    queue: LeaseQueue,
    clock: Arc<dyn Clock>,
    settings: IntentSettings,
    previews: PreviewCache,
}

impl IntentResolver {
    pub fn new(
        registry: Arc<dyn SchemaRegistry>,
        policy: Arc<PolicyEngine>,
        queue: LeaseQueue,
        clock: Arc<dyn Clock>,
        settings: IntentSettings,
    ) -> Self {
        Self {
            registry,
            policy,
            queue,
            clock,
            settings,
            previews: PreviewCache::default(),
        }
    }

    /// Number of unexpired previews held in memory.
    pub fn live_previews(&self) -> usize {
        self.previews.len()
    }

    fn resolve_action(&self, schema_id: &str, version: Option<u32>) -> Result<&ActionSpec> {
        let found = match version {
            Some(v) => self.registry.resolve(schema_id, v),
            None => self.registry.latest(schema_id),
        };
        found.ok_or_else(|| PlatformError::UnknownAction {
            schema_id: schema_id.to_string(),
            version: version.unwrap_or(0),
        })
    }

    fn confirm_phrase_for(&self, action: &ActionSpec) -> String {
        action
            .confirm_phrase
            .clone()
            .unwrap_or_else(|| self.settings.default_confirm_phrase.clone())
    }

    /// Normalize `payload` under the plan profile and enforce the size ceiling.
    fn normalize_payload(&self, payload: &Value) -> Result<(Value, Vec<u8>)> {
        let profile = self.settings.plan_profile;
        let normalized = canon::normalize(payload, profile)?;
        let bytes = canon::canonicalize(&normalized, profile)?;
        if bytes.len() as u64 > self.settings.max_payload_bytes {
            return Err(PlatformError::SchemaInvalid {
                message: format!(
                    "payload is {} bytes, ceiling is {}",
                    bytes.len(),
                    self.settings.max_payload_bytes
                ),
                detail: Some(json!({
                    "payload_bytes": bytes.len(),
                    "max_payload_bytes": self.settings.max_payload_bytes,
                })),
            });
        }
        Ok((normalized, bytes))
    }

    /// Build the canonical DAG for a validated draft and run policy on it.
    #[allow(clippy::too_many_arguments)]
    fn plan(
        &self,
        tenant: &str,
        action: &ActionSpec,
        payload: Value,
        payload_bytes: &[u8],
        idem_key: Option<String>,
        requested_route: Option<Route>,
        declared: &BTreeMap<String, u64>,
    ) -> Result<Plan> {
        let dag = json!({
            "@type": PLAN_TYPE,
            "tenant": tenant,
            "action": {
                "schema_id": action.schema_id,
                "version": action.version,
                "topic": action.topic,
            },
            "nodes": [
                { "id": "validate", "op": "schema.validate" },
                { "id": "policy", "op": "policy.evaluate" },
                { "id": "execute", "op": action.topic },
            ],
            "edges": [["validate", "policy"], ["policy", "execute"]],
            "payload": payload,
        });
        let plan_hash = canon::cid(&dag, CanonProfile::RAW)?;

        let work = WorkUnit {
            tenant: tenant.to_string(),
            topic: action.topic.clone(),
            schema_id: action.schema_id.clone(),
            schema_version: action.version,
            payload,
            idem_key,
        };
        work.validate_names()?;

        let estimates = policy::merge_estimates(policy::estimate(payload_bytes), declared);
        let decision = self.policy.evaluate(&WorkDescriptor {
            tenant: &work.tenant,
            topic: &work.topic,
            payload: &work.payload,
            estimates: &estimates,
            requested_route,
        });
        decision.ensure_admitted()?;

        Ok(Plan {
            plan_hash,
            dag,
            work,
            estimates,
            decision,
        })
    }

    fn check_confirmation(
        &self,
        decision: &Decision,
        expected: &str,
        supplied: Option<&str>,
        topic: &str,
    ) -> Result<()> {
        if decision.confirm_required && supplied != Some(expected) {
            return Err(PlatformError::DualControlRequired {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }

    /// Validate a draft and, when it is complete, return a plan preview.
    pub fn propose(&self, req: &ProposeRequest) -> Result<ProposeOutcome> {
        let action = self.resolve_action(&req.schema_id, req.version)?;
        let (payload, bytes) = self.normalize_payload(&req.payload)?;

        let check = action.check(&payload);
        if !check.is_valid() {
            let repair = RepairRequest {
                attempt: req.attempt,
                missing: check.missing,
                invalid: check.invalid,
                hints: check.hints,
                remaining: MAX_REPAIR_ATTEMPTS.saturating_sub(req.attempt + 1),
            };
            if req.attempt < MAX_REPAIR_ATTEMPTS {
                tracing::debug!(
                    schema_id = %action.schema_id,
                    attempt = req.attempt,
                    missing = repair.missing.len(),
                    invalid = repair.invalid.len(),
                    "draft needs repair"
                );
                return Ok(ProposeOutcome::RepairRequired {
                    state: IntentState::Repairing,
                    repair_request: repair,
                });
            }
            return Err(PlatformError::SchemaInvalid {
                message: format!(
                    "draft for {}:{} still invalid after {} repair attempts",
                    action.schema_id, action.version, MAX_REPAIR_ATTEMPTS
                ),
                detail: Some(serde_json::to_value(&repair)?),
            });
        }

        let plan = self.plan(
            &req.tenant,
            action,
            payload,
            &bytes,
            None,
            req.requested_route,
            &req.estimates,
        )?;
        let now = self.clock.now();
        let confirm_phrase = plan
            .decision
            .confirm_required
            .then(|| self.confirm_phrase_for(action));
        let preview = PlanPreview {
            plan_hash: plan.plan_hash.clone(),
            dag: plan.dag,
            tenant: plan.work.tenant.clone(),
            topic: plan.work.topic.clone(),
            schema_id: plan.work.schema_id.clone(),
            schema_version: plan.work.schema_version,
            policy_trace: plan.decision.trace.clone(),
            quotas: plan.decision.quotas.clone(),
            estimates: plan.estimates,
            route: plan.decision.route,
            outbound_allowed: plan.decision.outbound_allowed,
            confirm_required: plan.decision.confirm_required,
            confirm_phrase,
            expires_at: now + self.settings.preview_ttl,
        };
        self.previews.insert(
            CachedPlan {
                preview: preview.clone(),
                work: plan.work,
                decision: plan.decision,
            },
            now,
        );
        tracing::info!(plan_hash = %preview.plan_hash, topic = %preview.topic, "plan proposed");
        Ok(ProposeOutcome::Proposed {
            state: IntentState::Proposed,
            preview,
        })
    }

    /// Confirm and enqueue a proposed plan.
    pub fn commit(&self, req: &CommitRequest) -> Result<CommitResponse> {
        let now = self.clock.now();
        let Some(cached) = self.previews.live(&req.plan_hash, now) else {
            return match self.queue.commit_for_plan(&req.plan_hash)? {
                Some(record) => Ok(CommitResponse::from_record(&record, true)),
                None => Err(PlatformError::PlanConflict(req.plan_hash.clone())),
            };
        };

        let expected = cached.preview.confirm_phrase.clone().unwrap_or_default();
        self.check_confirmation(
            &cached.decision,
            &expected,
            req.confirm_phrase.as_deref(),
            &cached.preview.topic,
        )?;

        let mut work = cached.work;
        work.idem_key = req.idem_key.clone();
        self.queue.enqueue(work, &req.plan_hash, &cached.decision)
    }

    /// Submit a complete work unit in one step.
    pub fn submit(&self, req: &SubmitRequest) -> Result<CommitResponse> {
        let work = &req.work;
        let action = self.resolve_action(&work.schema_id, Some(work.schema_version))?;
        if work.topic != action.topic {
            return Err(PlatformError::schema(format!(
                "topic '{}' does not match action topic '{}'",
                work.topic, action.topic
            )));
        }
        let (payload, bytes) = self.normalize_payload(&work.payload)?;
        let check = action.check(&payload);
        if !check.is_valid() {
            return Err(PlatformError::SchemaInvalid {
                message: format!(
                    "payload does not satisfy {}:{}",
                    action.schema_id, action.version
                ),
                detail: Some(serde_json::to_value(&check)?),
            });
        }

        let plan = self.plan(
            &work.tenant,
            action,
            payload,
            &bytes,
            work.idem_key.clone(),
            req.requested_route,
            &req.estimates,
        )?;
        self.check_confirmation(
            &plan.decision,
            &self.confirm_phrase_for(action),
            req.confirm_phrase.as_deref(),
            &plan.work.topic,
        )?;
        self.queue.enqueue(plan.work, &plan.plan_hash, &plan.decision)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use crate::events::NullSink;
    use crate::policy::default_rules;
    use crate::queue::QueueSettings;
    use crate::registry::{default_actions, StaticRegistry};
    use crate::store::Store;
    use crate::types::CommitStatus;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        resolver: IntentResolver,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        ));
        let queue = LeaseQueue::new(
            store,
            clock.clone(),
            Arc::new(NullSink),
            QueueSettings::default(),
        );
        let registry = Arc::new(StaticRegistry::new(default_actions()).unwrap());
        let policy = Arc::new(PolicyEngine::new(&default_rules(), clock.clone()).unwrap());
        let resolver = IntentResolver::new(
            registry,
            policy,
            queue,
            clock.clone(),
            IntentSettings::default(),
        );
        Fixture {
            _dir: dir,
            clock,
            resolver,
        }
    }

    fn draft(payload: Value, attempt: u32) -> ProposeRequest {
        ProposeRequest {
            tenant: "acme".into(),
            schema_id: "vcx.batch_transcode".into(),
            version: Some(1),
            payload,
            attempt,
            requested_route: None,
            estimates: BTreeMap::new(),
        }
    }

    fn av1() -> Value {
        json!({ "codec": "av1", "width": 640, "height": 360, "bitrate": 600 })
    }

    #[test]
    fn same_draft_same_plan_hash() {
        let f = fixture();
        let a = f.resolver.propose(&draft(av1(), 0)).unwrap();
        let reordered = json!({ "bitrate": 600.0, "height": 360, "width": 640, "codec": "av1", "note": null });
        let b = f.resolver.propose(&draft(reordered, 0)).unwrap();
        assert_eq!(
            a.preview().unwrap().plan_hash,
            b.preview().unwrap().plan_hash
        );
        assert_eq!(f.resolver.live_previews(), 1);
    }

    #[test]
    fn preview_lists_every_rule_and_requires_confirmation() {
        let f = fixture();
        let out = f.resolver.propose(&draft(av1(), 0)).unwrap();
        let preview = out.preview().unwrap();
        let names: Vec<&str> = preview.policy_trace.iter().map(|e| e.rule_name.as_str()).collect();
        assert_eq!(names, vec!["payload_size", "chat_tokens", "pii_local", "commitment"]);
        assert!(preview.confirm_required);
        assert_eq!(preview.confirm_phrase.as_deref(), Some("DUAL_CONTROL"));
        assert!(preview.estimates.contains_key("tokens"));
    }

    #[test]
    fn repair_is_bounded_at_two_attempts() {
        let f = fixture();
        let partial = json!({ "codec": "av1", "width": 640 });
        let first = f.resolver.propose(&draft(partial.clone(), 0)).unwrap();
        let repair = first.repair_request().unwrap();
        assert_eq!(repair.missing, vec!["height", "bitrate"]);
        assert_eq!(repair.remaining, 1);

        let second = f.resolver.propose(&draft(partial.clone(), 1)).unwrap();
        assert_eq!(second.repair_request().unwrap().remaining, 0);

        let err = f.resolver.propose(&draft(partial, 2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaInvalid);
        let detail = err.detail().unwrap();
        assert_eq!(detail["missing"], json!(["height", "bitrate"]));
    }

    #[test]
    fn wrong_kinds_are_reported_as_invalid() {
        let f = fixture();
        let bad = json!({ "codec": "av1", "width": "640", "height": 360, "bitrate": 600 });
        let out = f.resolver.propose(&draft(bad, 0)).unwrap();
        let repair = out.repair_request().unwrap();
        assert!(repair.missing.is_empty());
        assert_eq!(repair.invalid[0].field, "width");
        assert_eq!(repair.invalid[0].expected, "integer");
    }

    #[test]
    fn unknown_action_is_schema_invalid() {
        let f = fixture();
        let mut req = draft(av1(), 0);
        req.schema_id = "nope".into();
        let err = f.resolver.propose(&req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaInvalid);
    }

    #[test]
    fn commit_requires_exact_phrase() {
        let f = fixture();
        let out = f.resolver.propose(&draft(av1(), 0)).unwrap();
        let plan_hash = out.preview().unwrap().plan_hash.clone();
        let mut req = CommitRequest {
            plan_hash,
            confirm_phrase: None,
            idem_key: None,
        };
        assert_eq!(
            f.resolver.commit(&req).unwrap_err().code(),
            ErrorCode::DualControlRequired
        );
        req.confirm_phrase = Some("dual_control".into());
        assert_eq!(
            f.resolver.commit(&req).unwrap_err().code(),
            ErrorCode::DualControlRequired
        );
        req.confirm_phrase = Some("DUAL_CONTROL".into());
        let resp = f.resolver.commit(&req).unwrap();
        assert_eq!(resp.status, CommitStatus::Accepted);
        assert!(!resp.duplicate);

        let again = f.resolver.commit(&req).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.work_id, resp.work_id);
    }

    #[test]
    fn unknown_or_expired_plan_conflicts() {
        let f = fixture();
        let err = f
            .resolver
            .commit(&CommitRequest {
                plan_hash: "0".repeat(64),
                confirm_phrase: None,
                idem_key: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PlanConflict);

        let out = f.resolver.propose(&draft(av1(), 0)).unwrap();
        let plan_hash = out.preview().unwrap().plan_hash.clone();
        f.clock.advance(Duration::minutes(11));
        let err = f
            .resolver
            .commit(&CommitRequest {
                plan_hash,
                confirm_phrase: Some("DUAL_CONTROL".into()),
                idem_key: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PlanConflict);
        assert_eq!(f.resolver.live_previews(), 0);
    }

    #[test]
    fn consumed_preview_resolves_after_expiry() {
        let f = fixture();
        let out = f.resolver.propose(&draft(av1(), 0)).unwrap();
        let req = CommitRequest {
            plan_hash: out.preview().unwrap().plan_hash.clone(),
            confirm_phrase: Some("DUAL_CONTROL".into()),
            idem_key: None,
        };
        let first = f.resolver.commit(&req).unwrap();
        f.clock.advance(Duration::hours(1));
        let later = f.resolver.commit(&req).unwrap();
        assert!(later.duplicate);
        assert_eq!(later.work_id, first.work_id);
    }

    #[test]
    fn submit_matches_propose_plan_hash() {
        let f = fixture();
        let out = f.resolver.propose(&draft(av1(), 0)).unwrap();
        let proposed = out.preview().unwrap().plan_hash.clone();
        let req = SubmitRequest {
            work: WorkUnit {
                tenant: "acme".into(),
                topic: "vcx:commit".into(),
                schema_id: "vcx.batch_transcode".into(),
                schema_version: 1,
                payload: av1(),
                idem_key: None,
            },
            confirm_phrase: Some("DUAL_CONTROL".into()),
            requested_route: None,
            estimates: BTreeMap::new(),
        };
        let resp = f.resolver.submit(&req).unwrap();
        assert_eq!(resp.plan_hash, proposed);

        let mut bad = req.clone();
        bad.work.payload = json!({ "codec": "av1" });
        assert_eq!(
            f.resolver.submit(&bad).unwrap_err().code(),
            ErrorCode::SchemaInvalid
        );
        let mut unconfirmed = req;
        unconfirmed.confirm_phrase = None;
        unconfirmed.work.idem_key = Some("other".into());
        assert_eq!(
            f.resolver.submit(&unconfirmed).unwrap_err().code(),
            ErrorCode::DualControlRequired
        );
    }

    #[test]
    fn oversized_payload_is_rejected_before_policy() {
        let f = fixture();
        let mut payload = av1();
        payload["blob"] = json!("x".repeat(2 * 1024 * 1024));
        let err = f.resolver.propose(&draft(payload, 0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaInvalid);
    }

    #[test]
    fn pii_forces_local_route() {
        let f = fixture();
        let mut payload = av1();
        payload["owner_email"] = json!("a@example.com");
        let mut req = draft(payload, 0);
        req.requested_route = Some(Route::Outbound);
        let out = f.resolver.propose(&req).unwrap();
        let preview = out.preview().unwrap();
        assert_eq!(preview.route, Route::LocalOnly);
        assert!(!preview.outbound_allowed);
    }
}
