//! The platform facade: one value that owns the store and wires queue,
//! intent resolution, keyring and anchor book together. The server and the
//! CLI only talk to this type.

use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::anchor::{AnchorBook, AnchorRecord, MerkleProof, RebuildReport};
use crate::canon::{self, CanonProfile};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{PlatformError, Result};
use crate::events::{EventSink, WorkEvent};
use crate::intent::{
    CommitRequest, IntentResolver, IntentSettings, ProposeOutcome, ProposeRequest, SubmitRequest,
    MAX_REPAIR_ATTEMPTS,
};
use crate::keyring::{KeyInfo, Keyring};
use crate::paths;
use crate::policy::{PolicyEngine, WorkDescriptor};
use crate::queue::{abandoned_body, LeaseQueue, QueueDepth, QueueSettings, SweepReport};
use crate::receipt::{
    self, Receipt, ReceiptBody, ReceiptError, ReceiptStatus, VerificationReport, SIGNATURE_ALG,
};
use crate::registry::{ActionSpec, SchemaRegistry, StaticRegistry};
use crate::store::Store;
use crate::types::{
    CommitResponse, FailureReport, Lease, LeaseEntry, QueuedWork, StageTime, WorkReport,
};

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub schema_id: String,
    pub version: u32,
    pub topic: String,
    pub title: String,
    pub confirm_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub version: String,
    pub actions: Vec<ActionSummary>,
    pub policy_rules: Vec<String>,
    pub signature_alg: String,
    pub hash_alg: String,
    pub plan_profile: CanonProfile,
    pub max_repair_attempts: u32,
    pub lease_ttl_ms: u64,
    pub max_reassigns: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformStatus {
    pub depth: QueueDepth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_kid: Option<String>,
    pub live_previews: usize,
    pub anchor_day: NaiveDate,
}

/// Proof that a stored receipt is part of its day's anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inclusion {
    pub anchor: AnchorRecord,
    pub proof: MerkleProof,
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

pub struct Platform {
    config: Config,
    store: Store,
    clock: Arc<dyn Clock>,
    registry: Arc<dyn SchemaRegistry>,
    policy: Arc<PolicyEngine>,
    queue: LeaseQueue,
    intent: IntentResolver,
    keyring: Keyring,
    anchors: AnchorBook,
}

impl Platform {
    /// Open the database under `root` with the system clock.
    pub fn open(root: &Path, config: Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let store = Store::open(&paths::db_path(root))?;
        Self::with_clock(store, config, Arc::new(SystemClock), sink)
    }

    pub fn with_clock(
        store: Store,
        config: Config,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let registry: Arc<dyn SchemaRegistry> =
            Arc::new(StaticRegistry::new(config.actions.clone())?);
        let policy = Arc::new(PolicyEngine::new(&config.policy.rules, clock.clone())?);
        let queue = LeaseQueue::new(
            store.clone(),
            clock.clone(),
            sink,
            QueueSettings {
                lease_ttl_ms: config.queue.lease_ttl_ms,
                max_reassigns: config.queue.max_reassigns,
                anchor_offset_minutes: config.anchor.boundary_offset_minutes,
            },
        );
        let intent = IntentResolver::new(
            registry.clone(),
            policy.clone(),
            queue.clone(),
            clock.clone(),
            IntentSettings {
                preview_ttl: chrono::Duration::seconds(config.intent.preview_ttl_secs as i64),
                default_confirm_phrase: config.intent.default_confirm_phrase.clone(),
                plan_profile: config.intent.plan_profile.profile(),
                max_payload_bytes: config.intent.max_payload_bytes,
            },
        );
        let keyring = Keyring::new(store.clone(), clock.clone());
        keyring.ensure_active()?;
        let anchors = AnchorBook::new(
            store.clone(),
            clock.clone(),
            config.anchor.boundary_offset_minutes,
        );
        Ok(Self {
            config,
            store,
            clock,
            registry,
            policy,
            queue,
            intent,
            keyring,
            anchors,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // -----------------------------------------------------------------------
    // Intent
    // -----------------------------------------------------------------------

    pub fn propose(&self, req: &ProposeRequest) -> Result<ProposeOutcome> {
        self.intent.propose(req)
    }

    pub fn commit(&self, req: &CommitRequest) -> Result<CommitResponse> {
        self.intent.commit(req)
    }

    pub fn submit(&self, req: &SubmitRequest) -> Result<CommitResponse> {
        self.intent.submit(req)
    }

    // -----------------------------------------------------------------------
    // Worker protocol
    // -----------------------------------------------------------------------

    pub fn acquire(&self, topic: &str, worker_id: &str, ttl_ms: Option<u64>) -> Result<Option<Lease>> {
        self.queue.acquire_lease(topic, worker_id, ttl_ms)
    }

    pub fn heartbeat(
        &self,
        work_id: &str,
        worker_id: &str,
        progress: Option<StageTime>,
    ) -> Result<LeaseEntry> {
        self.queue.heartbeat(work_id, worker_id, progress)
    }

    /// Body for the caller's leased item, or LEASE_EXPIRED (WORKER_UNAVAILABLE
    /// once the item was abandoned).
    fn leased_body(
        &self,
        work_id: &str,
        worker_id: &str,
        status: ReceiptStatus,
        stages: Vec<StageTime>,
    ) -> Result<ReceiptBody> {
        let work = self.queue.get(work_id)?;
        let now = self.clock.now();
        if !work.held_by(worker_id, now) {
            return Err(self.queue.lease_error(&work, worker_id)?);
        }
        let mut body = ReceiptBody::for_work(&work, status, now)?;
        body.stage_times.extend(stages);
        Ok(body)
    }

    /// Sign a receipt for a successful run and mark the item done.
    pub fn complete(&self, work_id: &str, worker_id: &str, report: WorkReport) -> Result<Receipt> {
        let signer = self.keyring.active_signer()?;
        let mut body = self.leased_body(work_id, worker_id, ReceiptStatus::Done, report.stages)?;
        body.result_hash = Some(canon::cid_of(&report.result)?);
        body.artifacts = report.artifacts;
        let receipt = receipt::issue(body, &signer)?;
        self.queue.complete(work_id, worker_id, &receipt)?;
        Ok(receipt)
    }

    /// Sign a failure receipt for a worker-reported failure.
    pub fn fail(&self, work_id: &str, worker_id: &str, report: FailureReport) -> Result<Receipt> {
        let signer = self.keyring.active_signer()?;
        let mut body = self.leased_body(work_id, worker_id, ReceiptStatus::Failed, report.stages)?;
        body.error = Some(ReceiptError {
            code: report.error_code,
            message: report.message,
        });
        let receipt = receipt::issue(body, &signer)?;
        self.queue.fail(work_id, worker_id, &receipt)?;
        Ok(receipt)
    }

    /// Requeue expired leases; items out of attempts get a signed
    /// WORKER_UNAVAILABLE receipt.
    pub fn sweep(&self) -> Result<SweepReport> {
        // Fetched up front: the sweep holds the write lock while it runs.
        let signer = self.keyring.active_signer()?;
        let now = self.clock.now();
        self.queue
            .sweep_expired(|work| receipt::issue(abandoned_body(work, now)?, &signer))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn work(&self, work_id: &str) -> Result<QueuedWork> {
        self.queue.get(work_id)
    }

    pub fn events(&self, work_id: &str, after_seq: Option<u32>) -> Result<Vec<WorkEvent>> {
        // Unknown ids are a 404, not an empty log.
        self.queue.get(work_id)?;
        self.queue.events(work_id, after_seq)
    }

    pub fn receipt(&self, cid: &str) -> Result<Receipt> {
        receipt::get(&self.store, cid)
    }

    pub fn status(&self) -> Result<PlatformStatus> {
        let active_kid = self
            .keyring
            .list()?
            .into_iter()
            .find(|k| k.status == crate::keyring::KeyStatus::Active)
            .map(|k| k.kid);
        Ok(PlatformStatus {
            depth: self.queue.depth()?,
            active_kid,
            live_previews: self.intent.live_previews(),
            anchor_day: self.anchors.day_of(self.clock.now()),
        })
    }

    // -----------------------------------------------------------------------
    // Verification and anchors
    // -----------------------------------------------------------------------

    /// Full check of a receipt document: signature, key status and, when
    /// its day is sealed, anchor inclusion.
    pub fn verify_receipt(&self, receipt: &Receipt) -> Result<VerificationReport> {
        let mut report = receipt::check_signature(receipt, |kid| self.keyring.key_for(kid))?;
        self.anchors.check_inclusion(receipt, &mut report)?;
        Ok(report)
    }

    pub fn verify_cid(&self, cid: &str) -> Result<VerificationReport> {
        let receipt = self.receipt(cid)?;
        self.verify_receipt(&receipt)
    }

    pub fn inclusion(&self, cid: &str) -> Result<Inclusion> {
        self.anchors
            .inclusion(cid)?
            .map(|(anchor, proof)| Inclusion { anchor, proof })
            .ok_or_else(|| PlatformError::ReceiptNotFound(cid.to_string()))
    }

    pub fn anchor(&self, day: NaiveDate) -> Result<AnchorRecord> {
        self.anchors.get(day)
    }

    pub fn seal_anchor(&self, day: NaiveDate) -> Result<AnchorRecord> {
        self.anchors.seal(day)
    }

    pub fn rebuild_anchor(&self, day: NaiveDate) -> Result<RebuildReport> {
        self.anchors.rebuild(day)
    }

    pub fn seal_due(&self) -> Result<Vec<AnchorRecord>> {
        self.anchors.seal_due()
    }

    // -----------------------------------------------------------------------
    // Keys
    // -----------------------------------------------------------------------

    pub fn keys(&self) -> Result<Vec<KeyInfo>> {
        self.keyring.list()
    }

    pub fn rotate_key(&self) -> Result<KeyInfo> {
        self.keyring.rotate()
    }

    pub fn revoke_key(&self, kid: &str) -> Result<KeyInfo> {
        self.keyring.revoke(kid)
    }

    // -----------------------------------------------------------------------
    // Registry lookups
    // -----------------------------------------------------------------------

    pub fn capabilities(&self) -> Capabilities {
        let empty = json!({});
        let no_estimates = Default::default();
        let actions = self
            .registry
            .list()
            .into_iter()
            .map(|a| {
                let decision = self.policy.evaluate(&WorkDescriptor {
                    tenant: "",
                    topic: &a.topic,
                    payload: &empty,
                    estimates: &no_estimates,
                    requested_route: None,
                });
                ActionSummary {
                    schema_id: a.schema_id.clone(),
                    version: a.version,
                    topic: a.topic.clone(),
                    title: a.title.clone(),
                    confirm_required: decision.confirm_required,
                }
            })
            .collect();
        Capabilities {
            version: env!("CARGO_PKG_VERSION").to_string(),
            actions,
            policy_rules: self.policy.rule_names().into_iter().map(String::from).collect(),
            signature_alg: SIGNATURE_ALG.to_string(),
            hash_alg: "blake3".to_string(),
            plan_profile: self.config.intent.plan_profile.profile(),
            max_repair_attempts: MAX_REPAIR_ATTEMPTS,
            lease_ttl_ms: self.config.queue.lease_ttl_ms,
            max_reassigns: self.config.queue.max_reassigns,
        }
    }

    pub fn schema(&self, schema_id: &str, version: u32) -> Result<ActionSpec> {
        self.registry
            .resolve(schema_id, version)
            .cloned()
            .ok_or_else(|| PlatformError::SchemaNotFound(format!("{schema_id}:{version}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
