//! Signed receipts.
//!
//! The receipt body is canonicalized with the raw profile; its CID is the
//! receipt id and the signature covers the same canonical bytes. A receipt
//! is never mutated after signing.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, Verifier};
use redb::WriteTransaction;
use serde::{Deserialize, Serialize};

use crate::canon::{self, CanonProfile};
use crate::error::{PlatformError, Result};
use crate::keyring::{ActiveKey, KeyInfo};
use crate::policy::PolicyEntry;
use crate::store::{db_err, get_json, put_json, Store, RECEIPTS};
use crate::types::{Artifact, QueuedWork, StageTime};

pub const SIGNATURE_ALG: &str = "ed25519";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptError {
    pub code: String,
    pub message: String,
}

/// Everything the signature covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptBody {
    pub work_id: String,
    pub tenant: String,
    pub topic: String,
    pub status: ReceiptStatus,
    pub plan_hash: String,
    pub idem_key: String,
    pub work_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_hash: Option<String>,
    pub policy_trace: Vec<PolicyEntry>,
    pub stage_times: Vec<StageTime>,
    pub schema_id: String,
    pub schema_version: u32,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReceiptError>,
    pub reassign_count: u32,
    pub issued_at: DateTime<Utc>,
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

impl ReceiptBody {
    /// Body for `work` with platform-measured stage times (`queued`, and
    /// `leased` while a lease is held). Callers add the result or error.
    pub fn for_work(
        work: &QueuedWork,
        status: ReceiptStatus,
        issued_at: DateTime<Utc>,
    ) -> Result<Self> {
        let mut stage_times = Vec::new();
        if let Some(first) = work.first_leased_at {
            stage_times.push(StageTime {
                stage: "queued".into(),
                elapsed_ms: elapsed_ms(work.enqueued_at, first),
            });
        }
        if let Some(lease) = &work.lease {
            stage_times.push(StageTime {
                stage: "leased".into(),
                elapsed_ms: elapsed_ms(lease.acquired_at, issued_at),
            });
        }
        Ok(Self {
            work_id: work.work_id.clone(),
            tenant: work.work.tenant.clone(),
            topic: work.work.topic.clone(),
            status,
            plan_hash: work.plan_hash.clone(),
            idem_key: work.idem_key.clone(),
            work_hash: canon::cid_of(&work.work)?,
            result_hash: None,
            policy_trace: work.policy_trace.clone(),
            stage_times,
            schema_id: work.work.schema_id.clone(),
            schema_version: work.work.schema_version,
            artifacts: Vec::new(),
            error: None,
            reassign_count: work.reassign_count,
            issued_at,
        })
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canon::canonicalize_ser(self, CanonProfile::RAW)
    }

    pub fn cid(&self) -> Result<String> {
        Ok(canon::hash_hex(&self.canonical_bytes()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub alg: String,
    pub kid: String,
    /// Base64 of the 64-byte signature.
    pub sig: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub cid: String,
    #[serde(flatten)]
    pub body: ReceiptBody,
    pub signature: Signature,
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

pub fn sign(bytes: &[u8], key: &ActiveKey) -> Signature {
    Signature {
        alg: SIGNATURE_ALG.to_string(),
        kid: key.kid.clone(),
        sig: B64.encode(key.signing.sign(bytes).to_bytes()),
    }
}

/// Sign `body` and wrap it into a receipt.
pub fn issue(body: ReceiptBody, key: &ActiveKey) -> Result<Receipt> {
    let bytes = body.canonical_bytes()?;
    let signature = sign(&bytes, key);
    Ok(Receipt {
        cid: canon::hash_hex(&bytes),
        body,
        signature,
    })
}

/// Check the signature of `receipt` against `key`. Status (retired,
/// revoked) is not considered here; see [`VerificationReport`].
pub fn verify(receipt: &Receipt, key: &KeyInfo) -> bool {
    if receipt.signature.alg != SIGNATURE_ALG || receipt.signature.kid != key.kid {
        return false;
    }
    let Ok(bytes) = receipt.body.canonical_bytes() else {
        return false;
    };
    let Ok(raw) = B64.decode(&receipt.signature.sig) else {
        return false;
    };
    let Ok(sig) = ed25519_dalek::Signature::from_slice(&raw) else {
        return false;
    };
    match key.verifying_key() {
        Ok(vk) => vk.verify(&bytes, &sig).is_ok(),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Verification report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    CidMismatch,
    UnsupportedAlgorithm,
    UnknownKey,
    KeyRevoked,
    BadSignature,
    NotAnchored,
    AnchorMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationIssue {
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub ok: bool,
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_date: Option<String>,
    pub issues: Vec<VerificationIssue>,
}

impl VerificationReport {
    pub(crate) fn new(cid: &str) -> Self {
        Self {
            ok: true,
            cid: cid.to_string(),
            kid: None,
            anchor_date: None,
            issues: Vec::new(),
        }
    }

    pub(crate) fn issue(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.ok = false;
        self.issues.push(VerificationIssue {
            kind,
            message: message.into(),
        });
    }
}

/// Cryptographic checks: cid, algorithm, key resolution, revocation and
/// signature. Anchor inclusion is layered on by the anchor book.
pub fn check_signature(
    receipt: &Receipt,
    key_for: impl Fn(&str) -> Result<Option<KeyInfo>>,
) -> Result<VerificationReport> {
    let mut report = VerificationReport::new(&receipt.cid);
    report.kid = Some(receipt.signature.kid.clone());

    let computed = receipt.body.cid()?;
    if computed != receipt.cid {
        report.issue(
            IssueKind::CidMismatch,
            format!("body hashes to {computed}, receipt claims {}", receipt.cid),
        );
    }
    if receipt.signature.alg != SIGNATURE_ALG {
        report.issue(
            IssueKind::UnsupportedAlgorithm,
            format!("unsupported algorithm '{}'", receipt.signature.alg),
        );
        return Ok(report);
    }
    match key_for(&receipt.signature.kid)? {
        None => report.issue(
            IssueKind::UnknownKey,
            format!("key {} is not in the key table", receipt.signature.kid),
        ),
        Some(key) => {
            if key.status == crate::keyring::KeyStatus::Revoked {
                report.issue(
                    IssueKind::KeyRevoked,
                    format!("key {} was revoked", key.kid),
                );
            }
            if !verify(receipt, &key) {
                report.issue(IssueKind::BadSignature, "signature does not verify");
            }
        }
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

pub(crate) fn put(txn: &WriteTransaction, receipt: &Receipt) -> Result<()> {
    let mut table = txn.open_table(RECEIPTS).map_err(db_err)?;
    put_json(&mut table, &receipt.cid, receipt)
}

pub fn get(store: &Store, cid: &str) -> Result<Receipt> {
    let rt = store.read()?;
    let table = rt.open_table(RECEIPTS).map_err(db_err)?;
    get_json(&table, cid)?.ok_or_else(|| PlatformError::ReceiptNotFound(cid.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
