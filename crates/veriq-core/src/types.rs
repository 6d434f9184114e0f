use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, PlatformError, Result};
use crate::policy::{PolicyEntry, Route};

// ---------------------------------------------------------------------------
// WorkUnit
// ---------------------------------------------------------------------------

/// A unit of work as committed. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub tenant: String,
    pub topic: String,
    pub schema_id: String,
    pub schema_version: u32,
    pub payload: Value,
    /// Defaults to the plan hash when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idem_key: Option<String>,
}

impl WorkUnit {
    /// Tenants and topics become parts of composite storage keys, so they
    /// must be non-empty and free of control characters.
    pub fn validate_names(&self) -> Result<()> {
        for (label, value) in [("tenant", &self.tenant), ("topic", &self.topic)] {
            if value.is_empty() || value.chars().any(char::is_control) {
                return Err(PlatformError::schema(format!(
                    "{label} must be non-empty and free of control characters"
                )));
            }
        }
        if let Some(key) = &self.idem_key {
            if key.is_empty() || key.chars().any(char::is_control) {
                return Err(PlatformError::schema(
                    "idem_key must be non-empty and free of control characters",
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Ready,
    Leased,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Accepted,
    Assigned,
    Done,
    Failed,
}

impl CommitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommitStatus::Done | CommitStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseEntry {
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub expires_at: DateTime<Utc>,
}

/// Durable queue record for one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedWork {
    pub work_id: String,
    pub seq: u64,
    pub work: WorkUnit,
    pub plan_hash: String,
    pub idem_key: String,
    pub state: WorkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<LeaseEntry>,
    pub reassign_count: u32,
    pub policy_trace: Vec<PolicyEntry>,
    pub route: Route,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_leased_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_cid: Option<String>,
}

impl QueuedWork {
    /// True when `worker_id` holds a lease that has not expired at `now`.
    pub fn held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.state == WorkState::Leased
            && self
                .lease
                .as_ref()
                .is_some_and(|l| l.worker_id == worker_id && now < l.expires_at)
    }
}

/// One logical record per (tenant, idem_key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub plan_hash: String,
    pub idem_key: String,
    pub tenant: String,
    pub work_id: String,
    pub status: CommitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Response to a commit or direct submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub status: CommitStatus,
    pub work_id: String,
    pub plan_hash: String,
    pub idem_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_cid: Option<String>,
    /// Set when the work settled as failed: `EXECUTION_FAILED` or `WORKER_UNAVAILABLE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duplicate: bool,
    /// A duplicate whose original has not finished yet.
    pub in_flight: bool,
}

impl CommitResponse {
    pub fn from_record(record: &CommitRecord, duplicate: bool) -> Self {
        Self {
            status: record.status,
            work_id: record.work_id.clone(),
            plan_hash: record.plan_hash.clone(),
            idem_key: record.idem_key.clone(),
            receipt_cid: record.receipt_cid.clone(),
            error_code: record.error_code.clone(),
            duplicate,
            in_flight: duplicate && !record.status.is_terminal(),
        }
    }

    /// Wire code for the outcome: duplicates surface as `IDEM_DUPLICATE`.
    pub fn code(&self) -> Option<ErrorCode> {
        self.duplicate.then_some(ErrorCode::IdemDuplicate)
    }
}

// ---------------------------------------------------------------------------
// Worker reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTime {
    pub stage: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// What a worker reports when it finishes successfully.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkReport {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub stages: Vec<StageTime>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

/// What a worker reports when the work itself failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub error_code: String,
    pub message: String,
    #[serde(default)]
    pub stages: Vec<StageTime>,
}

/// A granted lease as handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub work_id: String,
    pub work: WorkUnit,
    pub plan_hash: String,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
    pub reassign_count: u32,
}
