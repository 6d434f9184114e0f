//! Per-work-id event log.
//!
//! Events are appended inside the same write transaction as the state
//! change they describe, so the log never disagrees with the queue. Order is
//! total within one work id and unspecified across work ids. After commit
//! the queue hands each appended event to an [`EventSink`] for push
//! delivery; the log itself serves pull reads.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::{db_err, from_json, prefix_end, prefix_start, to_json, Store, EVENTS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Accepted {
        plan_hash: String,
    },
    Assigned {
        worker_id: String,
        reassign_count: u32,
    },
    Requeued {
        reassign_count: u32,
    },
    Progress {
        stage: String,
        elapsed_ms: u64,
    },
    Result {
        receipt_cid: String,
    },
    Fail {
        error_code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt_cid: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEvent {
    pub work_id: String,
    pub seq: u32,
    pub tenant: String,
    pub topic: String,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl WorkEvent {
    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::Accepted { .. } => "accepted",
            EventKind::Assigned { .. } => "assigned",
            EventKind::Requeued { .. } => "requeued",
            EventKind::Progress { .. } => "progress",
            EventKind::Result { .. } => "result",
            EventKind::Fail { .. } => "fail",
        }
    }
}

/// Push side of the event channel.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &WorkEvent);
}

/// Sink that drops everything; pull reads still work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &WorkEvent) {}
}

fn event_key(work_id: &str, seq: u32) -> Vec<u8> {
    let mut key = prefix_start(work_id.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Append an event for `work_id` and return it with its assigned sequence.
pub(crate) fn append(
    txn: &WriteTransaction,
    work_id: &str,
    tenant: &str,
    topic: &str,
    at: DateTime<Utc>,
    kind: EventKind,
) -> Result<WorkEvent> {
    let mut table = txn.open_table(EVENTS).map_err(db_err)?;
    let lo = prefix_start(work_id.as_bytes());
    let hi = prefix_end(work_id.as_bytes());
    let last = match table
        .range(lo.as_slice()..hi.as_slice())
        .map_err(db_err)?
        .next_back()
    {
        Some(entry) => {
            let (_, v) = entry.map_err(db_err)?;
            let prev: WorkEvent = from_json(v.value())?;
            Some(prev.seq)
        }
        None => None,
    };
    let event = WorkEvent {
        work_id: work_id.to_string(),
        seq: last.map_or(0, |s| s + 1),
        tenant: tenant.to_string(),
        topic: topic.to_string(),
        at,
        kind,
    };
    let key = event_key(work_id, event.seq);
    let bytes = to_json(&event)?;
    table
        .insert(key.as_slice(), bytes.as_slice())
        .map_err(db_err)?;
    Ok(event)
}

/// All events for `work_id` in append order, optionally only those after `after_seq`.
pub fn list(store: &Store, work_id: &str, after_seq: Option<u32>) -> Result<Vec<WorkEvent>> {
    let rt = store.read()?;
    let table = rt.open_table(EVENTS).map_err(db_err)?;
    let lo = match after_seq {
        Some(s) => event_key(work_id, s.saturating_add(1)),
        None => prefix_start(work_id.as_bytes()),
    };
    let hi = prefix_end(work_id.as_bytes());
    let mut out = Vec::new();
    for entry in table.range(lo.as_slice()..hi.as_slice()).map_err(db_err)? {
        let (_, v) = entry.map_err(db_err)?;
        out.push(from_json(v.value())?);
    }
    Ok(out)
}
