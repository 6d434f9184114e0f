//! Durable lease queue.
//!
//! Each work item is in exactly one of `ready`, `leased` or `done`. The
//! `READY` index holds ready items keyed by topic and enqueue sequence, so
//! acquisition is FIFO within a topic; `LEASED` maps leased items to their
//! expiry for sweeping. Every transition is one redb write transaction that
//! also updates the commit record and appends the matching event; events are
//! pushed to the sink only after the transaction commits.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anchor;
use crate::clock::Clock;
use crate::error::{ErrorCode, PlatformError, Result};
use crate::events::{self, EventKind, EventSink, WorkEvent};
use crate::policy::Decision;
use crate::receipt::{self, Receipt, ReceiptStatus};
use crate::store::{
    db_err, get_json, next_seq, prefix_end, prefix_start, put_json, Store, COMMITS, LEASED,
    PLAN_COMMITS, READY, WORK,
};
use crate::types::{
    CommitRecord, CommitResponse, CommitStatus, Lease, LeaseEntry, QueuedWork, StageTime,
    WorkState, WorkUnit,
};

const WORK_SEQ: &str = "work_seq";

// ---------------------------------------------------------------------------
// Settings and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub lease_ttl_ms: u64,
    /// Reassignments allowed before an item is failed with WORKER_UNAVAILABLE.
    pub max_reassigns: u32,
    pub anchor_offset_minutes: i64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 30_000,
            max_reassigns: 3,
            anchor_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub reassigned: Vec<String>,
    pub abandoned: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub leased: usize,
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn ready_key(topic: &str, seq: u64) -> Vec<u8> {
    let mut key = prefix_start(topic.as_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn commit_key(tenant: &str, idem_key: &str) -> String {
    format!("{tenant}\u{1f}{idem_key}")
}

fn to_ms(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

fn lease_expired(work_id: &str, worker_id: &str) -> PlatformError {
    PlatformError::LeaseExpired {
        work_id: work_id.to_string(),
        worker_id: worker_id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

/// Error for a caller that no longer holds the lease on `queued`. Items the
/// sweeper settled as abandoned report WORKER_UNAVAILABLE.
fn lost_lease<T>(commits: &T, queued: &QueuedWork, worker_id: &str) -> Result<PlatformError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    if queued.state == WorkState::Done {
        let key = commit_key(&queued.work.tenant, &queued.idem_key);
        let record: Option<CommitRecord> = get_json(commits, &key)?;
        let code = record.and_then(|r| r.error_code);
        if code.as_deref() == Some(ErrorCode::WorkerUnavailable.as_str()) {
            return Ok(PlatformError::WorkerUnavailable {
                work_id: queued.work_id.clone(),
                attempts: queued.reassign_count + 1,
            });
        }
    }
    Ok(lease_expired(&queued.work_id, worker_id))
}

fn load_work(txn: &WriteTransaction, work_id: &str) -> Result<QueuedWork> {
    let table = txn.open_table(WORK).map_err(db_err)?;
    get_json(&table, work_id)?.ok_or_else(|| PlatformError::WorkNotFound(work_id.to_string()))
}

fn save_work(txn: &WriteTransaction, work: &QueuedWork) -> Result<()> {
    let mut table = txn.open_table(WORK).map_err(db_err)?;
    put_json(&mut table, &work.work_id, work)
}

fn update_commit(
    txn: &WriteTransaction,
    work: &QueuedWork,
    now: DateTime<Utc>,
    apply: impl FnOnce(&mut CommitRecord),
) -> Result<()> {
    let key = commit_key(&work.work.tenant, &work.idem_key);
    let mut table = txn.open_table(COMMITS).map_err(db_err)?;
    let mut record: CommitRecord = get_json(&table, &key)?.ok_or_else(|| {
        PlatformError::Internal(format!("commit record missing for {}", work.work_id))
    })?;
    apply(&mut record);
    record.updated_at = now;
    put_json(&mut table, &key, &record)
}

fn append_event(
    txn: &WriteTransaction,
    work: &QueuedWork,
    now: DateTime<Utc>,
    kind: EventKind,
) -> Result<WorkEvent> {
    events::append(
        txn,
        &work.work_id,
        &work.work.tenant,
        &work.work.topic,
        now,
        kind,
    )
}

// ---------------------------------------------------------------------------
// LeaseQueue
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LeaseQueue {
    store: Store,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    settings: QueueSettings,
}

impl LeaseQueue {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            store,
            clock,
            sink,
            settings,
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    fn publish(&self, emitted: &[WorkEvent]) {
        for event in emitted {
            self.sink.publish(event);
        }
    }

    /// Admit `work` unless policy blocked it. Idempotent on
    /// (tenant, idem_key): an existing commit is returned with
    /// `duplicate = true` and nothing is enqueued.
    pub fn enqueue(
        &self,
        work: WorkUnit,
        plan_hash: &str,
        decision: &Decision,
    ) -> Result<CommitResponse> {
        work.validate_names()?;
        decision.ensure_admitted()?;

        let idem_key = work
            .idem_key
            .clone()
            .unwrap_or_else(|| plan_hash.to_string());
        let ckey = commit_key(&work.tenant, &idem_key);
        let now = self.clock.now();

        let txn = self.store.write()?;
        let existing: Option<CommitRecord> = {
            let commits = txn.open_table(COMMITS).map_err(db_err)?;
            get_json(&commits, &ckey)?
        };
        if let Some(record) = existing {
            tracing::debug!(work_id = %record.work_id, idem_key = %idem_key, "duplicate commit");
            return Ok(CommitResponse::from_record(&record, true));
        }

        let seq = next_seq(&txn, WORK_SEQ)?;
        let work_id = Uuid::new_v4().to_string();
        let queued = QueuedWork {
            work_id: work_id.clone(),
            seq,
            plan_hash: plan_hash.to_string(),
            idem_key: idem_key.clone(),
            state: WorkState::Ready,
            lease: None,
            reassign_count: 0,
            policy_trace: decision.trace.clone(),
            route: decision.route,
            enqueued_at: now,
            first_leased_at: None,
            receipt_cid: None,
            work,
        };
        let record = CommitRecord {
            plan_hash: plan_hash.to_string(),
            idem_key,
            tenant: queued.work.tenant.clone(),
            work_id: work_id.clone(),
            status: CommitStatus::Accepted,
            receipt_cid: None,
            error_code: None,
            created_at: now,
            updated_at: now,
        };

        save_work(&txn, &queued)?;
        {
            let mut ready = txn.open_table(READY).map_err(db_err)?;
            ready
                .insert(
                    ready_key(&queued.work.topic, seq).as_slice(),
                    work_id.as_str(),
                )
                .map_err(db_err)?;
            let mut commits = txn.open_table(COMMITS).map_err(db_err)?;
            put_json(&mut commits, &ckey, &record)?;
            let mut plans = txn.open_table(PLAN_COMMITS).map_err(db_err)?;
            let known = plans.get(plan_hash).map_err(db_err)?.is_some();
            if !known {
                plans.insert(plan_hash, ckey.as_str()).map_err(db_err)?;
            }
        }
        let event = append_event(
            &txn,
            &queued,
            now,
            EventKind::Accepted {
                plan_hash: plan_hash.to_string(),
            },
        )?;
        txn.commit().map_err(db_err)?;
        self.publish(&[event]);

        tracing::info!(
            work_id = %work_id,
            topic = %queued.work.topic,
            tenant = %queued.work.tenant,
            "work enqueued"
        );
        Ok(CommitResponse::from_record(&record, false))
    }

    /// Lease the oldest ready item on `topic`, if any.
    pub fn acquire_lease(
        &self,
        topic: &str,
        worker_id: &str,
        ttl_ms: Option<u64>,
    ) -> Result<Option<Lease>> {
        let ttl_ms = ttl_ms.unwrap_or(self.settings.lease_ttl_ms).max(1);
        let now = self.clock.now();

        let txn = self.store.write()?;
        let picked = {
            let ready = txn.open_table(READY).map_err(db_err)?;
            let lo = prefix_start(topic.as_bytes());
            let hi = prefix_end(topic.as_bytes());
            let mut range = ready.range(lo.as_slice()..hi.as_slice()).map_err(db_err)?;
            let next = match range.next() {
                Some(entry) => {
                    let (k, v) = entry.map_err(db_err)?;
                    Some((k.value().to_vec(), v.value().to_string()))
                }
                None => None,
            };
            next
        };
        let Some((key, work_id)) = picked else {
            return Ok(None);
        };

        let mut queued = load_work(&txn, &work_id)?;
        let expires_at = now + Duration::milliseconds(ttl_ms as i64);
        queued.state = WorkState::Leased;
        queued.lease = Some(LeaseEntry {
            worker_id: worker_id.to_string(),
            acquired_at: now,
            ttl_ms,
            expires_at,
        });
        queued.first_leased_at.get_or_insert(now);

        {
            let mut ready = txn.open_table(READY).map_err(db_err)?;
            ready.remove(key.as_slice()).map_err(db_err)?;
            let mut leased = txn.open_table(LEASED).map_err(db_err)?;
            leased
                .insert(work_id.as_str(), to_ms(expires_at))
                .map_err(db_err)?;
        }
        save_work(&txn, &queued)?;
        update_commit(&txn, &queued, now, |r| r.status = CommitStatus::Assigned)?;
        let event = append_event(
            &txn,
            &queued,
            now,
            EventKind::Assigned {
                worker_id: worker_id.to_string(),
                reassign_count: queued.reassign_count,
            },
        )?;
        txn.commit().map_err(db_err)?;
        self.publish(&[event]);

        tracing::debug!(work_id = %work_id, worker_id, ttl_ms, "lease acquired");
        Ok(Some(Lease {
            work_id,
            plan_hash: queued.plan_hash,
            worker_id: worker_id.to_string(),
            expires_at,
            reassign_count: queued.reassign_count,
            work: queued.work,
        }))
    }

    /// Extend the caller's lease by its TTL, optionally recording progress.
    pub fn heartbeat(
        &self,
        work_id: &str,
        worker_id: &str,
        progress: Option<StageTime>,
    ) -> Result<LeaseEntry> {
        let now = self.clock.now();
        let txn = self.store.write()?;
        let mut queued = load_work(&txn, work_id)?;
        if !queued.held_by(worker_id, now) {
            let commits = txn.open_table(COMMITS).map_err(db_err)?;
            return Err(lost_lease(&commits, &queued, worker_id)?);
        }
        let Some(lease) = queued.lease.as_mut() else {
            return Err(lease_expired(work_id, worker_id));
        };
        lease.expires_at = now + Duration::milliseconds(lease.ttl_ms as i64);
        let renewed = lease.clone();
        {
            let mut leased = txn.open_table(LEASED).map_err(db_err)?;
            leased
                .insert(work_id, to_ms(renewed.expires_at))
                .map_err(db_err)?;
        }
        save_work(&txn, &queued)?;
        let mut emitted = Vec::new();
        if let Some(stage) = progress {
            emitted.push(append_event(
                &txn,
                &queued,
                now,
                EventKind::Progress {
                    stage: stage.stage,
                    elapsed_ms: stage.elapsed_ms,
                },
            )?);
        }
        txn.commit().map_err(db_err)?;
        self.publish(&emitted);
        Ok(renewed)
    }

    /// Mark the caller's leased item done and store its receipt atomically.
    pub fn complete(&self, work_id: &str, worker_id: &str, receipt: &Receipt) -> Result<()> {
        self.finish(work_id, worker_id, receipt)
    }

    /// Worker-reported failure: the item is done and `receipt` records the failure.
    pub fn fail(&self, work_id: &str, worker_id: &str, receipt: &Receipt) -> Result<()> {
        self.finish(work_id, worker_id, receipt)
    }

    fn finish(&self, work_id: &str, worker_id: &str, receipt: &Receipt) -> Result<()> {
        if receipt.body.work_id != work_id {
            return Err(PlatformError::Internal(format!(
                "receipt for {} presented for {work_id}",
                receipt.body.work_id
            )));
        }
        let now = self.clock.now();
        let txn = self.store.write()?;
        let mut queued = load_work(&txn, work_id)?;
        if !queued.held_by(worker_id, now) {
            let commits = txn.open_table(COMMITS).map_err(db_err)?;
            return Err(lost_lease(&commits, &queued, worker_id)?);
        }
        let event = self.settle(&txn, &mut queued, receipt, now)?;
        txn.commit().map_err(db_err)?;
        self.publish(&[event]);
        tracing::info!(
            work_id,
            worker_id,
            status = ?receipt.body.status,
            receipt = %receipt.cid,
            "work finished"
        );
        Ok(())
    }

    /// Move `queued` to done with `receipt`: store and file the receipt,
    /// update the commit record and append the closing event.
    fn settle(
        &self,
        txn: &WriteTransaction,
        queued: &mut QueuedWork,
        receipt: &Receipt,
        now: DateTime<Utc>,
    ) -> Result<WorkEvent> {
        queued.state = WorkState::Done;
        queued.lease = None;
        queued.receipt_cid = Some(receipt.cid.clone());
        {
            let mut leased = txn.open_table(LEASED).map_err(db_err)?;
            leased.remove(queued.work_id.as_str()).map_err(db_err)?;
        }
        save_work(txn, queued)?;
        receipt::put(txn, receipt)?;
        anchor::file_receipt(
            txn,
            receipt,
            Duration::minutes(self.settings.anchor_offset_minutes),
        )?;

        let error_code = receipt.body.error.as_ref().map(|e| e.code.clone());
        let status = match receipt.body.status {
            ReceiptStatus::Done => CommitStatus::Done,
            ReceiptStatus::Failed => CommitStatus::Failed,
        };
        update_commit(txn, queued, now, |r| {
            r.status = status;
            r.receipt_cid = Some(receipt.cid.clone());
            r.error_code = error_code;
        })?;

        let kind = match &receipt.body.error {
            Some(err) => EventKind::Fail {
                error_code: err.code.clone(),
                message: err.message.clone(),
                receipt_cid: Some(receipt.cid.clone()),
            },
            None => EventKind::Result {
                receipt_cid: receipt.cid.clone(),
            },
        };
        append_event(txn, queued, now, kind)
    }

    /// Return expired leases to ready, incrementing `reassign_count`. Items
    /// that would exceed `max_reassigns` are settled as failed with a receipt
    /// produced by `abandon`. The whole sweep is one transaction, so
    /// concurrent sweeps serialize and never double count.
    pub fn sweep_expired(
        &self,
        mut abandon: impl FnMut(&QueuedWork) -> Result<Receipt>,
    ) -> Result<SweepReport> {
        let now = self.clock.now();
        let now_ms = to_ms(now);
        let txn = self.store.write()?;

        let expired: Vec<String> = {
            let leased = txn.open_table(LEASED).map_err(db_err)?;
            let mut out = Vec::new();
            for entry in leased.iter().map_err(db_err)? {
                let (k, v) = entry.map_err(db_err)?;
                if v.value() <= now_ms {
                    out.push(k.value().to_string());
                }
            }
            out
        };

        let mut report = SweepReport::default();
        let mut emitted = Vec::new();
        for work_id in expired {
            let mut queued = load_work(&txn, &work_id)?;
            let still_leased = queued.state == WorkState::Leased
                && queued.lease.as_ref().is_some_and(|l| l.expires_at <= now);
            if !still_leased {
                if queued.state != WorkState::Leased {
                    let mut leased = txn.open_table(LEASED).map_err(db_err)?;
                    leased.remove(work_id.as_str()).map_err(db_err)?;
                }
                continue;
            }

            if queued.reassign_count >= self.settings.max_reassigns {
                let receipt = abandon(&queued)?;
                emitted.push(self.settle(&txn, &mut queued, &receipt, now)?);
                tracing::warn!(
                    work_id = %work_id,
                    attempts = queued.reassign_count + 1,
                    "lease attempts exhausted"
                );
                report.abandoned.push(work_id);
                continue;
            }

            queued.reassign_count += 1;
            queued.state = WorkState::Ready;
            queued.lease = None;
            {
                let mut leased = txn.open_table(LEASED).map_err(db_err)?;
                leased.remove(work_id.as_str()).map_err(db_err)?;
                let mut ready = txn.open_table(READY).map_err(db_err)?;
                ready
                    .insert(
                        ready_key(&queued.work.topic, queued.seq).as_slice(),
                        work_id.as_str(),
                    )
                    .map_err(db_err)?;
            }
            save_work(&txn, &queued)?;
            update_commit(&txn, &queued, now, |r| r.status = CommitStatus::Accepted)?;
            emitted.push(append_event(
                &txn,
                &queued,
                now,
                EventKind::Requeued {
                    reassign_count: queued.reassign_count,
                },
            )?);
            report.reassigned.push(work_id);
        }

        txn.commit().map_err(db_err)?;
        self.publish(&emitted);
        if !report.reassigned.is_empty() || !report.abandoned.is_empty() {
            tracing::info!(
                reassigned = report.reassigned.len(),
                abandoned = report.abandoned.len(),
                "swept expired leases"
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, work_id: &str) -> Result<QueuedWork> {
        let rt = self.store.read()?;
        let table = rt.open_table(WORK).map_err(db_err)?;
        get_json(&table, work_id)?.ok_or_else(|| PlatformError::WorkNotFound(work_id.to_string()))
    }

    /// The error a report from `worker_id` on `queued` gets once its lease is gone.
    pub fn lease_error(&self, queued: &QueuedWork, worker_id: &str) -> Result<PlatformError> {
        let rt = self.store.read()?;
        let commits = rt.open_table(COMMITS).map_err(db_err)?;
        lost_lease(&commits, queued, worker_id)
    }

    pub fn commit_for(&self, tenant: &str, idem_key: &str) -> Result<Option<CommitRecord>> {
        let rt = self.store.read()?;
        let table = rt.open_table(COMMITS).map_err(db_err)?;
        get_json(&table, &commit_key(tenant, idem_key))
    }

    /// Commit record created by the first commit of `plan_hash`.
    pub fn commit_for_plan(&self, plan_hash: &str) -> Result<Option<CommitRecord>> {
        let rt = self.store.read()?;
        let plans = rt.open_table(PLAN_COMMITS).map_err(db_err)?;
        let key = match plans.get(plan_hash).map_err(db_err)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let commits = rt.open_table(COMMITS).map_err(db_err)?;
        get_json(&commits, &key)
    }

    pub fn depth(&self) -> Result<QueueDepth> {
        let rt = self.store.read()?;
        let ready = rt.open_table(READY).map_err(db_err)?;
        let leased = rt.open_table(LEASED).map_err(db_err)?;
        let ready = ready.iter().map_err(db_err)?.count();
        let leased = leased.iter().map_err(db_err)?.count();
        Ok(QueueDepth { ready, leased })
    }

    pub fn events(&self, work_id: &str, after_seq: Option<u32>) -> Result<Vec<WorkEvent>> {
        events::list(&self.store, work_id, after_seq)
    }
}

/// Receipt body for an item failed because its lease attempts ran out.
pub fn abandoned_body(work: &QueuedWork, now: DateTime<Utc>) -> Result<receipt::ReceiptBody> {
    let mut body = receipt::ReceiptBody::for_work(work, ReceiptStatus::Failed, now)?;
    body.error = Some(receipt::ReceiptError {
        code: ErrorCode::WorkerUnavailable.as_str().to_string(),
        message: format!(
            "lease expired {} times without completion",
            work.reassign_count + 1
        ),
    });
    Ok(body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
