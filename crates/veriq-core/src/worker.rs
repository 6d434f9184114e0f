//! In-process workers.
//!
//! A [`Worker`] polls its topics, runs the registered handler on each lease
//! and reports the outcome through the platform, which signs the receipt.
//! Domain executors plug in as [`WorkHandler`] implementations; the built-in
//! [`DigestHandler`] only fingerprints the payload.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::canon::{self, CanonProfile};
use crate::config::Config;
use crate::error::Result;
use crate::platform::Platform;
use crate::receipt::Receipt;
use crate::types::{Artifact, FailureReport, Lease, StageTime, WorkReport};

pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";

pub trait WorkHandler: Send + Sync {
    fn handle(&self, lease: &Lease) -> std::result::Result<WorkReport, FailureReport>;
}

/// Fingerprints the payload: the result carries the payload CID and its
/// top-level field names.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestHandler;

impl WorkHandler for DigestHandler {
    fn handle(&self, lease: &Lease) -> std::result::Result<WorkReport, FailureReport> {
        let started = Instant::now();
        let digest = canon::cid(&lease.work.payload, CanonProfile::RAW).map_err(|e| FailureReport {
            error_code: EXECUTION_FAILED.to_string(),
            message: e.to_string(),
            stages: Vec::new(),
        })?;
        let fields: Vec<&String> = lease
            .work
            .payload
            .as_object()
            .map(|o| o.keys().collect())
            .unwrap_or_default();
        Ok(WorkReport {
            result: json!({
                "schema_id": lease.work.schema_id,
                "payload_cid": digest,
                "fields": fields,
            }),
            stages: vec![StageTime {
                stage: "execute".into(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }],
            artifacts: vec![Artifact {
                name: "payload".into(),
                cid: digest,
                media_type: Some("application/json".into()),
            }],
        })
    }
}

pub struct Worker {
    worker_id: String,
    handlers: BTreeMap<String, Arc<dyn WorkHandler>>,
}

impl Worker {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Worker serving every configured topic with [`DigestHandler`].
    pub fn builtin(config: &Config) -> Self {
        let handler: Arc<dyn WorkHandler> = Arc::new(DigestHandler);
        config
            .worker_topics()
            .into_iter()
            .fold(Self::new(config.worker.worker_id.clone()), |w, topic| {
                w.with_handler(topic, handler.clone())
            })
    }

    pub fn with_handler(mut self, topic: impl Into<String>, handler: Arc<dyn WorkHandler>) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn topics(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Take at most one lease per topic and run it to completion. Returns
    /// the receipts issued. A lease lost mid-run (swept after expiry) is
    /// logged and skipped; another worker will pick the item up.
    pub fn run_once(&self, platform: &Platform) -> Result<Vec<Receipt>> {
        let mut issued = Vec::new();
        for (topic, handler) in &self.handlers {
            let Some(lease) = platform.acquire(topic, &self.worker_id, None)? else {
                continue;
            };
            tracing::debug!(work_id = %lease.work_id, topic = %topic, "running lease");
            let outcome = match handler.handle(&lease) {
                Ok(report) => platform.complete(&lease.work_id, &self.worker_id, report),
                Err(failure) => platform.fail(&lease.work_id, &self.worker_id, failure),
            };
            match outcome {
                Ok(receipt) => issued.push(receipt),
                Err(e) if e.code() == crate::error::ErrorCode::LeaseExpired => {
                    tracing::warn!(work_id = %lease.work_id, "lease lost before completion");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NullSink;
    use crate::intent::SubmitRequest;
    use crate::receipt::ReceiptStatus;
    use crate::store::Store;
    use crate::types::WorkUnit;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Refuse;

    impl WorkHandler for Refuse {
        fn handle(&self, _lease: &Lease) -> std::result::Result<WorkReport, FailureReport> {
            Err(FailureReport {
                error_code: EXECUTION_FAILED.into(),
                message: "simulator crashed".into(),
                stages: vec![],
            })
        }
    }

    fn open_tmp() -> (TempDir, Platform) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap(),
        ));
        let platform =
            Platform::with_clock(store, Config::default(), clock, Arc::new(NullSink)).unwrap();
        (dir, platform)
    }

    fn submit_hdl(platform: &Platform) -> String {
        platform
            .submit(&SubmitRequest {
                work: WorkUnit {
                    tenant: "acme".into(),
                    topic: "hdl:commit".into(),
                    schema_id: "hdl.sim".into(),
                    schema_version: 1,
                    payload: json!({ "top": "alu", "cycles": 1000, "asserts": [] }),
                    idem_key: None,
                },
                confirm_phrase: Some("DUAL_CONTROL".into()),
                requested_route: None,
                estimates: Default::default(),
            })
            .unwrap()
            .work_id
    }

    #[test]
    fn builtin_worker_completes_with_signed_receipt() {
        let (_dir, platform) = open_tmp();
        let work_id = submit_hdl(&platform);
        let worker = Worker::builtin(platform.config());
        assert!(worker.topics().contains(&"hdl:commit"));

        let receipts = worker.run_once(&platform).unwrap();
        assert_eq!(receipts.len(), 1);
        let receipt = &receipts[0];
        assert_eq!(receipt.body.work_id, work_id);
        assert_eq!(receipt.body.status, ReceiptStatus::Done);
        let stages: Vec<&str> = receipt.body.stage_times.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, vec!["queued", "leased", "execute"]);
        assert!(platform.verify_receipt(receipt).unwrap().ok);

        assert!(worker.run_once(&platform).unwrap().is_empty());
    }

    #[test]
    fn handler_failure_yields_failed_receipt() {
        let (_dir, platform) = open_tmp();
        submit_hdl(&platform);
        let worker = Worker::new("w-fail").with_handler("hdl:commit", Arc::new(Refuse));
        let receipts = worker.run_once(&platform).unwrap();
        let body = &receipts[0].body;
        assert_eq!(body.status, ReceiptStatus::Failed);
        assert_eq!(body.error.as_ref().unwrap().code, EXECUTION_FAILED);
        assert!(body.result_hash.is_none());
    }
}
