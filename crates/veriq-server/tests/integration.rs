use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{Duration, TimeZone, Utc};
use http_body_util::BodyExt;
use serde_json::json;
use tempfile::TempDir;
use tower::ServiceExt;
use veriq_core::clock::ManualClock;
use veriq_core::config::Config;
use veriq_server::build_router;
use veriq_server::state::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    state: AppState,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 10, 9, 0, 0).unwrap(),
        ));
        let state =
            AppState::with_clock(dir.path().to_path_buf(), config, clock.clone()).unwrap();
        Self {
            _dir: dir,
            clock,
            state,
        }
    }

    fn app(&self) -> axum::Router {
        build_router(self.state.clone())
    }
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn av1_draft(attempt: u32) -> serde_json::Value {
    json!({
        "tenant": "acme",
        "schema_id": "vcx.batch_transcode",
        "version": 1,
        "attempt": attempt,
        "payload": { "codec": "av1", "width": 640, "height": 360, "bitrate": 600 },
    })
}

/// Propose and commit the AV1 draft; returns (plan_hash, work_id).
async fn accept(h: &Harness) -> (String, String) {
    let (status, body) = post_json(h.app(), "/v1/intent/propose", av1_draft(0)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let plan_hash = body["preview"]["plan_hash"].as_str().unwrap().to_string();
    let (status, body) = post_json(
        h.app(),
        "/v1/intent/commit",
        json!({ "plan_hash": plan_hash, "confirm_phrase": "DUAL_CONTROL" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    (plan_hash, body["work_id"].as_str().unwrap().to_string())
}

/// Acquire the next vcx lease for `worker` and complete it; returns the receipt.
async fn run_lease(h: &Harness, worker: &str) -> serde_json::Value {
    let (status, body) = post_json(
        h.app(),
        "/v1/leases/acquire",
        json!({ "topic": "vcx:commit", "worker_id": worker }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let work_id = body["lease"]["work_id"].as_str().unwrap().to_string();
    let (status, receipt) = post_json(
        h.app(),
        &format!("/v1/leases/{work_id}/complete"),
        json!({ "worker_id": worker, "result": { "frames": 1200 } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{receipt}");
    receipt
}

// ---------------------------------------------------------------------------
// Health and discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healthz_reports_ok() {
    let h = Harness::new();
    let (status, body) = get(h.app(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["platform"]["depth"]["ready"], 0);
}

#[tokio::test]
async fn capabilities_list_actions_and_rules() {
    let h = Harness::new();
    let (status, body) = get(h.app(), "/v1/capabilities").await;
    assert_eq!(status, StatusCode::OK);
    let actions = body["actions"].as_array().unwrap();
    assert!(actions
        .iter()
        .any(|a| a["schema_id"] == "vcx.batch_transcode"));
    assert!(!body["policy_rules"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn schema_lookup_and_unknown_schema() {
    let h = Harness::new();
    let (status, body) = get(h.app(), "/v1/schema/vcx.batch_transcode/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["topic"], "vcx:commit");

    let (status, body) = get(h.app(), "/v1/schema/vcx.batch_transcode/9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn keys_expose_one_active_key() {
    let h = Harness::new();
    let (status, body) = get(h.app(), "/v1/keys").await;
    assert_eq!(status, StatusCode::OK);
    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["status"], "active");
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn propose_returns_preview() {
    let h = Harness::new();
    let (status, body) = post_json(h.app(), "/v1/intent/propose", av1_draft(0)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "proposed");
    assert_eq!(body["preview"]["plan_hash"].as_str().unwrap().len(), 64);
    assert!(body.get("repair_request").is_none());
}

#[tokio::test]
async fn incomplete_draft_gets_repair_request_then_422() {
    let h = Harness::new();
    let mut draft = av1_draft(0);
    draft["payload"] = json!({ "codec": "av1", "width": 640 });

    let (status, body) = post_json(h.app(), "/v1/intent/propose", draft.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "repair_required");
    assert_eq!(body["repair_request"]["missing"], json!(["height", "bitrate"]));

    draft["attempt"] = json!(2);
    let (status, body) = post_json(h.app(), "/v1/intent/propose", draft).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "SCHEMA_INVALID");
}

#[tokio::test]
async fn commit_without_phrase_is_forbidden() {
    let h = Harness::new();
    let (_, body) = post_json(h.app(), "/v1/intent/propose", av1_draft(0)).await;
    let plan_hash = body["preview"]["plan_hash"].clone();

    let (status, body) = post_json(
        h.app(),
        "/v1/intent/commit",
        json!({ "plan_hash": plan_hash }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "DUAL_CONTROL_REQUIRED");
}

#[tokio::test]
async fn unknown_plan_hash_conflicts() {
    let h = Harness::new();
    let (status, body) = post_json(
        h.app(),
        "/v1/intent/commit",
        json!({ "plan_hash": "0".repeat(64), "confirm_phrase": "DUAL_CONTROL" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "PLAN_CONFLICT");
}

#[tokio::test]
async fn duplicate_commit_returns_same_work_and_receipt() {
    let h = Harness::new();
    let (plan_hash, work_id) = accept(&h).await;
    let receipt = run_lease(&h, "w1").await;

    let (status, body) = post_json(
        h.app(),
        "/v1/intent/commit",
        json!({ "plan_hash": plan_hash, "confirm_phrase": "DUAL_CONTROL" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
    assert_eq!(body["code"], "IDEM_DUPLICATE");
    assert_eq!(body["work_id"], work_id.as_str());
    assert_eq!(body["receipt_cid"], receipt["cid"]);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let h = Harness::new();
    let (status, body) = post_json(h.app(), "/v1/intent/propose", json!({ "tenant": 3 })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "SCHEMA_INVALID");
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn unparseable_body_uses_error_envelope() {
    let h = Harness::new();
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/leases/acquire")
        .header("content-type", "application/json")
        .body(axum::body::Body::from("{\"topic\": "))
        .unwrap();
    let response = h.app().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "SCHEMA_INVALID");
}

#[tokio::test]
async fn missing_content_type_uses_error_envelope() {
    let h = Harness::new();
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/intent/commit")
        .body(axum::body::Body::from(r#"{"plan_hash":"x"}"#))
        .unwrap();
    let response = h.app().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], "SCHEMA_INVALID");
}

// ---------------------------------------------------------------------------
// Work, leases and events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn direct_submission_enqueues_work() {
    let h = Harness::new();
    let (status, body) = post_json(
        h.app(),
        "/v1/work",
        json!({
            "work": {
                "tenant": "acme",
                "topic": "hdl:commit",
                "schema_id": "hdl.sim",
                "schema_version": 1,
                "payload": { "top": "alu", "cycles": 1000, "asserts": [] },
            },
            "confirm_phrase": "DUAL_CONTROL",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "accepted");

    let work_id = body["work_id"].as_str().unwrap();
    let (status, work) = get(h.app(), &format!("/v1/work/{work_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(work["state"], "ready");
}

#[tokio::test]
async fn unknown_work_is_404() {
    let h = Harness::new();
    let (status, body) = get(h.app(), "/v1/work/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn empty_topic_yields_null_lease() {
    let h = Harness::new();
    let (status, body) = post_json(
        h.app(),
        "/v1/leases/acquire",
        json!({ "topic": "vcx:commit", "worker_id": "w1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["lease"].is_null());
}

#[tokio::test]
async fn expired_lease_is_reassigned_and_stale_holder_rejected() {
    let h = Harness::new();
    let (_, work_id) = accept(&h).await;
    let (_, body) = post_json(
        h.app(),
        "/v1/leases/acquire",
        json!({ "topic": "vcx:commit", "worker_id": "w1", "ttl_ms": 1000 }),
    )
    .await;
    assert_eq!(body["lease"]["work_id"], work_id.as_str());

    let (status, _) = post_json(
        h.app(),
        &format!("/v1/leases/{work_id}/heartbeat"),
        json!({ "worker_id": "w1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    h.clock.advance(Duration::seconds(2));
    let (status, body) = post_json(h.app(), "/v1/leases/sweep", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reassigned"], json!([work_id]));

    let (status, body) = post_json(
        h.app(),
        &format!("/v1/leases/{work_id}/complete"),
        json!({ "worker_id": "w1" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "LEASE_EXPIRED");

    let receipt = run_lease(&h, "w2").await;
    assert_eq!(receipt["reassign_count"], 1);

    let (status, body) = get(h.app(), &format!("/v1/work/{work_id}/events")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["kind"]["type"].as_str().unwrap())
        .collect();
    assert_eq!(names.first(), Some(&"accepted"));
    assert_eq!(names.last(), Some(&"result"));
    assert!(names.contains(&"requeued"));
}

#[tokio::test]
async fn abandoned_work_reports_worker_unavailable() {
    let mut config = Config::default();
    config.queue.max_reassigns = 0;
    let h = Harness::with_config(config);
    let (plan_hash, work_id) = accept(&h).await;
    post_json(
        h.app(),
        "/v1/leases/acquire",
        json!({ "topic": "vcx:commit", "worker_id": "w1", "ttl_ms": 1000 }),
    )
    .await;
    h.clock.advance(Duration::seconds(2));
    let (_, body) = post_json(h.app(), "/v1/leases/sweep", json!({})).await;
    assert_eq!(body["abandoned"], json!([work_id]));

    let (status, body) = post_json(
        h.app(),
        &format!("/v1/leases/{work_id}/heartbeat"),
        json!({ "worker_id": "w1" }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "WORKER_UNAVAILABLE");
    assert_eq!(body["error"]["detail"]["attempts"], 1);

    let (status, body) = post_json(
        h.app(),
        &format!("/v1/leases/{work_id}/complete"),
        json!({ "worker_id": "w1" }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "WORKER_UNAVAILABLE");

    let (status, body) = post_json(
        h.app(),
        "/v1/intent/commit",
        json!({ "plan_hash": plan_hash, "confirm_phrase": "DUAL_CONTROL" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error_code"], "WORKER_UNAVAILABLE");
}

#[tokio::test]
async fn worker_failure_issues_failed_receipt() {
    let h = Harness::new();
    let (_, work_id) = accept(&h).await;
    post_json(
        h.app(),
        "/v1/leases/acquire",
        json!({ "topic": "vcx:commit", "worker_id": "w1" }),
    )
    .await;
    let (status, receipt) = post_json(
        h.app(),
        &format!("/v1/leases/{work_id}/fail"),
        json!({ "worker_id": "w1", "error_code": "ENCODER_CRASH", "message": "segfault" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{receipt}");
    assert_eq!(receipt["status"], "failed");
    assert_eq!(receipt["error"]["code"], "ENCODER_CRASH");
}

// ---------------------------------------------------------------------------
// Receipts and anchors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn receipt_fetch_and_verify() {
    let h = Harness::new();
    accept(&h).await;
    let receipt = run_lease(&h, "w1").await;
    let cid = receipt["cid"].as_str().unwrap();

    let (status, fetched) = get(h.app(), &format!("/v1/receipts/{cid}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, receipt);

    let (status, report) = post_json(h.app(), "/v1/verify/receipt", json!({ "cid": cid })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["ok"], true);

    let mut tampered = receipt.clone();
    tampered["tenant"] = json!("mallory");
    let (status, report) =
        post_json(h.app(), "/v1/verify/receipt", json!({ "receipt": tampered })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["ok"], false);
    assert!(!report["issues"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn verify_needs_cid_or_receipt() {
    let h = Harness::new();
    let (status, body) = post_json(h.app(), "/v1/verify/receipt", json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "SCHEMA_INVALID");
}

#[tokio::test]
async fn unknown_receipt_is_404() {
    let h = Harness::new();
    let (status, _) = get(h.app(), "/v1/receipts/deadbeef").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn anchor_lists_receipts_and_rebuild_matches() {
    let h = Harness::new();
    accept(&h).await;
    let receipt = run_lease(&h, "w1").await;
    let cid = receipt["cid"].as_str().unwrap();

    let (status, anchor) = get(h.app(), "/v1/anchors/2026-06-10").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(anchor["sealed"], false);
    assert_eq!(anchor["receipt_cids"], json!([cid]));

    let (status, report) = post_json(h.app(), "/v1/anchors/2026-06-10/rebuild", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["matches"], true);
    assert_eq!(report["rebuilt_root"], anchor["merkle_root"]);

    let (status, inclusion) = get(h.app(), &format!("/v1/receipts/{cid}/inclusion")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(inclusion["anchor"]["merkle_root"], anchor["merkle_root"]);
}

#[tokio::test]
async fn bad_anchor_date_is_404() {
    let h = Harness::new();
    let (status, _) = get(h.app(), "/v1/anchors/yesterday").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
