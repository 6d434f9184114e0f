use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use veriq_core::types::{FailureReport, StageTime, WorkReport};

use super::{blocking, ApiJson};
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AcquireBody {
    pub topic: String,
    pub worker_id: String,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// POST /v1/leases/acquire: `{ "lease": null }` when nothing is ready.
pub async fn acquire(
    State(app): State<AppState>,
    ApiJson(body): ApiJson<AcquireBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let lease =
        blocking(&app, move |p| p.acquire(&body.topic, &body.worker_id, body.ttl_ms)).await?;
    Ok(Json(serde_json::json!({ "lease": lease })))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    pub worker_id: String,
    #[serde(default)]
    pub progress: Option<StageTime>,
}

/// POST /v1/leases/{work_id}/heartbeat
pub async fn heartbeat(
    State(app): State<AppState>,
    Path(work_id): Path<String>,
    ApiJson(body): ApiJson<HeartbeatBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let lease =
        blocking(&app, move |p| p.heartbeat(&work_id, &body.worker_id, body.progress)).await?;
    Ok(Json(serde_json::to_value(&lease)?))
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    pub worker_id: String,
    #[serde(flatten)]
    pub report: WorkReport,
}

/// POST /v1/leases/{work_id}/complete: returns the signed receipt.
pub async fn complete(
    State(app): State<AppState>,
    Path(work_id): Path<String>,
    ApiJson(body): ApiJson<CompleteBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let receipt =
        blocking(&app, move |p| p.complete(&work_id, &body.worker_id, body.report)).await?;
    Ok(Json(serde_json::to_value(&receipt)?))
}

#[derive(Debug, Deserialize)]
pub struct FailBody {
    pub worker_id: String,
    #[serde(flatten)]
    pub report: FailureReport,
}

/// POST /v1/leases/{work_id}/fail: worker-reported failure.
pub async fn fail(
    State(app): State<AppState>,
    Path(work_id): Path<String>,
    ApiJson(body): ApiJson<FailBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let receipt = blocking(&app, move |p| p.fail(&work_id, &body.worker_id, body.report)).await?;
    Ok(Json(serde_json::to_value(&receipt)?))
}

/// POST /v1/leases/sweep
pub async fn sweep(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let report = blocking(&app, |p| p.sweep()).await?;
    Ok(Json(serde_json::to_value(&report)?))
}
