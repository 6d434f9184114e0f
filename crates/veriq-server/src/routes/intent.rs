use axum::extract::State;
use axum::Json;
use veriq_core::intent::{CommitRequest, ProposeRequest, SubmitRequest};
use veriq_core::types::CommitResponse;

use super::{blocking, ApiJson};
use crate::error::AppError;
use crate::state::AppState;

/// Commit responses carry `code: IDEM_DUPLICATE` when they resolve to an
/// existing record; the status stays 200.
fn commit_body(resp: CommitResponse) -> Result<Json<serde_json::Value>, AppError> {
    let mut body = serde_json::to_value(&resp)?;
    if let Some(code) = resp.code() {
        body["code"] = serde_json::to_value(code)?;
    }
    Ok(Json(body))
}

/// POST /v1/intent/propose: draft in, plan preview or repair request out.
pub async fn propose(
    State(app): State<AppState>,
    ApiJson(req): ApiJson<ProposeRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let outcome = blocking(&app, move |p| p.propose(&req)).await?;
    Ok(Json(serde_json::to_value(&outcome)?))
}

/// POST /v1/intent/commit
pub async fn commit(
    State(app): State<AppState>,
    ApiJson(req): ApiJson<CommitRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let resp = blocking(&app, move |p| p.commit(&req)).await?;
    commit_body(resp)
}

/// POST /v1/work: direct submission of a complete work unit.
pub async fn submit(
    State(app): State<AppState>,
    ApiJson(req): ApiJson<SubmitRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let resp = blocking(&app, move |p| p.submit(&req)).await?;
    commit_body(resp)
}
