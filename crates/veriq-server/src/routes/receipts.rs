use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use veriq_core::receipt::Receipt;

use super::{blocking, ApiJson};
use crate::error::AppError;
use crate::state::AppState;

/// GET /v1/receipts/{cid}
pub async fn get_receipt(
    State(app): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let receipt = blocking(&app, move |p| p.receipt(&cid)).await?;
    Ok(Json(serde_json::to_value(&receipt)?))
}

/// GET /v1/receipts/{cid}/inclusion: Merkle proof against the day's anchor.
pub async fn get_inclusion(
    State(app): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let inclusion = blocking(&app, move |p| p.inclusion(&cid)).await?;
    Ok(Json(serde_json::to_value(&inclusion)?))
}

/// Either a stored receipt's cid or a full receipt document.
#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    #[serde(default)]
    pub cid: Option<String>,
    #[serde(default)]
    pub receipt: Option<Receipt>,
}

/// POST /v1/verify/receipt: `{ ok, issues[] }`; integrity problems are
/// reported, not raised.
pub async fn verify(
    State(app): State<AppState>,
    ApiJson(body): ApiJson<VerifyBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let report = match (body.receipt, body.cid) {
        (Some(receipt), _) => blocking(&app, move |p| p.verify_receipt(&receipt)).await?,
        (None, Some(cid)) => blocking(&app, move |p| p.verify_cid(&cid)).await?,
        (None, None) => return Err(AppError::invalid("provide `cid` or `receipt`")),
    };
    Ok(Json(serde_json::to_value(&report)?))
}
