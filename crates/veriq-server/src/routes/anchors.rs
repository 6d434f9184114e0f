use axum::extract::{Path, State};
use axum::Json;
use veriq_core::anchor::parse_day;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /v1/anchors/{date}: sealed anchor, or the provisional one for an
/// open day.
pub async fn get_anchor(
    State(app): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let day = parse_day(&date)?;
    let anchor = blocking(&app, move |p| p.anchor(day)).await?;
    Ok(Json(serde_json::to_value(&anchor)?))
}

/// POST /v1/anchors/{date}/rebuild: recompute and compare.
pub async fn rebuild_anchor(
    State(app): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let day = parse_day(&date)?;
    let report = blocking(&app, move |p| p.rebuild_anchor(day)).await?;
    Ok(Json(serde_json::to_value(&report)?))
}
