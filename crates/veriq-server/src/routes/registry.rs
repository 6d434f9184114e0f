use axum::extract::{Path, State};
use axum::Json;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /v1/capabilities
pub async fn capabilities(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(serde_json::to_value(app.platform.capabilities())?))
}

/// GET /v1/schema/{schema_id}/{version}
pub async fn get_schema(
    State(app): State<AppState>,
    Path((schema_id, version)): Path<(String, u32)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let spec = app.platform.schema(&schema_id, version)?;
    Ok(Json(serde_json::to_value(&spec)?))
}

/// GET /v1/keys: public half of every signing key.
pub async fn keys(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let keys = blocking(&app, |p| p.keys()).await?;
    Ok(Json(serde_json::json!({ "keys": keys })))
}

/// GET /healthz
pub async fn healthz(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let status = blocking(&app, |p| p.status()).await?;
    Ok(Json(serde_json::json!({ "status": "ok", "platform": status })))
}
