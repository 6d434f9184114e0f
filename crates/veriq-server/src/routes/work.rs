use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use super::blocking;
use crate::error::AppError;
use crate::state::AppState;

/// GET /v1/work/{work_id}
pub async fn get_work(
    State(app): State<AppState>,
    Path(work_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let work = blocking(&app, move |p| p.work(&work_id)).await?;
    Ok(Json(serde_json::to_value(&work)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only events with a higher sequence number.
    #[serde(default)]
    pub after: Option<u32>,
}

/// GET /v1/work/{work_id}/events: the ordered event log (pull side).
pub async fn get_events(
    State(app): State<AppState>,
    Path(work_id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let events = blocking(&app, move |p| p.events(&work_id, q.after)).await?;
    Ok(Json(serde_json::json!({ "events": events })))
}
