use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::error::Result;
use super::AppState;

/// Backfills the execution topic and reports how many records were new.
pub async fn sync_executions(State(state): State<AppState>) -> Result<Json<Value>> {
    let report = state.execution_backfill.trigger().await?;

    Ok(Json(json!({
        "message": "Sync completed successfully",
        "synced_count": report.inserted,
        "status": "success",
    })))
}

pub async fn sync_registrations(State(state): State<AppState>) -> Result<Json<Value>> {
    let report = state.registration_backfill.trigger().await?;

    Ok(Json(json!({
        "message": "Sync completed successfully",
        "events_synced": report.inserted,
    })))
}
