use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": serde_json::to_value(&config)?
    })))
}

/// Partial update. Only new playback sessions see the change.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;
    state
        .update_config(updated.clone())
        .map_err(AppError::ValidationError)?;

    info!(
        drained_event_name = %updated.playback.drained_event_name,
        min_buffer_chunks = updated.playback.min_buffer_chunks,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated; applies to new sessions",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": serde_json::to_value(&updated)?
    })))
}
