//! Health check endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::warn;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if let Some(pool) = &state.pool {
        sqlx::query("SELECT 1").execute(pool).await.map_err(|e| {
            warn!(error = %e, "Database not ready");
            ApiError::Unavailable("database unavailable".to_string())
        })?;
    }
    Ok(Json(json!({
        "status": "ready",
        "active_builds": state.worker.active(),
    })))
}
