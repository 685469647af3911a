//! HTTP routes.

pub mod health;
pub mod webhooks;

use axum::Router;

use crate::AppState;

/// Build the main router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/webhooks", webhooks::router())
        .merge(health::router())
        .with_state(state)
}
