//! Application state.

use std::sync::Arc;

use beeci_db::{RepoRepo, UserRepo};
use beeci_scheduler::Worker;
use sqlx::PgPool;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub worker: Arc<Worker>,
    pub repos: Arc<dyn RepoRepo>,
    pub users: Arc<dyn UserRepo>,
    pub webhook_secret: Option<Arc<str>>,
    /// Checked by the readiness probe; absent when running without a database.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        worker: Arc<Worker>,
        repos: Arc<dyn RepoRepo>,
        users: Arc<dyn UserRepo>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            worker,
            repos,
            users,
            webhook_secret: webhook_secret.map(Arc::from),
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }
}
