//! Synchronization errors.

use beeci_db::DbError;
use beeci_github::GitHubError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid build snapshot: {0}")]
    Invariant(beeci_core::Error),

    #[error("lookup failed: {0}")]
    Lookup(DbError),

    #[error("failed to record check run: {0}")]
    Record(DbError),

    #[error(transparent)]
    GitHub(#[from] GitHubError),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
