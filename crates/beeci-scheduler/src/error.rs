//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("all {0} build slots are busy")]
    Saturated(usize),

    #[error("worker is shutting down")]
    ShuttingDown,
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
