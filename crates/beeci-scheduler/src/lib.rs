//! Build scheduling for BeeCI.
//!
//! Each scheduled build runs as its own task that drives the build row
//! through `queued`, `in_progress` and `completed`. The worker never talks to
//! GitHub; the updater picks the changes up from the store's change feed.

pub mod error;
pub mod runner;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use runner::{BuildRunner, SimulatedRunner};
pub use worker::Worker;
