//! Core domain types for the BeeCI build pipeline.
//!
//! This crate contains:
//! - Numeric identifiers shared with GitHub
//! - The build entity and its status state machine
//! - Repository and user reference types
//! - Typed GitHub webhook events

pub mod build;
pub mod error;
pub mod event;
pub mod id;
pub mod repository;

pub use build::{Build, BuildDetails, BuildStatus, Conclusion, NewBuild};
pub use error::{Error, Result};
pub use event::WebhookEvent;
pub use id::{BuildId, CheckRunId, InstallationId, RepoId, UserId};
pub use repository::{Repo, User};
