//! Repository traits and implementations.

pub mod build;
pub mod repository;
pub mod user;

pub use build::{BuildRepo, PgBuildRepo};
pub use repository::{PgRepoRepo, RepoRepo};
pub use user::{PgUserRepo, UserRepo};
