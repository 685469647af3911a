//! Repository and user reference types.
//!
//! Both are owned by the webhook intake; the build pipeline only reads them
//! to resolve the `owner/name` pair the GitHub API needs.

use serde::{Deserialize, Serialize};

use crate::{RepoId, UserId};

/// A GitHub repository the app is installed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub name: String,
    pub user_id: UserId,
    pub description: Option<String>,
}

/// The GitHub account owning one or more repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}
