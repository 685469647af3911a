//! GitHub Checks API.

use async_trait::async_trait;
use beeci_core::{BuildStatus, CheckRunId, Conclusion};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::GitHubResult;

/// Body of a check run create or update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckRunPayload {
    pub name: String,
    /// Only sent on create; a check run's commit cannot change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_sha: Option<String>,
    pub external_id: String,
    pub details_url: String,
    pub status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<Conclusion>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Check run operations, authenticated with an installation token.
#[async_trait]
pub trait ChecksApi: Send + Sync {
    async fn create_check_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run: &CheckRunPayload,
    ) -> GitHubResult<CheckRunId>;

    async fn update_check_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        id: CheckRunId,
        run: &CheckRunPayload,
    ) -> GitHubResult<()>;
}
