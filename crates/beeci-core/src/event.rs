//! Typed GitHub webhook events.
//!
//! The `X-GitHub-Event` header selects the variant; the body is then decoded
//! into that variant's payload. Only the fields the pipeline uses are kept.

use serde::Deserialize;

use crate::{InstallationId, NewBuild, Repo, RepoId, Result, User, UserId};

/// A webhook delivery, decoded into the closed set of events BeeCI handles.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Ping,
    CheckSuite(CheckSuiteEvent),
    Installation(InstallationEvent),
    InstallationRepositories(InstallationRepositoriesEvent),
    /// Any other event type, by name.
    Unsupported(String),
}

impl WebhookEvent {
    /// Decode a delivery given its `X-GitHub-Event` header value and raw body.
    pub fn parse(event_type: &str, body: &[u8]) -> Result<Self> {
        let event = match event_type {
            "ping" => WebhookEvent::Ping,
            "check_suite" => WebhookEvent::CheckSuite(serde_json::from_slice(body)?),
            "installation" => WebhookEvent::Installation(serde_json::from_slice(body)?),
            "installation_repositories" => {
                WebhookEvent::InstallationRepositories(serde_json::from_slice(body)?)
            }
            other => WebhookEvent::Unsupported(other.to_string()),
        };
        Ok(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSuiteAction {
    Requested,
    Rerequested,
    Completed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckSuiteEvent {
    pub action: CheckSuiteAction,
    pub check_suite: CheckSuite,
    pub repository: RepositoryPayload,
    pub installation: InstallationRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckSuite {
    pub head_sha: String,
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub message: String,
}

impl CheckSuiteEvent {
    /// The build this event asks for, if it asks for one.
    pub fn build_request(&self) -> Option<NewBuild> {
        match self.action {
            CheckSuiteAction::Requested | CheckSuiteAction::Rerequested => Some(NewBuild {
                repo_id: self.repository.id,
                commit_sha: self.check_suite.head_sha.clone(),
                commit_message: self
                    .check_suite
                    .head_commit
                    .as_ref()
                    .map(|c| c.message.clone())
                    .unwrap_or_default(),
                installation_id: self.installation.id,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationAction {
    Created,
    Deleted,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationEvent {
    pub action: InstallationAction,
    pub installation: Installation,
    #[serde(default)]
    pub repositories: Vec<RepositoryRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationRepositoriesAction {
    Added,
    Removed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationRepositoriesEvent {
    pub action: InstallationRepositoriesAction,
    pub installation: Installation,
    #[serde(default)]
    pub repositories_added: Vec<RepositoryRef>,
    #[serde(default)]
    pub repositories_removed: Vec<RepositoryRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationRef {
    pub id: InstallationId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: InstallationId,
    pub account: Account,
}

impl Installation {
    /// The account that installed the app, as a BeeCI user.
    pub fn owner(&self) -> User {
        User {
            id: self.account.id,
            username: self.account.login.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPayload {
    pub id: RepoId,
    pub name: String,
    pub owner: Account,
}

/// The short repository form used in installation events.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryRef {
    pub id: RepoId,
    pub name: String,
}

impl RepositoryRef {
    pub fn to_repo(&self, owner: UserId) -> Repo {
        Repo {
            id: self.id,
            name: self.name.clone(),
            user_id: owner,
            description: None,
        }
    }
}
