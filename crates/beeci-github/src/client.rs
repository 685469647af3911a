//! HTTP client for the GitHub REST API.

use std::time::Duration;

use async_trait::async_trait;
use beeci_core::{CheckRunId, InstallationId};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::{CheckRunPayload, ChecksApi, GitHubError, GitHubResult, InstallationToken, TokenExchange};

const USER_AGENT: &str = "BeeCI";

/// Bounds each API call, and with it how long shutdown waits on a reconciliation.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// GitHub API client.
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: Url,
}

#[derive(Deserialize)]
struct CheckRunResponse {
    id: CheckRunId,
}

impl GitHubClient {
    pub fn new(api_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_url.as_str().trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder, bearer: &str) -> RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", bearer))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .timeout(REQUEST_TIMEOUT)
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder, action: &str) -> GitHubResult<T> {
        let response = request
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;
        Self::check(response, action)
            .await?
            .json()
            .await
            .map_err(|e| GitHubError::Parse(e.to_string()))
    }

    async fn check(response: Response, action: &str) -> GitHubResult<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        Err(GitHubError::Api {
            status,
            message: format!("{}: {}", action, text),
        })
    }
}

#[async_trait]
impl TokenExchange for GitHubClient {
    async fn exchange(
        &self,
        app_jwt: &str,
        installation_id: InstallationId,
    ) -> GitHubResult<InstallationToken> {
        let url = self.endpoint(&format!("/app/installations/{}/access_tokens", installation_id));
        let request = self.authorized(self.client.post(&url), app_jwt);
        Self::send(request, "Failed to create installation token").await
    }
}

#[async_trait]
impl ChecksApi for GitHubClient {
    async fn create_check_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run: &CheckRunPayload,
    ) -> GitHubResult<CheckRunId> {
        let url = self.endpoint(&format!("/repos/{}/{}/check-runs", owner, repo));
        let request = self.authorized(self.client.post(&url), token).json(run);
        let created: CheckRunResponse = Self::send(request, "Failed to create check run").await?;
        Ok(created.id)
    }

    async fn update_check_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        id: CheckRunId,
        run: &CheckRunPayload,
    ) -> GitHubResult<()> {
        let url = self.endpoint(&format!("/repos/{}/{}/check-runs/{}", owner, repo, id));
        let request = self.authorized(self.client.patch(&url), token).json(run);
        let _: serde_json::Value = Self::send(request, "Failed to update check run").await?;
        Ok(())
    }
}
