//! GitHub App webhook endpoint.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use beeci_core::event::{
    CheckSuiteEvent, InstallationAction, InstallationEvent, InstallationRepositoriesAction,
    InstallationRepositoriesEvent,
};
use beeci_core::{RepoId, WebhookEvent};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/github", post(github_webhook))
}

/// Handle GitHub webhook events.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let delivery = headers
        .get("X-GitHub-Delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_github_signature(secret, &body, signature) {
            warn!(event = %event_type, delivery, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    let event = WebhookEvent::parse(event_type, &body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid payload: {}", e)))?;
    info!(event = %event_type, delivery, "Received GitHub webhook");

    match event {
        WebhookEvent::Ping => {
            info!("Ping event received - webhook is configured correctly");
        }
        WebhookEvent::CheckSuite(suite) => handle_check_suite(&state, suite)?,
        WebhookEvent::Installation(event) => handle_installation(&state, event).await?,
        WebhookEvent::InstallationRepositories(event) => {
            handle_installation_repositories(&state, event).await?
        }
        WebhookEvent::Unsupported(name) => {
            info!(event = %name, "Unhandled event type");
        }
    }

    Ok(StatusCode::OK)
}

fn handle_check_suite(state: &AppState, suite: CheckSuiteEvent) -> Result<(), ApiError> {
    let Some(request) = suite.build_request() else {
        info!(action = ?suite.action, repo = %suite.repository.name, "Ignoring check suite action");
        return Ok(());
    };

    info!(
        repo = %suite.repository.name,
        commit_sha = %request.commit_sha,
        installation_id = %request.installation_id,
        "Scheduling build"
    );
    state.worker.schedule(request)?;
    Ok(())
}

async fn handle_installation(state: &AppState, event: InstallationEvent) -> Result<(), ApiError> {
    let owner = event.installation.owner();
    match event.action {
        InstallationAction::Created => {
            let repos: Vec<_> = event
                .repositories
                .iter()
                .map(|r| r.to_repo(owner.id))
                .collect();
            info!(
                installation_id = %event.installation.id,
                user = %owner.username,
                repos = repos.len(),
                "App installed"
            );
            state.users.upsert(owner).await?;
            state.repos.create(&repos).await?;
        }
        InstallationAction::Deleted => {
            info!(
                installation_id = %event.installation.id,
                user = %owner.username,
                "App uninstalled"
            );
        }
        InstallationAction::Other => {}
    }
    Ok(())
}

async fn handle_installation_repositories(
    state: &AppState,
    event: InstallationRepositoriesEvent,
) -> Result<(), ApiError> {
    let owner = event.installation.owner();
    match event.action {
        InstallationRepositoriesAction::Added => {
            let repos: Vec<_> = event
                .repositories_added
                .iter()
                .map(|r| r.to_repo(owner.id))
                .collect();
            info!(user = %owner.username, repos = repos.len(), "Repositories added");
            state.users.upsert(owner).await?;
            state.repos.create(&repos).await?;
        }
        InstallationRepositoriesAction::Removed => {
            let ids: Vec<RepoId> = event.repositories_removed.iter().map(|r| r.id).collect();
            info!(user = %owner.username, repos = ids.len(), "Repositories removed");
            state.repos.delete(&ids).await?;
        }
        InstallationRepositoriesAction::Other => {}
    }
    Ok(())
}

/// Verify an `X-Hub-Signature-256` header against the raw body.
fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}
