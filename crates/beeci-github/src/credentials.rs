//! GitHub App credentials.
//!
//! The App authenticates as itself with a short-lived RS256 JWT, then
//! exchanges that JWT for an installation access token valid for about an
//! hour. Installation tokens are cached until shortly before they expire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use beeci_core::InstallationId;
use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::GitHubResult;

/// Lifetime of an App JWT in seconds. GitHub rejects anything above ten minutes.
const APP_JWT_TTL_SECS: i64 = 600;

#[derive(Debug, Serialize, Deserialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// The App's identity: its ID and RSA private key.
pub struct AppCredentials {
    app_id: i64,
    key: EncodingKey,
}

impl AppCredentials {
    pub fn from_pem(app_id: i64, pem: &[u8]) -> GitHubResult<Self> {
        Ok(Self {
            app_id,
            key: EncodingKey::from_rsa_pem(pem)?,
        })
    }

    pub fn app_id(&self) -> i64 {
        self.app_id
    }

    /// Sign a JWT issued at `now` asserting the App's identity.
    pub fn sign_jwt(&self, now: DateTime<Utc>) -> GitHubResult<String> {
        let claims = AppClaims {
            iat: now.timestamp(),
            exp: now.timestamp() + APP_JWT_TTL_SECS,
            iss: self.app_id.to_string(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }
}

/// An installation access token as returned by GitHub.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Exchanges an App JWT for an installation access token.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(
        &self,
        app_jwt: &str,
        installation_id: InstallationId,
    ) -> GitHubResult<InstallationToken>;
}

/// Source of valid installation access tokens.
#[async_trait]
pub trait InstallationTokens: Send + Sync {
    /// A token for `installation_id` that has not expired.
    async fn token(&self, installation_id: InstallationId) -> GitHubResult<String>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    /// When the cache stops serving this token, ahead of its real expiry.
    stale_at: DateTime<Utc>,
}

/// Caching, single-flight installation token provider.
pub struct CredentialService {
    app: AppCredentials,
    exchange: Arc<dyn TokenExchange>,
    refresh_margin: TimeDelta,
    cache: Mutex<HashMap<InstallationId, CachedToken>>,
    // One refresh at a time per installation; callers that lose the race
    // find the winner's token in the cache.
    refreshing: Mutex<HashMap<InstallationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialService {
    pub fn new(
        app: AppCredentials,
        exchange: Arc<dyn TokenExchange>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            app,
            exchange,
            refresh_margin: TimeDelta::from_std(refresh_margin).unwrap_or(TimeDelta::MAX),
            cache: Mutex::new(HashMap::new()),
            refreshing: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<InstallationId, CachedToken>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self, installation_id: InstallationId) -> Option<String> {
        let now = Utc::now();
        let mut cache = self.cache();
        match cache.get(&installation_id) {
            Some(entry) if now < entry.stale_at => Some(entry.value.clone()),
            Some(_) => {
                cache.remove(&installation_id);
                None
            }
            None => None,
        }
    }

    fn refresh_lock(&self, installation_id: InstallationId) -> Arc<tokio::sync::Mutex<()>> {
        self.refreshing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(installation_id)
            .or_default()
            .clone()
    }

    async fn fetch(&self, installation_id: InstallationId) -> GitHubResult<String> {
        let jwt = self.app.sign_jwt(Utc::now())?;
        let token = self.exchange.exchange(&jwt, installation_id).await?;

        let stale_at = token
            .expires_at
            .checked_sub_signed(self.refresh_margin)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        info!(
            installation_id = %installation_id,
            expires_at = %token.expires_at,
            "Fetched installation token"
        );

        self.cache().insert(
            installation_id,
            CachedToken {
                value: token.token.clone(),
                stale_at,
            },
        );
        Ok(token.token)
    }
}

#[async_trait]
impl InstallationTokens for CredentialService {
    async fn token(&self, installation_id: InstallationId) -> GitHubResult<String> {
        if let Some(token) = self.cached(installation_id) {
            return Ok(token);
        }

        let lock = self.refresh_lock(installation_id);
        let _guard = lock.lock().await;

        if let Some(token) = self.cached(installation_id) {
            debug!(installation_id = %installation_id, "Token refreshed by concurrent caller");
            return Ok(token);
        }
        self.fetch(installation_id).await
    }
}
