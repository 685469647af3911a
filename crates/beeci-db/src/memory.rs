//! In-memory store.
//!
//! Implements every repository trait and the change feed. Each build
//! mutation is published to subscribers while the store lock is held, so
//! notifications arrive in write order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use beeci_core::{
    Build, BuildDetails, BuildId, BuildStatus, CheckRunId, Conclusion, NewBuild, Repo, RepoId,
    User, UserId,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    BUILDS_CHANNEL, BuildRepo, ChangeFeed, ChangeSubscription, DbError, DbResult, RepoRepo,
    UserRepo,
};

#[derive(Default)]
struct Inner {
    builds: BTreeMap<BuildId, Build>,
    next_build_id: i64,
    repos: HashMap<RepoId, Repo>,
    users: HashMap<UserId, User>,
    subscribers: Vec<(String, mpsc::UnboundedSender<String>)>,
    failing_subscribes: usize,
}

/// Store kept entirely in process memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    channel: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_channel(BUILDS_CHANNEL)
    }

    /// Publish build changes on `channel` instead of the default.
    pub fn with_channel(channel: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_build_id: 1,
                ..Default::default()
            }),
            channel: channel.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written row behind.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A build by ID regardless of owner.
    pub fn build(&self, id: BuildId) -> Option<Build> {
        self.lock().builds.get(&id).cloned()
    }

    /// Every build, in creation order.
    pub fn builds(&self) -> Vec<Build> {
        self.lock().builds.values().cloned().collect()
    }

    /// Drop every live subscription, as a lost database connection would.
    pub fn disconnect_subscribers(&self) {
        self.lock().subscribers.clear();
    }

    /// Make the next `n` subscribe attempts fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.lock().failing_subscribes = n;
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|(c, tx)| c == channel && !tx.is_closed())
            .count()
    }

    /// Publish an arbitrary payload, bypassing the build table.
    pub fn publish_raw(&self, channel: &str, payload: &str) {
        publish(&mut self.lock(), channel, payload);
    }

    fn mutate<F>(&self, id: BuildId, f: F) -> DbResult<()>
    where
        F: FnOnce(&mut Build) -> DbResult<bool>,
    {
        let mut inner = self.lock();
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;

        if !f(build)? {
            return Ok(());
        }
        build.updated_at = Utc::now().max(build.created_at);

        let payload = serde_json::to_string(&*build).map_err(beeci_core::Error::from)?;
        publish(&mut inner, &self.channel, &payload);
        Ok(())
    }

    fn details(inner: &Inner, build: &Build) -> Option<BuildDetails> {
        let repo = inner.repos.get(&build.repo_id)?;
        let user = inner.users.get(&repo.user_id)?;
        Some(BuildDetails {
            build: build.clone(),
            repo_name: repo.name.clone(),
            user_id: user.id,
            user_name: user.username.clone(),
        })
    }

    fn owned_builds<P>(&self, user_id: UserId, predicate: P) -> Vec<BuildDetails>
    where
        P: Fn(&Build) -> bool,
    {
        let inner = self.lock();
        let mut builds: Vec<_> = inner
            .builds
            .values()
            .filter(|b| predicate(b))
            .filter_map(|b| Self::details(&inner, b))
            .filter(|d| d.user_id == user_id)
            .collect();
        builds.sort_by(|a, b| {
            b.build
                .created_at
                .cmp(&a.build.created_at)
                .then(b.build.id.cmp(&a.build.id))
        });
        builds
    }
}

fn publish(inner: &mut Inner, channel: &str, payload: &str) {
    inner.subscribers.retain(|(subscribed, tx)| {
        if subscribed != channel {
            return !tx.is_closed();
        }
        tx.send(payload.to_string()).is_ok()
    });
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create(&self, new: NewBuild) -> DbResult<BuildId> {
        let mut inner = self.lock();
        let id = BuildId::new(inner.next_build_id);
        inner.next_build_id += 1;

        let now = Utc::now();
        let build = Build {
            id,
            repo_id: new.repo_id,
            commit_sha: new.commit_sha,
            commit_message: new.commit_message,
            installation_id: new.installation_id,
            check_run_id: None,
            status: BuildStatus::Queued,
            conclusion: None,
            created_at: now,
            updated_at: now,
        };
        let payload = serde_json::to_string(&build).map_err(beeci_core::Error::from)?;
        inner.builds.insert(id, build);
        publish(&mut inner, &self.channel, &payload);
        Ok(id)
    }

    async fn update_status(&self, id: BuildId, status: BuildStatus) -> DbResult<()> {
        if status == BuildStatus::Completed {
            return Err(beeci_core::Error::InvalidInput(format!(
                "build {} can only be completed with a conclusion",
                id
            ))
            .into());
        }
        self.mutate(id, |build| {
            build.status = build.status.transition(status)?;
            Ok(true)
        })
    }

    async fn set_conclusion(&self, id: BuildId, conclusion: Conclusion) -> DbResult<()> {
        self.mutate(id, |build| {
            build.status = build.status.transition(BuildStatus::Completed)?;
            build.conclusion = Some(conclusion);
            Ok(true)
        })
    }

    async fn set_check_run_id(&self, id: BuildId, check_run_id: CheckRunId) -> DbResult<()> {
        self.mutate(id, |build| match build.check_run_id {
            None => {
                build.check_run_id = Some(check_run_id);
                Ok(true)
            }
            Some(existing) if existing == check_run_id => Ok(false),
            Some(existing) => Err(DbError::Conflict(format!(
                "build {} already has check run {}",
                id, existing
            ))),
        })
    }

    async fn get(&self, user_id: UserId, id: BuildId) -> DbResult<BuildDetails> {
        let inner = self.lock();
        inner
            .builds
            .get(&id)
            .and_then(|b| Self::details(&inner, b))
            .filter(|d| d.user_id == user_id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn list_by_user(&self, user_id: UserId) -> DbResult<Vec<BuildDetails>> {
        Ok(self.owned_builds(user_id, |_| true))
    }

    async fn list_by_repo(&self, user_id: UserId, repo_id: RepoId) -> DbResult<Vec<BuildDetails>> {
        Ok(self.owned_builds(user_id, |b| b.repo_id == repo_id))
    }

    async fn latest_by_repo(&self, user_id: UserId, repo_id: RepoId) -> DbResult<BuildDetails> {
        self.owned_builds(user_id, |b| b.repo_id == repo_id)
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(format!("builds of repo {}", repo_id)))
    }
}

#[async_trait]
impl RepoRepo for MemoryStore {
    async fn create(&self, repos: &[Repo]) -> DbResult<()> {
        let mut inner = self.lock();
        for repo in repos {
            inner.repos.insert(repo.id, repo.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[RepoId]) -> DbResult<()> {
        let mut inner = self.lock();
        for id in ids {
            inner.repos.remove(id);
        }
        inner.builds.retain(|_, b| !ids.contains(&b.repo_id));
        Ok(())
    }

    async fn get(&self, id: RepoId) -> DbResult<Repo> {
        self.lock()
            .repos
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("repo {}", id)))
    }
}

#[async_trait]
impl UserRepo for MemoryStore {
    async fn upsert(&self, user: User) -> DbResult<()> {
        self.lock().users.insert(user.id, user);
        Ok(())
    }

    async fn get(&self, id: UserId) -> DbResult<User> {
        self.lock()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("user {}", id)))
    }

    async fn delete(&self, id: UserId) -> DbResult<()> {
        let mut inner = self.lock();
        inner.users.remove(&id);
        let owned: Vec<RepoId> = inner
            .repos
            .values()
            .filter(|r| r.user_id == id)
            .map(|r| r.id)
            .collect();
        inner.repos.retain(|_, r| r.user_id != id);
        inner.builds.retain(|_, b| !owned.contains(&b.repo_id));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn subscribe(&self, channel: &str) -> DbResult<Box<dyn ChangeSubscription>> {
        let mut inner = self.lock();
        if inner.failing_subscribes > 0 {
            inner.failing_subscribes -= 1;
            warn!(channel, "Simulated subscribe failure");
            return Err(DbError::ConnectionLost);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push((channel.to_string(), tx));
        Ok(Box::new(MemorySubscription { rx }))
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ChangeSubscription for MemorySubscription {
    async fn recv(&mut self) -> DbResult<String> {
        self.rx.recv().await.ok_or(DbError::ConnectionLost)
    }

    async fn close(&mut self) -> DbResult<()> {
        self.rx.close();
        Ok(())
    }
}
