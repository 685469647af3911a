//! Mirrors builds onto GitHub check runs.

use std::sync::Arc;

use async_trait::async_trait;
use beeci_config::GitHubAppConfig;
use beeci_core::{Build, BuildStatus, CheckRunId, UserId};
use beeci_db::{BuildRepo, DbError, RepoRepo, UserRepo};
use beeci_github::{CheckRunPayload, ChecksApi, InstallationTokens};
use tracing::{debug, error, info, warn};

use crate::{ChangeHandler, SyncError, SyncResult};

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Created(CheckRunId),
    Updated(CheckRunId),
}

/// Creates a check run the first time it sees a build and updates it on
/// every later change.
pub struct Synchronizer {
    builds: Arc<dyn BuildRepo>,
    repos: Arc<dyn RepoRepo>,
    users: Arc<dyn UserRepo>,
    tokens: Arc<dyn InstallationTokens>,
    checks: Arc<dyn ChecksApi>,
    check_name: String,
    details_url: String,
}

impl Synchronizer {
    pub fn new(
        builds: Arc<dyn BuildRepo>,
        repos: Arc<dyn RepoRepo>,
        users: Arc<dyn UserRepo>,
        tokens: Arc<dyn InstallationTokens>,
        checks: Arc<dyn ChecksApi>,
        config: &GitHubAppConfig,
    ) -> Self {
        Self {
            builds,
            repos,
            users,
            tokens,
            checks,
            check_name: config.check_name.clone(),
            details_url: config.details_url.trim_end_matches('/').to_string(),
        }
    }

    /// Bring the build's check run in line with `build`.
    ///
    /// The check run is created only while neither the snapshot nor the
    /// stored build has a check run ID; every other call is an update with
    /// the snapshot's fields.
    pub async fn reconcile(&self, build: &Build) -> SyncResult<Reconciled> {
        if let Err(e) = build.check_invariants() {
            error!(build_id = %build.id, error = %e, "Refusing to sync build in impossible state");
            return Err(SyncError::Invariant(e));
        }

        let repo = self.repos.get(build.repo_id).await.map_err(SyncError::Lookup)?;
        let owner = self.users.get(repo.user_id).await.map_err(SyncError::Lookup)?;

        let check_run_id = match build.check_run_id {
            Some(id) => Some(id),
            None => self.recorded_check_run_id(build, repo.user_id).await?,
        };
        if check_run_id.is_none() && build.status != BuildStatus::Queued {
            error!(
                build_id = %build.id,
                status = %build.status,
                "Build has no check run past the queued status"
            );
        }

        let token = self.tokens.token(build.installation_id).await?;

        let payload = self.payload(build);
        match check_run_id {
            None => {
                let id = self
                    .checks
                    .create_check_run(&token, &owner.username, &repo.name, &payload)
                    .await?;
                self.builds
                    .set_check_run_id(build.id, id)
                    .await
                    .map_err(|e| {
                        if matches!(e, DbError::Conflict(_)) {
                            error!(build_id = %build.id, check_run_id = %id, "Build got a second check run");
                        }
                        SyncError::Record(e)
                    })?;
                info!(build_id = %build.id, check_run_id = %id, repo = %repo.name, "Created check run");
                Ok(Reconciled::Created(id))
            }
            Some(id) => {
                let payload = CheckRunPayload {
                    head_sha: None,
                    ..payload
                };
                self.checks
                    .update_check_run(&token, &owner.username, &repo.name, id, &payload)
                    .await?;
                info!(
                    build_id = %build.id,
                    check_run_id = %id,
                    status = %build.status,
                    "Updated check run"
                );
                Ok(Reconciled::Updated(id))
            }
        }
    }

    /// Check run ID already stored for a build whose snapshot has none.
    ///
    /// Notifications queue up behind slow GitHub calls, so a snapshot can
    /// predate the `set_check_run_id` of an earlier reconciliation.
    async fn recorded_check_run_id(
        &self,
        build: &Build,
        owner: UserId,
    ) -> SyncResult<Option<CheckRunId>> {
        let stored = self
            .builds
            .get(owner, build.id)
            .await
            .map_err(SyncError::Lookup)?;
        if let Some(id) = stored.build.check_run_id {
            debug!(
                build_id = %build.id,
                check_run_id = %id,
                status = %build.status,
                "Snapshot predates recorded check run"
            );
        }
        Ok(stored.build.check_run_id)
    }

    fn payload(&self, build: &Build) -> CheckRunPayload {
        let title = build.title();
        let name = if title.is_empty() {
            self.check_name.clone()
        } else {
            format!("{}: {}", self.check_name, title)
        };

        CheckRunPayload {
            name,
            head_sha: Some(build.commit_sha.clone()),
            external_id: build.id.to_string(),
            details_url: format!("{}/builds/{}", self.details_url, build.id),
            status: build.status,
            conclusion: build.conclusion,
            started_at: build.created_at,
            completed_at: build.completed_at(),
        }
    }
}

#[async_trait]
impl ChangeHandler for Synchronizer {
    async fn handle(&self, build: &Build) -> SyncResult<()> {
        match self.reconcile(build).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // Only the next change to this build will retry it.
                warn!(build_id = %build.id, status = %build.status, "Build left out of sync with GitHub");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChangeListener, ListenerState};
    use beeci_config::ListenerConfig;
    use beeci_core::{Conclusion, InstallationId, NewBuild, Repo, RepoId, User};
    use beeci_db::{BUILDS_CHANNEL, MemoryStore};
    use beeci_github::{GitHubError, GitHubResult};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Create {
            owner: String,
            repo: String,
            run: CheckRunPayload,
        },
        Update {
            id: CheckRunId,
            run: CheckRunPayload,
        },
    }

    struct MockChecks {
        calls: Mutex<Vec<Call>>,
        next_id: AtomicI64,
        fail: AtomicBool,
    }

    impl MockChecks {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                next_id: AtomicI64::new(9000),
                fail: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn creates(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Create { .. }))
                .count()
        }

        fn check_failure(&self) -> GitHubResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GitHubError::Api {
                    status: 502,
                    message: "Bad gateway".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChecksApi for MockChecks {
        async fn create_check_run(
            &self,
            token: &str,
            owner: &str,
            repo: &str,
            run: &CheckRunPayload,
        ) -> GitHubResult<CheckRunId> {
            assert_eq!(token, "ghs_test");
            self.check_failure()?;
            self.calls.lock().unwrap().push(Call::Create {
                owner: owner.to_string(),
                repo: repo.to_string(),
                run: run.clone(),
            });
            Ok(CheckRunId::new(self.next_id.fetch_add(1, Ordering::SeqCst)))
        }

        async fn update_check_run(
            &self,
            token: &str,
            _owner: &str,
            _repo: &str,
            id: CheckRunId,
            run: &CheckRunPayload,
        ) -> GitHubResult<()> {
            assert_eq!(token, "ghs_test");
            self.check_failure()?;
            self.calls.lock().unwrap().push(Call::Update {
                id,
                run: run.clone(),
            });
            Ok(())
        }
    }

    struct StaticTokens;

    #[async_trait]
    impl InstallationTokens for StaticTokens {
        async fn token(&self, installation_id: InstallationId) -> GitHubResult<String> {
            assert_eq!(installation_id, InstallationId::new(42));
            Ok("ghs_test".to_string())
        }
    }

    fn app_config() -> GitHubAppConfig {
        GitHubAppConfig {
            app_id: 1234,
            private_key_pem: None,
            webhook_secret: None,
            api_url: "https://api.github.com".parse().unwrap(),
            details_url: "https://bee-ci.example/".to_string(),
            check_name: "bee-ci".to_string(),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<MockChecks>, Synchronizer) {
        let store = Arc::new(MemoryStore::new());
        UserRepo::upsert(
            store.as_ref(),
            User {
                id: UserId::new(5),
                username: "bartekpacia".to_string(),
            },
        )
        .await
        .unwrap();
        RepoRepo::create(
            store.as_ref(),
            &[Repo {
                id: RepoId::new(1),
                name: "dumbpkg".to_string(),
                user_id: UserId::new(5),
                description: None,
            }],
        )
        .await
        .unwrap();

        let checks = Arc::new(MockChecks::new());
        let synchronizer = Synchronizer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(StaticTokens),
            checks.clone(),
            &app_config(),
        );
        (store, checks, synchronizer)
    }

    async fn queued_build(store: &MemoryStore) -> Build {
        let id = BuildRepo::create(
            store,
            NewBuild {
                repo_id: RepoId::new(1),
                commit_sha: "abc123".to_string(),
                commit_message: "Add tests\n\nLonger description".to_string(),
                installation_id: InstallationId::new(42),
            },
        )
        .await
        .unwrap();
        store.build(id).unwrap()
    }

    #[tokio::test]
    async fn test_first_sync_creates_check_run_once() {
        let (store, checks, synchronizer) = setup().await;
        let build = queued_build(&store).await;

        let outcome = synchronizer.reconcile(&build).await.unwrap();

        let id = CheckRunId::new(9000);
        assert_eq!(outcome, Reconciled::Created(id));
        assert_eq!(store.build(build.id).unwrap().check_run_id, Some(id));

        let calls = checks.calls();
        assert_eq!(calls.len(), 1);
        let Call::Create { owner, repo, run } = &calls[0] else {
            panic!("expected create");
        };
        assert_eq!(owner, "bartekpacia");
        assert_eq!(repo, "dumbpkg");
        assert_eq!(run.name, "bee-ci: Add tests");
        assert_eq!(run.head_sha.as_deref(), Some("abc123"));
        assert_eq!(run.external_id, build.id.to_string());
        assert_eq!(run.details_url, format!("https://bee-ci.example/builds/{}", build.id));
        assert_eq!(run.status, BuildStatus::Queued);
        assert_eq!(run.started_at, build.created_at);
        assert_eq!(run.conclusion, None);
        assert_eq!(run.completed_at, None);
    }

    #[tokio::test]
    async fn test_completed_build_with_check_run_is_updated() {
        let (store, checks, synchronizer) = setup().await;
        let queued = queued_build(&store).await;
        store.set_check_run_id(queued.id, CheckRunId::new(77)).await.unwrap();
        store.update_status(queued.id, BuildStatus::InProgress).await.unwrap();
        store.set_conclusion(queued.id, Conclusion::Failure).await.unwrap();
        let build = store.build(queued.id).unwrap();

        let outcome = synchronizer.reconcile(&build).await.unwrap();

        assert_eq!(outcome, Reconciled::Updated(CheckRunId::new(77)));
        assert_eq!(checks.creates(), 0);
        let calls = checks.calls();
        assert_eq!(calls.len(), 1);
        let Call::Update { id, run } = &calls[0] else {
            panic!("expected update");
        };
        assert_eq!(*id, CheckRunId::new(77));
        assert_eq!(run.head_sha, None);
        assert_eq!(run.status, BuildStatus::Completed);
        assert_eq!(run.conclusion, Some(Conclusion::Failure));
        assert_eq!(run.completed_at, Some(build.updated_at));
    }

    #[tokio::test]
    async fn test_same_snapshot_twice_sends_identical_updates() {
        let (store, checks, synchronizer) = setup().await;
        let mut build = queued_build(&store).await;
        build.check_run_id = Some(CheckRunId::new(77));

        synchronizer.reconcile(&build).await.unwrap();
        synchronizer.reconcile(&build).await.unwrap();

        let calls = checks.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(checks.creates(), 0);
    }

    #[tokio::test]
    async fn test_impossible_snapshot_is_rejected() {
        let (store, checks, synchronizer) = setup().await;
        let mut build = queued_build(&store).await;
        build.status = BuildStatus::Completed;

        assert!(matches!(
            synchronizer.reconcile(&build).await,
            Err(SyncError::Invariant(_))
        ));

        build.status = BuildStatus::InProgress;
        build.conclusion = Some(Conclusion::Success);
        assert!(matches!(
            synchronizer.reconcile(&build).await,
            Err(SyncError::Invariant(_))
        ));
        assert!(checks.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unsynced_build_past_queued_still_gets_created() {
        let (store, checks, synchronizer) = setup().await;
        let queued = queued_build(&store).await;
        store.update_status(queued.id, BuildStatus::InProgress).await.unwrap();
        let build = store.build(queued.id).unwrap();

        let outcome = synchronizer.reconcile(&build).await.unwrap();
        assert!(matches!(outcome, Reconciled::Created(_)));
        assert_eq!(checks.creates(), 1);
    }

    #[tokio::test]
    async fn test_stale_snapshot_updates_recorded_check_run() {
        let (store, checks, synchronizer) = setup().await;
        let queued = queued_build(&store).await;
        store.update_status(queued.id, BuildStatus::InProgress).await.unwrap();
        let mut in_progress = store.build(queued.id).unwrap();

        let first = synchronizer.reconcile(&queued).await.unwrap();
        let id = CheckRunId::new(9000);
        assert_eq!(first, Reconciled::Created(id));

        // Read before the check run ID was recorded.
        in_progress.check_run_id = None;
        let second = synchronizer.reconcile(&in_progress).await.unwrap();

        assert_eq!(second, Reconciled::Updated(id));
        assert_eq!(checks.creates(), 1);
        assert_eq!(store.build(queued.id).unwrap().check_run_id, Some(id));
        let calls = checks.calls();
        let Call::Update { id: updated, run } = &calls[1] else {
            panic!("expected update");
        };
        assert_eq!(*updated, id);
        assert_eq!(run.status, BuildStatus::InProgress);
        assert_eq!(run.head_sha, None);
    }

    #[tokio::test]
    async fn test_missing_repository_aborts() {
        let (store, checks, synchronizer) = setup().await;
        let mut build = queued_build(&store).await;
        build.repo_id = RepoId::new(404);

        assert!(matches!(
            synchronizer.reconcile(&build).await,
            Err(SyncError::Lookup(DbError::NotFound(_)))
        ));
        assert!(checks.calls().is_empty());
    }

    #[tokio::test]
    async fn test_api_failure_leaves_check_run_unset() {
        let (store, checks, synchronizer) = setup().await;
        let build = queued_build(&store).await;
        checks.fail.store(true, Ordering::SeqCst);

        assert!(matches!(
            synchronizer.reconcile(&build).await,
            Err(SyncError::GitHub(_))
        ));
        assert_eq!(store.build(build.id).unwrap().check_run_id, None);

        // The next change retries, and creates.
        checks.fail.store(false, Ordering::SeqCst);
        let outcome = synchronizer.reconcile(&build).await.unwrap();
        assert!(matches!(outcome, Reconciled::Created(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_drives_synchronizer() {
        let (store, checks, synchronizer) = setup().await;
        let listener = Arc::new(ChangeListener::new(
            store.clone(),
            Arc::new(synchronizer),
            ListenerConfig {
                channel: BUILDS_CHANNEL.to_string(),
                ..Default::default()
            },
        ));
        let mut state = listener.state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let listener = listener.clone();
            let cancel = cancel.clone();
            async move { listener.run(cancel).await }
        });
        state
            .wait_for(|s| *s == ListenerState::Subscribed)
            .await
            .unwrap();

        let build = queued_build(&store).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.update_status(build.id, BuildStatus::InProgress).await.unwrap();
        store.set_conclusion(build.id, Conclusion::Success).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        // queued -> create; check run recorded, in_progress, completed -> updates.
        assert_eq!(checks.creates(), 1);
        let statuses: Vec<_> = checks
            .calls()
            .iter()
            .map(|c| match c {
                Call::Create { run, .. } | Call::Update { run, .. } => run.status,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                BuildStatus::Queued,
                BuildStatus::Queued,
                BuildStatus::InProgress,
                BuildStatus::Completed
            ]
        );

        cancel.cancel();
        task.await.unwrap();
    }
}
