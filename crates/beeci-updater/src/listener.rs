//! Change listener.
//!
//! Subscribes to the build change channel and delivers each decoded build to
//! a [`ChangeHandler`], in the order the channel delivers them. A lost
//! subscription is replaced after an exponential backoff; changes published
//! while disconnected are not replayed. Cancellation is observed between
//! changes: a change already handed to the handler runs to completion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beeci_config::ListenerConfig;
use beeci_core::Build;
use beeci_db::{ChangeFeed, ChangeSubscription, DbError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SyncResult;

/// Receives every build change the listener decodes.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(&self, build: &Build) -> SyncResult<()>;
}

/// Where the listener is in its subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Subscribed,
    Delivering,
}

enum Interrupted {
    Cancelled,
    Lost(DbError),
}

pub struct ChangeListener {
    feed: Arc<dyn ChangeFeed>,
    handler: Arc<dyn ChangeHandler>,
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
}

impl ChangeListener {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        handler: Arc<dyn ChangeHandler>,
        config: ListenerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            feed,
            handler,
            config,
            state,
        }
    }

    /// Watch the listener's state.
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Listen until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let channel = self.config.channel.as_str();
        let mut backoff = self.config.min_reconnect;

        loop {
            self.state.send_replace(ListenerState::Disconnected);

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.feed.subscribe(channel) => result,
            };

            let mut subscription = match subscribed {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(channel, error = %e, retry_in = ?backoff, "Failed to subscribe to build changes");
                    if !sleep_or_cancel(backoff, &cancel).await {
                        break;
                    }
                    backoff = self.next_backoff(backoff);
                    continue;
                }
            };

            info!(channel, "Subscribed to build changes");
            self.state.send_replace(ListenerState::Subscribed);
            backoff = self.config.min_reconnect;

            match self.deliver(subscription.as_mut(), &cancel).await {
                Interrupted::Cancelled => {
                    if let Err(e) = subscription.close().await {
                        debug!(channel, error = %e, "Failed to close subscription");
                    }
                    break;
                }
                Interrupted::Lost(e) => {
                    self.state.send_replace(ListenerState::Disconnected);
                    warn!(channel, error = %e, retry_in = ?backoff, "Lost build change subscription");
                    if !sleep_or_cancel(backoff, &cancel).await {
                        break;
                    }
                    backoff = self.next_backoff(backoff);
                }
            }
        }

        self.state.send_replace(ListenerState::Disconnected);
        info!(channel, "Change listener stopped");
    }

    async fn deliver(
        &self,
        subscription: &mut dyn ChangeSubscription,
        cancel: &CancellationToken,
    ) -> Interrupted {
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => return Interrupted::Cancelled,
                received = subscription.recv() => match received {
                    Ok(payload) => payload,
                    Err(e) => return Interrupted::Lost(e),
                },
            };
            self.state.send_replace(ListenerState::Delivering);

            let build = match Build::from_notification(&payload) {
                Ok(build) => build,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed build notification");
                    continue;
                }
            };
            debug!(build_id = %build.id, status = %build.status, "Build changed");

            // Not raced against `cancel`: a check run created on GitHub must
            // get its ID recorded.
            if let Err(e) = self.handler.handle(&build).await {
                warn!(build_id = %build.id, error = %e, "Failed to handle build change");
            }
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.config.max_reconnect)
    }
}

/// Returns false if cancelled before `duration` elapsed.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beeci_core::{BuildId, BuildStatus, InstallationId, NewBuild, RepoId};
    use beeci_db::{BUILDS_CHANNEL, BuildRepo, MemoryStore};
    use std::sync::Mutex;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<(BuildId, BuildStatus)>>,
    }

    impl RecordingHandler {
        fn seen(&self) -> Vec<(BuildId, BuildStatus)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChangeHandler for RecordingHandler {
        async fn handle(&self, build: &Build) -> SyncResult<()> {
            self.seen.lock().unwrap().push((build.id, build.status));
            Ok(())
        }
    }

    fn config() -> ListenerConfig {
        ListenerConfig {
            channel: BUILDS_CHANNEL.to_string(),
            min_reconnect: Duration::from_secs(10),
            max_reconnect: Duration::from_secs(60),
        }
    }

    fn new_build() -> NewBuild {
        NewBuild {
            repo_id: RepoId::new(1),
            commit_sha: "abc123".to_string(),
            commit_message: "Add tests".to_string(),
            installation_id: InstallationId::new(42),
        }
    }

    fn start(
        store: &Arc<MemoryStore>,
        handler: &Arc<RecordingHandler>,
    ) -> (Arc<ChangeListener>, CancellationToken, JoinHandle<()>) {
        let listener = Arc::new(ChangeListener::new(store.clone(), handler.clone(), config()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let listener = listener.clone();
            let cancel = cancel.clone();
            async move { listener.run(cancel).await }
        });
        (listener, cancel, task)
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_order_and_skips_malformed() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::default());
        let (listener, cancel, task) = start(&store, &handler);

        advance(1).await;
        assert_eq!(*listener.state().borrow(), ListenerState::Subscribed);

        let id = BuildRepo::create(store.as_ref(), new_build()).await.unwrap();
        store.publish_raw(BUILDS_CHANNEL, "{not json");
        store.publish_raw(BUILDS_CHANNEL, r#"{"id": 1, "status": "exploded"}"#);
        store.update_status(id, BuildStatus::InProgress).await.unwrap();
        advance(1).await;

        assert_eq!(
            handler.seen(),
            vec![(id, BuildStatus::Queued), (id, BuildStatus::InProgress)]
        );
        assert_eq!(*listener.state().borrow(), ListenerState::Delivering);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_connection_loss() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::default());
        let (listener, cancel, task) = start(&store, &handler);

        advance(1).await;
        store.disconnect_subscribers();
        advance(5).await;
        assert_eq!(*listener.state().borrow(), ListenerState::Disconnected);
        assert_eq!(store.subscriber_count(BUILDS_CHANNEL), 0);

        // Published while disconnected: lost.
        let lost = BuildRepo::create(store.as_ref(), new_build()).await.unwrap();

        advance(10).await;
        assert_eq!(store.subscriber_count(BUILDS_CHANNEL), 1);

        let delivered = BuildRepo::create(store.as_ref(), new_build()).await.unwrap();
        advance(1).await;
        assert_eq!(handler.seen(), vec![(delivered, BuildStatus::Queued)]);
        assert_ne!(lost, delivered);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failures_back_off_exponentially() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_subscribes(2);
        let handler = Arc::new(RecordingHandler::default());
        let (_listener, cancel, task) = start(&store, &handler);

        // Attempts at t=0 and t=10 fail; the next waits 20s.
        advance(29).await;
        assert_eq!(store.subscriber_count(BUILDS_CHANNEL), 0);
        advance(2).await;
        assert_eq!(store.subscriber_count(BUILDS_CHANNEL), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_backoff_is_capped() {
        let store = Arc::new(MemoryStore::new());
        let listener = ChangeListener::new(
            store,
            Arc::new(RecordingHandler::default()),
            config(),
        );
        let mut backoff = Duration::from_secs(10);
        let mut steps = Vec::new();
        for _ in 0..4 {
            backoff = listener.next_backoff(backoff);
            steps.push(backoff.as_secs());
        }
        assert_eq!(steps, vec![20, 40, 60, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_closes_subscription() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::default());
        let (listener, cancel, task) = start(&store, &handler);

        advance(1).await;
        assert_eq!(store.subscriber_count(BUILDS_CHANNEL), 1);

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(store.subscriber_count(BUILDS_CHANNEL), 0);
        assert_eq!(*listener.state().borrow(), ListenerState::Disconnected);
    }

    struct SlowHandler {
        inner: RecordingHandler,
    }

    #[async_trait]
    impl ChangeHandler for SlowHandler {
        async fn handle(&self, build: &Build) -> SyncResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.inner.handle(build).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_lets_current_change_finish() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(SlowHandler {
            inner: RecordingHandler::default(),
        });
        let listener = Arc::new(ChangeListener::new(store.clone(), handler.clone(), config()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let listener = listener.clone();
            let cancel = cancel.clone();
            async move { listener.run(cancel).await }
        });

        advance(1).await;
        let id = BuildRepo::create(store.as_ref(), new_build()).await.unwrap();
        advance(1).await;
        assert!(handler.inner.seen().is_empty());

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(handler.inner.seen(), vec![(id, BuildStatus::Queued)]);
        assert_eq!(store.subscriber_count(BUILDS_CHANNEL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_subscribes(1);
        let handler = Arc::new(RecordingHandler::default());
        let (_listener, cancel, task) = start(&store, &handler);

        advance(1).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(store.subscriber_count(BUILDS_CHANNEL), 0);
    }
}
