//! Worker that runs scheduled builds.

use std::sync::Arc;
use std::time::Duration;

use beeci_config::WorkerConfig;
use beeci_core::{BuildStatus, NewBuild};
use beeci_db::BuildRepo;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::{BuildRunner, SchedulerError, SchedulerResult};

/// Spawns one task per build and tracks them until shutdown.
pub struct Worker {
    builds: Arc<dyn BuildRepo>,
    runner: Arc<dyn BuildRunner>,
    queue_phase: Duration,
    slots: Option<(Arc<Semaphore>, usize)>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Worker {
    pub fn new(
        builds: Arc<dyn BuildRepo>,
        runner: Arc<dyn BuildRunner>,
        config: &WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            builds,
            runner,
            queue_phase: config.queue_phase,
            slots: config
                .max_concurrent
                .map(|n| (Arc::new(Semaphore::new(n)), n)),
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// Start a build. Returns as soon as the build task is spawned.
    ///
    /// With a concurrency limit configured, fails with
    /// [`SchedulerError::Saturated`] instead of waiting for a free slot.
    pub fn schedule(&self, request: NewBuild) -> SchedulerResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        let permit = match &self.slots {
            Some((semaphore, limit)) => Some(
                semaphore
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| SchedulerError::Saturated(*limit))?,
            ),
            None => None,
        };

        let job = Job {
            builds: self.builds.clone(),
            runner: self.runner.clone(),
            queue_phase: self.queue_phase,
            cancel: self.cancel.clone(),
            _permit: permit,
        };
        self.tracker.spawn(job.run(request));
        Ok(())
    }

    /// Number of builds still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Abandon in-flight builds and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Worker stopped");
    }
}

struct Job {
    builds: Arc<dyn BuildRepo>,
    runner: Arc<dyn BuildRunner>,
    queue_phase: Duration,
    cancel: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Job {
    async fn run(self, request: NewBuild) {
        let id = match self.builds.create(request.clone()).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    repo_id = %request.repo_id,
                    commit_sha = %request.commit_sha,
                    error = %e,
                    "Failed to create build"
                );
                return;
            }
        };
        info!(build_id = %id, commit_sha = %request.commit_sha, "Build queued");

        tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!(build_id = %id, status = %BuildStatus::Queued, "Build abandoned");
                return;
            }
            _ = tokio::time::sleep(self.queue_phase) => {}
        }

        if let Err(e) = self.builds.update_status(id, BuildStatus::InProgress).await {
            error!(build_id = %id, error = %e, "Failed to start build");
            return;
        }
        info!(build_id = %id, "Build started");

        let conclusion = tokio::select! {
            _ = self.cancel.cancelled() => {
                warn!(build_id = %id, status = %BuildStatus::InProgress, "Build abandoned");
                return;
            }
            conclusion = self.runner.run(id, &request) => conclusion,
        };

        if let Err(e) = self.builds.set_conclusion(id, conclusion).await {
            error!(build_id = %id, error = %e, "Failed to complete build");
            return;
        }
        info!(build_id = %id, conclusion = %conclusion, "Build completed");
    }
}
