//! Build execution.

use std::time::Duration;

use async_trait::async_trait;
use beeci_core::{BuildId, Conclusion, NewBuild};
use tracing::debug;

/// Runs an in-progress build to its conclusion.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run(&self, id: BuildId, build: &NewBuild) -> Conclusion;
}

/// Stands in for a real executor: waits out the run phase, then succeeds or
/// fails with equal probability.
pub struct SimulatedRunner {
    run_phase: Duration,
}

impl SimulatedRunner {
    pub fn new(run_phase: Duration) -> Self {
        Self { run_phase }
    }
}

#[async_trait]
impl BuildRunner for SimulatedRunner {
    async fn run(&self, id: BuildId, build: &NewBuild) -> Conclusion {
        debug!(build_id = %id, commit_sha = %build.commit_sha, "Simulating build");
        tokio::time::sleep(self.run_phase).await;

        if rand::random::<bool>() {
            Conclusion::Success
        } else {
            Conclusion::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beeci_core::{InstallationId, RepoId};

    #[tokio::test(start_paused = true)]
    async fn test_simulated_runner_waits_and_concludes() {
        let runner = SimulatedRunner::new(Duration::from_secs(5));
        let build = NewBuild {
            repo_id: RepoId::new(1),
            commit_sha: "abc123".to_string(),
            commit_message: String::new(),
            installation_id: InstallationId::new(42),
        };

        let start = tokio::time::Instant::now();
        let conclusion = runner.run(BuildId::new(1), &build).await;

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(matches!(conclusion, Conclusion::Success | Conclusion::Failure));
    }
}
