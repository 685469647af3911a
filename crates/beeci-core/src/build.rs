//! The build entity and its status state machine.
//!
//! A build moves strictly forward through `queued -> in_progress -> completed`.
//! A completed build always carries a [`Conclusion`]; a build that is not
//! completed never does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildId, CheckRunId, Error, InstallationId, RepoId, Result, UserId};

/// Status of a build. Values match the GitHub Check Run `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    InProgress,
    Completed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::InProgress => "in_progress",
            BuildStatus::Completed => "completed",
        }
    }

    /// The only status this one may move to, if any.
    pub fn successor(&self) -> Option<BuildStatus> {
        match self {
            BuildStatus::Queued => Some(BuildStatus::InProgress),
            BuildStatus::InProgress => Some(BuildStatus::Completed),
            BuildStatus::Completed => None,
        }
    }

    /// The status a build must be in to move to this one.
    pub fn predecessor(&self) -> Option<BuildStatus> {
        match self {
            BuildStatus::Queued => None,
            BuildStatus::InProgress => Some(BuildStatus::Queued),
            BuildStatus::Completed => Some(BuildStatus::InProgress),
        }
    }

    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        self.successor() == Some(next)
    }

    /// Validate a transition, returning an error naming both ends on failure.
    pub fn transition(&self, next: BuildStatus) -> Result<BuildStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(BuildStatus::Queued),
            "in_progress" => Ok(BuildStatus::InProgress),
            "completed" => Ok(BuildStatus::Completed),
            _ => Err(Error::InvalidInput(format!("unknown build status: {}", s))),
        }
    }
}

/// Terminal outcome of a completed build.
///
/// See <https://docs.github.com/en/rest/checks/runs#create-a-check-run>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    Canceled,
    TimedOut,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Canceled => "canceled",
            Conclusion::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for Conclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Conclusion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Conclusion::Success),
            "failure" => Ok(Conclusion::Failure),
            "canceled" => Ok(Conclusion::Canceled),
            "timed_out" => Ok(Conclusion::TimedOut),
            _ => Err(Error::InvalidInput(format!("unknown conclusion: {}", s))),
        }
    }
}

/// Request to record and run a new build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBuild {
    pub repo_id: RepoId,
    pub commit_sha: String,
    pub commit_message: String,
    pub installation_id: InstallationId,
}

/// A row of the `builds` table.
///
/// The serde field names match the JSON the database publishes on every
/// change to a build row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub repo_id: RepoId,
    pub commit_sha: String,
    pub commit_message: String,
    pub installation_id: InstallationId,
    pub check_run_id: Option<CheckRunId>,
    pub status: BuildStatus,
    pub conclusion: Option<Conclusion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    /// Decode a change-notification payload.
    pub fn from_notification(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn is_completed(&self) -> bool {
        self.status == BuildStatus::Completed
    }

    /// When the build finished, if it has.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.is_completed().then_some(self.updated_at)
    }

    /// Check that a conclusion is present if and only if the build is completed.
    pub fn check_invariants(&self) -> Result<()> {
        match (self.status, self.conclusion) {
            (BuildStatus::Completed, None) => Err(Error::Invariant(format!(
                "build {} is completed but has no conclusion",
                self.id
            ))),
            (status, Some(conclusion)) if status != BuildStatus::Completed => {
                Err(Error::Invariant(format!(
                    "build {} is {} but has conclusion {}",
                    self.id, status, conclusion
                )))
            }
            _ => Ok(()),
        }
    }

    /// First line of the commit message, for display.
    pub fn title(&self) -> &str {
        self.commit_message.lines().next().unwrap_or_default().trim()
    }
}

/// A build joined with its repository and owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDetails {
    #[serde(flatten)]
    pub build: Build,
    pub repo_name: String,
    pub user_id: UserId,
    pub user_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_build(status: BuildStatus, conclusion: Option<Conclusion>) -> Build {
        let now = Utc::now();
        Build {
            id: BuildId::new(7),
            repo_id: RepoId::new(1),
            commit_sha: "abc123".to_string(),
            commit_message: "Fix the flux capacitor\n\nLonger body".to_string(),
            installation_id: InstallationId::new(42),
            check_run_id: None,
            status,
            conclusion,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_only_moves_forward_one_step() {
        use BuildStatus::*;
        let all = [Queued, InProgress, Completed];
        for from in all {
            for to in all {
                let allowed = matches!((from, to), (Queued, InProgress) | (InProgress, Completed));
                assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
            }
        }
        assert!(Completed.transition(Queued).is_err());
        assert_eq!(Queued.transition(InProgress).unwrap(), InProgress);
    }

    #[test]
    fn test_predecessor_mirrors_successor() {
        for status in [BuildStatus::Queued, BuildStatus::InProgress, BuildStatus::Completed] {
            if let Some(prev) = status.predecessor() {
                assert_eq!(prev.successor(), Some(status));
            }
        }
    }

    #[test]
    fn test_conclusion_iff_completed() {
        assert!(make_build(BuildStatus::Queued, None).check_invariants().is_ok());
        assert!(
            make_build(BuildStatus::Completed, Some(Conclusion::Success))
                .check_invariants()
                .is_ok()
        );
        assert!(make_build(BuildStatus::Completed, None).check_invariants().is_err());
        assert!(
            make_build(BuildStatus::InProgress, Some(Conclusion::Failure))
                .check_invariants()
                .is_err()
        );
    }

    #[test]
    fn test_decode_notification_payload() {
        let payload = r#"{
            "id": 12,
            "repo_id": 1,
            "commit_sha": "abc123",
            "commit_message": "initial commit",
            "installation_id": 42,
            "check_run_id": null,
            "status": "in_progress",
            "conclusion": null,
            "created_at": "2024-06-01T10:00:00.123456+00:00",
            "updated_at": "2024-06-01T10:00:05.5+00:00"
        }"#;

        let build = Build::from_notification(payload).unwrap();
        assert_eq!(build.id, BuildId::new(12));
        assert_eq!(build.status, BuildStatus::InProgress);
        assert_eq!(build.check_run_id, None);
        assert_eq!(build.completed_at(), None);
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        let payload = r#"{"id": 1, "repo_id": 1, "commit_sha": "a", "commit_message": "",
            "installation_id": 1, "check_run_id": null, "status": "exploded",
            "conclusion": null, "created_at": "2024-06-01T10:00:00Z",
            "updated_at": "2024-06-01T10:00:00Z"}"#;
        assert!(matches!(Build::from_notification(payload), Err(Error::Decode(_))));
    }

    #[test]
    fn test_completed_at_and_title() {
        let build = make_build(BuildStatus::Completed, Some(Conclusion::TimedOut));
        assert_eq!(build.completed_at(), Some(build.updated_at));
        assert_eq!(build.title(), "Fix the flux capacitor");
    }

    #[test]
    fn test_status_strings_round_trip_through_from_str() {
        assert_eq!("in_progress".parse::<BuildStatus>().unwrap(), BuildStatus::InProgress);
        assert_eq!("timed_out".parse::<Conclusion>().unwrap(), Conclusion::TimedOut);
        assert!("done".parse::<BuildStatus>().is_err());
    }
}
