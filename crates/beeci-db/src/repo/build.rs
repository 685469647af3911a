//! Build repository.

use async_trait::async_trait;
use beeci_core::{
    Build, BuildDetails, BuildId, BuildStatus, CheckRunId, Conclusion, InstallationId, NewBuild,
    RepoId, UserId,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A build record in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: i64,
    pub repo_id: i64,
    pub commit_sha: String,
    pub commit_message: String,
    pub installation_id: i64,
    pub check_run_id: Option<i64>,
    pub status: String,
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<BuildRecord> for Build {
    type Error = DbError;

    fn try_from(record: BuildRecord) -> DbResult<Self> {
        Ok(Build {
            id: BuildId::new(record.id),
            repo_id: RepoId::new(record.repo_id),
            commit_sha: record.commit_sha,
            commit_message: record.commit_message,
            installation_id: InstallationId::new(record.installation_id),
            check_run_id: record.check_run_id.map(CheckRunId::new),
            status: record.status.parse::<BuildStatus>()?,
            conclusion: record.conclusion.as_deref().map(str::parse::<Conclusion>).transpose()?,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// A build record joined with its repository and owner.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildDetailsRecord {
    #[sqlx(flatten)]
    pub build: BuildRecord,
    pub repo_name: String,
    pub user_id: i64,
    pub user_name: String,
}

impl TryFrom<BuildDetailsRecord> for BuildDetails {
    type Error = DbError;

    fn try_from(record: BuildDetailsRecord) -> DbResult<Self> {
        Ok(BuildDetails {
            build: record.build.try_into()?,
            repo_name: record.repo_name,
            user_id: UserId::new(record.user_id),
            user_name: record.user_name,
        })
    }
}

/// Persisted builds.
///
/// Every mutation publishes the changed row on the builds change channel
/// (see [`crate::ChangeFeed`]). Implementations must preserve this: the
/// check run synchronizer only learns about builds through it.
#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Record a new build in the `queued` status.
    async fn create(&self, build: NewBuild) -> DbResult<BuildId>;

    /// Move a build one step forward to `status`.
    async fn update_status(&self, id: BuildId, status: BuildStatus) -> DbResult<()>;

    /// Complete an in-progress build with `conclusion`.
    async fn set_conclusion(&self, id: BuildId, conclusion: Conclusion) -> DbResult<()>;

    /// Record the GitHub check run created for a build. Setting the same ID
    /// again is a no-op; setting a different one is a conflict.
    async fn set_check_run_id(&self, id: BuildId, check_run_id: CheckRunId) -> DbResult<()>;

    /// Get a build owned by `user_id`.
    async fn get(&self, user_id: UserId, id: BuildId) -> DbResult<BuildDetails>;

    /// All builds across the user's repositories, newest first.
    async fn list_by_user(&self, user_id: UserId) -> DbResult<Vec<BuildDetails>>;

    /// All builds of one repository, newest first.
    async fn list_by_repo(&self, user_id: UserId, repo_id: RepoId) -> DbResult<Vec<BuildDetails>>;

    /// The most recent build of a repository.
    async fn latest_by_repo(&self, user_id: UserId, repo_id: RepoId) -> DbResult<BuildDetails>;
}

const DETAILS_SELECT: &str = r#"
    SELECT builds.*, repos.name AS repo_name, users.id AS user_id, users.username AS user_name
    FROM builds
    JOIN repos ON builds.repo_id = repos.id
    JOIN users ON repos.user_id = users.id
"#;

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_status(&self, id: BuildId) -> DbResult<BuildStatus> {
        let status: String = sqlx::query_scalar("SELECT status FROM builds WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        Ok(status.parse::<BuildStatus>()?)
    }

    /// Explain why a guarded UPDATE touched no rows.
    async fn rejected_transition(&self, id: BuildId, to: BuildStatus) -> DbError {
        match self.current_status(id).await {
            Ok(current) => match current.transition(to) {
                Err(e) => e.into(),
                // Raced with another writer between the UPDATE and this read.
                Ok(_) => DbError::Conflict(format!("build {} changed concurrently", id)),
            },
            Err(e) => e,
        }
    }

    async fn fetch_details(&self, sql: &str, binds: &[i64]) -> DbResult<Vec<BuildDetails>> {
        let mut query = sqlx::query_as::<_, BuildDetailsRecord>(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BuildDetails::try_from)
            .collect()
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create(&self, build: NewBuild) -> DbResult<BuildId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO builds (repo_id, commit_sha, commit_message, installation_id, status)
            VALUES ($1, $2, $3, $4, 'queued')
            RETURNING id
            "#,
        )
        .bind(build.repo_id.get())
        .bind(&build.commit_sha)
        .bind(&build.commit_message)
        .bind(build.installation_id.get())
        .fetch_one(&self.pool)
        .await?;
        Ok(BuildId::new(id))
    }

    async fn update_status(&self, id: BuildId, status: BuildStatus) -> DbResult<()> {
        // Completion goes through set_conclusion so the conclusion is written atomically.
        if status == BuildStatus::Completed {
            return Err(beeci_core::Error::InvalidInput(format!(
                "build {} can only be completed with a conclusion",
                id
            ))
            .into());
        }
        let Some(from) = status.predecessor() else {
            return Err(self.rejected_transition(id, status).await);
        };

        let result = sqlx::query("UPDATE builds SET status = $2 WHERE id = $1 AND status = $3")
            .bind(id.get())
            .bind(status.as_str())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, status).await);
        }
        Ok(())
    }

    async fn set_conclusion(&self, id: BuildId, conclusion: Conclusion) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE builds SET status = 'completed', conclusion = $2
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(id.get())
        .bind(conclusion.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, BuildStatus::Completed).await);
        }
        Ok(())
    }

    async fn set_check_run_id(&self, id: BuildId, check_run_id: CheckRunId) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE builds SET check_run_id = $2 WHERE id = $1 AND check_run_id IS NULL",
        )
        .bind(id.get())
        .bind(check_run_id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT check_run_id FROM builds WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;

        match existing {
            Some(existing) if existing == check_run_id.get() => Ok(()),
            Some(existing) => Err(DbError::Conflict(format!(
                "build {} already has check run {}",
                id, existing
            ))),
            None => Err(DbError::Conflict(format!("build {} changed concurrently", id))),
        }
    }

    async fn get(&self, user_id: UserId, id: BuildId) -> DbResult<BuildDetails> {
        let sql = format!("{DETAILS_SELECT} WHERE users.id = $1 AND builds.id = $2");
        self.fetch_details(&sql, &[user_id.get(), id.get()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn list_by_user(&self, user_id: UserId) -> DbResult<Vec<BuildDetails>> {
        let sql = format!("{DETAILS_SELECT} WHERE users.id = $1 ORDER BY builds.created_at DESC");
        self.fetch_details(&sql, &[user_id.get()]).await
    }

    async fn list_by_repo(&self, user_id: UserId, repo_id: RepoId) -> DbResult<Vec<BuildDetails>> {
        let sql = format!(
            "{DETAILS_SELECT} WHERE users.id = $1 AND repos.id = $2 ORDER BY builds.created_at DESC"
        );
        self.fetch_details(&sql, &[user_id.get(), repo_id.get()]).await
    }

    async fn latest_by_repo(&self, user_id: UserId, repo_id: RepoId) -> DbResult<BuildDetails> {
        let sql = format!(
            "{DETAILS_SELECT} WHERE users.id = $1 AND repos.id = $2 ORDER BY builds.created_at DESC LIMIT 1"
        );
        self.fetch_details(&sql, &[user_id.get(), repo_id.get()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::NotFound(format!("builds of repo {}", repo_id)))
    }
}
