//! GitHub repository records.

use async_trait::async_trait;
use beeci_core::{Repo, RepoId, UserId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RepoRecord {
    pub id: i64,
    pub name: String,
    pub user_id: i64,
    pub description: Option<String>,
}

impl From<RepoRecord> for Repo {
    fn from(record: RepoRecord) -> Self {
        Repo {
            id: RepoId::new(record.id),
            name: record.name,
            user_id: UserId::new(record.user_id),
            description: record.description,
        }
    }
}

#[async_trait]
pub trait RepoRepo: Send + Sync {
    /// Insert repositories, updating name and owner of ones already known.
    async fn create(&self, repos: &[Repo]) -> DbResult<()>;
    async fn delete(&self, ids: &[RepoId]) -> DbResult<()>;
    async fn get(&self, id: RepoId) -> DbResult<Repo>;
}

/// PostgreSQL implementation of RepoRepo.
pub struct PgRepoRepo {
    pool: PgPool,
}

impl PgRepoRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepoRepo for PgRepoRepo {
    async fn create(&self, repos: &[Repo]) -> DbResult<()> {
        if repos.is_empty() {
            return Ok(());
        }

        let mut query_builder =
            sqlx::QueryBuilder::new("INSERT INTO repos (id, name, user_id, description) ");
        query_builder.push_values(repos, |mut b, repo| {
            b.push_bind(repo.id.get())
                .push_bind(&repo.name)
                .push_bind(repo.user_id.get())
                .push_bind(&repo.description);
        });
        query_builder.push(
            " ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, user_id = EXCLUDED.user_id",
        );

        query_builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn delete(&self, ids: &[RepoId]) -> DbResult<()> {
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        sqlx::query("DELETE FROM repos WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: RepoId) -> DbResult<Repo> {
        let record = sqlx::query_as::<_, RepoRecord>(
            "SELECT id, name, user_id, description FROM repos WHERE id = $1",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("repo {}", id)))?;
        Ok(record.into())
    }
}
