//! GitHub account records.

use async_trait::async_trait;
use beeci_core::{User, UserId};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
}

impl From<UserRecord> for User {
    fn from(record: UserRecord) -> Self {
        User {
            id: UserId::new(record.id),
            username: record.username,
        }
    }
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn upsert(&self, user: User) -> DbResult<()>;
    async fn get(&self, id: UserId) -> DbResult<User>;
    async fn delete(&self, id: UserId) -> DbResult<()>;
}

/// PostgreSQL implementation of UserRepo.
pub struct PgUserRepo {
    pool: PgPool,
}

impl PgUserRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn upsert(&self, user: User) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET username = EXCLUDED.username
            "#,
        )
        .bind(user.id.get())
        .bind(&user.username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: UserId) -> DbResult<User> {
        let record = sqlx::query_as::<_, UserRecord>("SELECT id, username FROM users WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("user {}", id)))?;
        Ok(record.into())
    }

    async fn delete(&self, id: UserId) -> DbResult<()> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
