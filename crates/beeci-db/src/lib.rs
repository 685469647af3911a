//! Build store for BeeCI.
//!
//! Provides repository traits, their PostgreSQL implementations, the
//! change feed the store publishes build mutations on, and an in-memory
//! store used in tests and local runs.
//!
//! Every mutation of a build row publishes the full row, JSON encoded, on the
//! builds change channel. PostgreSQL does this with the trigger installed by
//! the migrations; [`MemoryStore`] does it in-process under the same lock as
//! the write.

pub mod error;
pub mod feed;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use feed::{ChangeFeed, ChangeSubscription, PgChangeFeed};
pub use memory::MemoryStore;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Channel the `builds` trigger publishes on.
pub const BUILDS_CHANNEL: &str = "builds_channel";

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
