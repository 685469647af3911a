//! Change feed: build mutations published by the store.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;

use crate::{DbError, DbResult};

/// A source of change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start receiving notifications published on `channel`.
    async fn subscribe(&self, channel: &str) -> DbResult<Box<dyn ChangeSubscription>>;
}

/// A live subscription to one channel.
#[async_trait]
pub trait ChangeSubscription: Send {
    /// Wait for the next payload. An error means the subscription is dead and
    /// must be replaced.
    async fn recv(&mut self) -> DbResult<String>;

    /// Stop listening.
    async fn close(&mut self) -> DbResult<()>;
}

/// PostgreSQL LISTEN/NOTIFY feed.
pub struct PgChangeFeed {
    pool: PgPool,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self, channel: &str) -> DbResult<Box<dyn ChangeSubscription>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        Ok(Box::new(PgSubscription { listener }))
    }
}

struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl ChangeSubscription for PgSubscription {
    async fn recv(&mut self) -> DbResult<String> {
        // try_recv reports a dropped connection as None instead of silently
        // reconnecting, so the caller owns the reconnect policy.
        match self.listener.try_recv().await? {
            Some(notification) => Ok(notification.payload().to_string()),
            None => Err(DbError::ConnectionLost),
        }
    }

    async fn close(&mut self) -> DbResult<()> {
        self.listener.unlisten_all().await?;
        Ok(())
    }
}
