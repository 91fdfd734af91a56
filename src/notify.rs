//! The wake-up channel.
//!
//! Notifications are best-effort latency hints: correctness depends only on
//! polling with `SKIP LOCKED`. A `NOTIFY` issued inside a transaction is
//! delivered at commit, so publishers simply call [`publish`] on their
//! transaction connection.

use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

/// All workers listen on one channel; the payload is ignored.
pub const GOALS_CHANNEL: &str = "goals";

/// Announce that a goal may be ready for a worker.
pub async fn publish(conn: &mut PgConnection, goal_id: Uuid) -> anyhow::Result<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(GOALS_CHANNEL)
        .bind(goal_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

/// A blocking worker's subscription to the goals channel.
pub struct GoalsListener {
    listener: PgListener,
}

impl GoalsListener {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(GOALS_CHANNEL).await?;
        Ok(Self { listener })
    }

    pub async fn connect_with(pool: &PgPool) -> anyhow::Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(GOALS_CHANNEL).await?;
        Ok(Self { listener })
    }

    /// Wait for a wake-up. Returns `true` on a notification, `false` on
    /// timeout; either way the caller should poll for work.
    pub async fn wait_for(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        match tokio::time::timeout(timeout, self.listener.recv()).await {
            Ok(Ok(_notification)) => Ok(true),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Ok(false),
        }
    }
}
