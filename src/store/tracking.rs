//! Out-of-transaction worker tracking.
//!
//! A row is inserted just before each handler invocation and deleted just
//! before the dispatch transaction commits. A row that survives therefore
//! marks an attempt whose worker died before it could record anything — the
//! raw material for killer-task detection.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// One dedicated connection per worker, used in autocommit mode so tracking
/// writes land immediately regardless of what the dispatch transaction does.
#[derive(Clone)]
pub struct TrackingStore {
    pool: PgPool,
}

impl TrackingStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Record that `worker_id` is about to pursue `goal_id`. Commits
    /// immediately.
    pub async fn record_pickup(
        &self,
        worker_id: &str,
        goal_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO worker_tracking (worker_id, goal_id, started_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (worker_id, goal_id) DO UPDATE SET started_at = EXCLUDED.started_at",
        )
        .bind(worker_id)
        .bind(goal_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear this worker's pickup. Must happen before the dispatch
    /// transaction commits: a crash between the delete and the commit still
    /// looks like an attempt.
    pub async fn clear_pickup(&self, worker_id: &str, goal_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM worker_tracking WHERE worker_id = $1 AND goal_id = $2")
            .bind(worker_id)
            .bind(goal_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Goals with at least `threshold` surviving pickups.
    pub async fn killer_goal_ids(&self, threshold: i64) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT goal_id FROM worker_tracking
             GROUP BY goal_id
             HAVING COUNT(*) >= $1",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("goal_id")).collect())
    }

    /// Drop all tracking rows for a goal (after it was corrupted).
    pub async fn clear_goal(&self, goal_id: Uuid) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM worker_tracking WHERE goal_id = $1")
            .bind(goal_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn pickup_count(&self, goal_id: Uuid) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM worker_tracking WHERE goal_id = $1")
            .bind(goal_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("cnt"))
    }
}
