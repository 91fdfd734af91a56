//! The append-only log of handler attempts.

use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::goal::Progress;

pub async fn append(conn: &mut PgConnection, progress: &Progress) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO goal_progress (id, goal_id, started_at, finished_at, success, message, traceback)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(progress.id)
    .bind(progress.goal_id)
    .bind(progress.started_at)
    .bind(progress.finished_at)
    .bind(progress.success)
    .bind(&progress.message)
    .bind(&progress.traceback)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn count(conn: &mut PgConnection, goal_id: Uuid) -> anyhow::Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS cnt FROM goal_progress WHERE goal_id = $1")
        .bind(goal_id)
        .fetch_one(conn)
        .await?;
    Ok(row.get::<i64, _>("cnt"))
}

pub async fn for_goal(conn: &mut PgConnection, goal_id: Uuid) -> anyhow::Result<Vec<Progress>> {
    let rows = sqlx::query(
        "SELECT id, goal_id, started_at, finished_at, success, message, traceback
         FROM goal_progress
         WHERE goal_id = $1
         ORDER BY started_at ASC",
    )
    .bind(goal_id)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Progress {
            id: row.get("id"),
            goal_id: row.get("goal_id"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            success: row.get("success"),
            message: row.get("message"),
            traceback: row.get("traceback"),
        })
        .collect())
}
