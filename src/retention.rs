//! Retention sweeping.
//!
//! Old achieved goals are garbage collected in batches. Failed goals are
//! never deleted: external schemas treat a NULL goal reference as "completed
//! successfully long ago and deleted", so deleting a failure would silently
//! recode it as success.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

const BATCH_SIZE: i64 = 100;

/// Delete achieved goals unchanged for longer than `retention`, skipping any
/// still referenced by a non-terminal goal. External foreign keys are
/// expected to be `ON DELETE SET NULL`; a restricting one fails the batch,
/// which is logged and retried on a later sweep. Returns the number of goals
/// deleted.
pub async fn remove_old_goals(
    pool: &PgPool,
    retention: Option<Duration>,
    now: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let Some(retention) = retention else {
        return Ok(0);
    };
    let cutoff = now - retention;

    let result = delete_batch(pool, cutoff).await;
    match result {
        Ok(0) => Ok(0),
        Ok(deleted) => {
            info!(deleted, "Deleted old, achieved goals");
            Ok(deleted)
        }
        Err(e) => {
            // Most likely an external foreign key still pointing at a goal.
            warn!("Retention sweep failed: {:#}", e);
            Ok(0)
        }
    }
}

async fn delete_batch(pool: &PgPool, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;

    // The referent check runs inside the deleting transaction, with the
    // candidate rows locked, so a goal cannot gain a live dependent between
    // the check and the delete.
    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT g.id FROM goals g
         WHERE g.state = 'achieved'
           AND g.updated_at < $1
           AND NOT EXISTS (
               SELECT 1 FROM goal_preconditions gp
               JOIN goals d ON d.id = gp.dependent_id
               WHERE gp.prerequisite_id = g.id
                 AND d.state NOT IN ('achieved', 'given_up', 'corrupted', 'not_going_to_happen_soon')
           )
         ORDER BY g.updated_at
         FOR NO KEY UPDATE OF g SKIP LOCKED
         LIMIT $2",
    )
    .bind(cutoff)
    .bind(BATCH_SIZE)
    .fetch_all(&mut *tx)
    .await?;

    if ids.is_empty() {
        tx.rollback().await?;
        return Ok(0);
    }

    sqlx::query(
        "DELETE FROM goal_preconditions
         WHERE prerequisite_id = ANY($1::uuid[]) OR dependent_id = ANY($1::uuid[])",
    )
    .bind(&ids)
    .execute(&mut *tx)
    .await?;

    let result = sqlx::query("DELETE FROM goals WHERE id = ANY($1::uuid[])")
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected())
}
