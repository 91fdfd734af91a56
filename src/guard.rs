//! Killer-task detection.
//!
//! A goal that segfaults or OOMs its worker never reaches the in-transaction
//! failure path, so nothing in `goal_progress` records the attempt. The
//! tracking row does survive, because it was written outside the dispatch
//! transaction. Enough surviving rows for one goal means the goal itself is
//! killing workers; pursuing it again would crash the next worker too.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::goal::{GoalState, Progress};
use crate::resolver;
use crate::store::{goals, progress, TrackingStore};

/// Scan the tracking table and corrupt every goal with at least
/// `max_pickups` surviving attempts. Runs on worker startup, outside any
/// dispatch transaction, over the tracking connection. Returns the number of
/// goals corrupted.
pub async fn run_killer_guard(
    tracking: &TrackingStore,
    max_pickups: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let killer_ids = tracking.killer_goal_ids(max_pickups).await?;
    if killer_ids.is_empty() {
        return Ok(0);
    }

    let mut corrupted = 0;
    for goal_id in killer_ids {
        warn!(
            goal_id = %goal_id,
            max_pickups,
            "Goal has crashed too many workers, marking corrupted"
        );
        if corrupt_goal(tracking.pool(), goal_id, None, now, now).await? {
            corrupted += 1;
        }
        tracking.clear_goal(goal_id).await?;
    }

    info!(corrupted, "Killer-task guard finished");
    Ok(corrupted)
}

/// Mark a goal corrupted in a short transaction of its own and cascade to
/// its dependents. With `note`, a standalone failure progress entry is
/// appended (the non-recoverable dispatch path); without, none is (crashed
/// attempts never ran to a recordable end).
///
/// Returns false when the goal is gone or already terminal.
pub(crate) async fn corrupt_goal(
    pool: &PgPool,
    goal_id: Uuid,
    note: Option<&str>,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await?;

    let Some(goal) = goals::fetch_goal_for_update(&mut tx, goal_id).await? else {
        tx.rollback().await?;
        return Ok(false);
    };
    if goal.state.is_terminal() {
        tx.rollback().await?;
        return Ok(false);
    }

    goals::update_state(&mut tx, goal_id, GoalState::Corrupted, now).await?;
    if let Some(note) = note {
        progress::append(
            &mut tx,
            &Progress::new(
                goal_id,
                started_at,
                now,
                false,
                Some(note.to_string()),
                None,
            ),
        )
        .await?;
    }
    resolver::propagate(&mut tx, goal_id, now).await?;

    tx.commit().await?;
    Ok(true)
}
