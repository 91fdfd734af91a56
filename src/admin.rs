//! Administrative state surgery: blocking, unblocking, bulk retry, and the
//! integrity sweep. These are the only sanctioned ways out of a terminal
//! state.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::goal::GoalState;
use crate::notify;
use crate::resolver;
use crate::store::goals;
use crate::transitions::next_state;

/// Mark a waiting goal as blocked, so it will not be pursued.
pub async fn block_goal(pool: &PgPool, goal_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    let goal = goals::fetch_goal_for_update(&mut tx, goal_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("goal {} does not exist", goal_id))?;

    if !goal.state.is_waiting() {
        anyhow::bail!("cannot block goal in state {}", goal.state.as_str());
    }

    goals::update_state(&mut tx, goal_id, GoalState::Blocked, now).await?;
    tx.commit().await?;
    info!(goal_id = %goal_id, "Goal blocked");
    Ok(())
}

/// Release a blocked or failed goal so it can be pursued again. The goal is
/// re-evaluated from scratch against its current prerequisites.
pub async fn unblock_retry_goal(
    pool: &PgPool,
    goal_id: Uuid,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    let goal = goals::fetch_goal_for_update(&mut tx, goal_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("goal {} does not exist", goal_id))?;

    if goal.state != GoalState::Blocked && !goal.state.is_failure() {
        anyhow::bail!(
            "cannot unblock/retry goal in state {}",
            goal.state.as_str()
        );
    }

    let mut fresh = goal.clone();
    fresh.state = GoalState::WaitingForDate;
    let prereqs = goals::prerequisite_states_locked(&mut tx, goal_id).await?;
    let new_state = next_state(&fresh, &prereqs, now);

    goals::update_state(&mut tx, goal_id, new_state, now).await?;
    if new_state == GoalState::WaitingForWorker {
        notify::publish(&mut tx, goal_id).await?;
    }
    // this goal is no longer failed; dependents written off because of it
    // get another look
    if !new_state.is_failure() {
        resolver::revive_dependents(&mut tx, goal_id, now).await?;
    }
    tx.commit().await?;
    info!(goal_id = %goal_id, state = new_state.as_str(), "Goal released for retry");
    Ok(())
}

/// Retry every GIVEN_UP goal, walking ids in order with one transaction per
/// goal so concurrent runs make progress instead of colliding. Returns the
/// number of goals released.
pub async fn retry_all_given_up(pool: &PgPool, limit: Option<u64>) -> anyhow::Result<u64> {
    let mut count = 0;
    let mut cursor = Uuid::nil();

    loop {
        if let Some(limit) = limit {
            if count >= limit {
                info!(limit, "Retry limit reached");
                break;
            }
        }

        let mut tx = pool.begin().await?;
        let row: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM goals
             WHERE id >= $1 AND state = 'given_up'
             ORDER BY id
             LIMIT 1
             FOR NO KEY UPDATE SKIP LOCKED",
        )
        .bind(cursor)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(goal_id) = row else {
            tx.rollback().await?;
            break;
        };

        let now = Utc::now();
        if let Some(goal) = goals::fetch_goal(&mut tx, goal_id).await? {
            let mut fresh = goal.clone();
            fresh.state = GoalState::WaitingForDate;
            let prereqs = goals::prerequisite_states_locked(&mut tx, goal_id).await?;
            let new_state = next_state(&fresh, &prereqs, now);
            goals::update_state(&mut tx, goal_id, new_state, now).await?;
            if new_state == GoalState::WaitingForWorker {
                notify::publish(&mut tx, goal_id).await?;
            }
            if !new_state.is_failure() {
                resolver::revive_dependents(&mut tx, goal_id, now).await?;
            }
            info!(goal_id = %goal_id, state = new_state.as_str(), "Retried goal");
        }
        tx.commit().await?;
        count += 1;

        cursor = Uuid::from_u128(goal_id.as_u128().wrapping_add(1));
        if cursor == Uuid::nil() {
            break;
        }
    }

    Ok(count)
}

/// Walk every goal, re-derive its state from its prerequisites, and repair
/// drift. A crashed cascade or manual database surgery can strand a goal in
/// a waiting state nothing will ever re-evaluate; this sweep heals it.
/// Returns the number of goals fixed.
pub async fn check_fix_all(pool: &PgPool) -> anyhow::Result<u64> {
    let mut fixed = 0;
    let mut cursor = Uuid::nil();

    loop {
        let mut tx = pool.begin().await?;
        let row = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM goals
             WHERE id >= $1
             ORDER BY id
             LIMIT 1
             FOR NO KEY UPDATE SKIP LOCKED",
        )
        .bind(cursor)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(goal_id) = row else {
            tx.rollback().await?;
            break;
        };

        let now = Utc::now();
        if let Some(goal) = goals::fetch_goal(&mut tx, goal_id).await? {
            if goal.state.is_waiting() {
                let prereqs = goals::prerequisite_states_locked(&mut tx, goal_id).await?;
                let expected = next_state(&goal, &prereqs, now);
                if expected != goal.state {
                    warn!(
                        goal_id = %goal_id,
                        stored = goal.state.as_str(),
                        recalculated = expected.as_str(),
                        "Fixing goal state drift"
                    );
                    goals::update_state(&mut tx, goal_id, expected, now).await?;
                    if expected == GoalState::WaitingForWorker {
                        notify::publish(&mut tx, goal_id).await?;
                    }
                    fixed += 1;
                }
            }
        }
        tx.commit().await?;

        cursor = Uuid::from_u128(goal_id.as_u128().wrapping_add(1));
        if cursor == Uuid::nil() {
            break;
        }
    }

    Ok(fixed)
}
