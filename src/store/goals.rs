//! Goal rows and precondition edges.
//!
//! Everything here takes `&mut PgConnection` so callers compose the queries
//! into their own transactions; the dispatcher, the resolver and the
//! scheduler all rely on that.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::goal::{Goal, GoalState, PreconditionsMode};

const GOAL_COLUMNS: &str = "id, handler, instructions, state, precondition_date, deadline, \
     preconditions_mode, precondition_failures_allowed, created_at, updated_at";

pub(crate) fn goal_from_row(row: &PgRow) -> anyhow::Result<Goal> {
    Ok(Goal {
        id: row.get("id"),
        handler: row.get("handler"),
        instructions: row.get::<Option<JsonValue>, _>("instructions"),
        state: GoalState::parse(row.get::<String, _>("state").as_str())?,
        precondition_date: row.get("precondition_date"),
        deadline: row.get("deadline"),
        preconditions_mode: PreconditionsMode::parse(
            row.get::<String, _>("preconditions_mode").as_str(),
        )?,
        precondition_failures_allowed: row.get("precondition_failures_allowed"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn insert_goal(conn: &mut PgConnection, goal: &Goal) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO goals (id, handler, instructions, state, precondition_date, deadline,
             preconditions_mode, precondition_failures_allowed, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(goal.id)
    .bind(&goal.handler)
    .bind(&goal.instructions)
    .bind(goal.state.as_str())
    .bind(goal.precondition_date)
    .bind(goal.deadline)
    .bind(goal.preconditions_mode.as_str())
    .bind(goal.precondition_failures_allowed)
    .bind(goal.created_at)
    .bind(goal.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn fetch_goal(conn: &mut PgConnection, id: Uuid) -> anyhow::Result<Option<Goal>> {
    let row = sqlx::query(&format!("SELECT {} FROM goals WHERE id = $1", GOAL_COLUMNS))
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(goal_from_row).transpose()
}

/// Fetch a goal with its row locked for the rest of the transaction.
pub async fn fetch_goal_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> anyhow::Result<Option<Goal>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM goals WHERE id = $1 FOR NO KEY UPDATE",
        GOAL_COLUMNS
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;
    row.as_ref().map(goal_from_row).transpose()
}

/// Claim the next ready goal, skipping rows other workers hold.
///
/// Dispatch order is `precondition_date` ascending with nulls first, then
/// `created_at` ascending. With a deadline horizon, only goals due within
/// `now + horizon` are eligible; goals without a deadline are excluded.
pub async fn claim_next(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    deadline_horizon: Option<Duration>,
) -> anyhow::Result<Option<Goal>> {
    let row = match deadline_horizon {
        Some(horizon) => {
            sqlx::query(&format!(
                "SELECT {} FROM goals
                 WHERE state = 'waiting_for_worker'
                   AND deadline IS NOT NULL AND deadline <= $1
                 ORDER BY precondition_date ASC NULLS FIRST, created_at ASC
                 LIMIT 1
                 FOR NO KEY UPDATE SKIP LOCKED",
                GOAL_COLUMNS
            ))
            .bind(now + horizon)
            .fetch_optional(conn)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM goals
                 WHERE state = 'waiting_for_worker'
                 ORDER BY precondition_date ASC NULLS FIRST, created_at ASC
                 LIMIT 1
                 FOR NO KEY UPDATE SKIP LOCKED",
                GOAL_COLUMNS
            ))
            .fetch_optional(conn)
            .await?
        }
    };
    row.as_ref().map(goal_from_row).transpose()
}

pub async fn update_state(
    conn: &mut PgConnection,
    id: Uuid,
    state: GoalState,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE goals SET state = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(state.as_str())
        .bind(now)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn update_gate(
    conn: &mut PgConnection,
    id: Uuid,
    precondition_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE goals SET precondition_date = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(precondition_date)
        .bind(now)
        .execute(conn)
        .await?;
    Ok(())
}

/// Insert precondition edges, ignoring duplicates.
pub async fn add_edges(
    conn: &mut PgConnection,
    dependent_id: Uuid,
    prerequisite_ids: &[Uuid],
) -> anyhow::Result<()> {
    if prerequisite_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO goal_preconditions (dependent_id, prerequisite_id)
         SELECT $1, prerequisite FROM UNNEST($2::uuid[]) AS prerequisite
         ON CONFLICT DO NOTHING",
    )
    .bind(dependent_id)
    .bind(prerequisite_ids)
    .execute(conn)
    .await?;
    Ok(())
}

/// Replace the dependent's edge set. Handlers rewrite their goal's
/// prerequisites this way on every `RetryMeLater` that names goals.
pub async fn replace_edges(
    conn: &mut PgConnection,
    dependent_id: Uuid,
    prerequisite_ids: &[Uuid],
) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM goal_preconditions WHERE dependent_id = $1")
        .bind(dependent_id)
        .execute(&mut *conn)
        .await?;
    add_edges(conn, dependent_id, prerequisite_ids).await
}

/// States of the dependent's direct prerequisites.
pub async fn prerequisite_states(
    conn: &mut PgConnection,
    dependent_id: Uuid,
) -> anyhow::Result<Vec<GoalState>> {
    let rows = sqlx::query(
        "SELECT g.state FROM goals g
         JOIN goal_preconditions gp ON gp.prerequisite_id = g.id
         WHERE gp.dependent_id = $1",
    )
    .bind(dependent_id)
    .fetch_all(conn)
    .await?;
    rows.iter()
        .map(|row| GoalState::parse(row.get::<String, _>("state").as_str()))
        .collect()
}

/// Like [`prerequisite_states`], but locks the prerequisite rows so their
/// states cannot flip between this read and the caller's commit. Without the
/// lock, an achievement landing in that window could go unobserved: its
/// resolver pass would not see our (re-)evaluation and we would wait forever.
pub async fn prerequisite_states_locked(
    conn: &mut PgConnection,
    dependent_id: Uuid,
) -> anyhow::Result<Vec<GoalState>> {
    let rows = sqlx::query(
        "SELECT g.state FROM goals g
         JOIN goal_preconditions gp ON gp.prerequisite_id = g.id
         WHERE gp.dependent_id = $1
         FOR NO KEY UPDATE OF g",
    )
    .bind(dependent_id)
    .fetch_all(conn)
    .await?;
    rows.iter()
        .map(|row| GoalState::parse(row.get::<String, _>("state").as_str()))
        .collect()
}

/// Lock the given goals and return their states, keyed by position in `ids`.
pub async fn lock_goal_states(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> anyhow::Result<Vec<GoalState>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        "SELECT state FROM goals WHERE id = ANY($1::uuid[]) FOR NO KEY UPDATE",
    )
    .bind(ids)
    .fetch_all(conn)
    .await?;
    rows.iter()
        .map(|row| GoalState::parse(row.get::<String, _>("state").as_str()))
        .collect()
}

/// Dependents of `prerequisite_id` that are waiting for preconditions,
/// locked for re-evaluation.
pub async fn dependents_waiting(
    conn: &mut PgConnection,
    prerequisite_id: Uuid,
) -> anyhow::Result<Vec<Goal>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM goals g
         JOIN goal_preconditions gp ON gp.dependent_id = g.id
         WHERE gp.prerequisite_id = $1 AND g.state = 'waiting_for_preconditions'
         FOR NO KEY UPDATE OF g",
        goal_columns_qualified()
    ))
    .bind(prerequisite_id)
    .fetch_all(conn)
    .await?;
    rows.iter().map(goal_from_row).collect()
}

/// Dependents of `prerequisite_id` that were written off as
/// NOT_GOING_TO_HAPPEN_SOON, locked for re-evaluation after an
/// administrative retry.
pub async fn dependents_written_off(
    conn: &mut PgConnection,
    prerequisite_id: Uuid,
) -> anyhow::Result<Vec<Goal>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM goals g
         JOIN goal_preconditions gp ON gp.dependent_id = g.id
         WHERE gp.prerequisite_id = $1 AND g.state = 'not_going_to_happen_soon'
         FOR NO KEY UPDATE OF g",
        goal_columns_qualified()
    ))
    .bind(prerequisite_id)
    .fetch_all(conn)
    .await?;
    rows.iter().map(goal_from_row).collect()
}

/// Goals whose date gate has arrived, locked and ready for promotion.
pub async fn due_goals(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Goal>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM goals
         WHERE state = 'waiting_for_date' AND precondition_date <= $1
         FOR NO KEY UPDATE SKIP LOCKED",
        GOAL_COLUMNS
    ))
    .bind(now)
    .fetch_all(conn)
    .await?;
    rows.iter().map(goal_from_row).collect()
}

fn goal_columns_qualified() -> String {
    GOAL_COLUMNS
        .split(", ")
        .map(|col| format!("g.{}", col))
        .collect::<Vec<_>>()
        .join(", ")
}
