//! Precondition propagation.
//!
//! When a goal reaches a terminal state, its dependents may become ready (or
//! doomed). [`propagate`] re-evaluates them inside the caller's transaction,
//! so observers see the whole cascade or none of it. This is the only code
//! path that moves a goal out of WAITING_FOR_PRECONDITIONS.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::debug;
use uuid::Uuid;

use crate::goal::GoalState;
use crate::notify;
use crate::store::goals;
use crate::transitions::next_state;

/// Re-evaluate every dependent of `goal_id` after it entered a terminal
/// state. Cascades transitively when a dependent itself becomes terminal.
/// Returns the number of state changes applied.
pub async fn propagate(
    conn: &mut PgConnection,
    goal_id: Uuid,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let mut changed = 0;
    let mut pending = vec![goal_id];

    while let Some(id) = pending.pop() {
        let dependents = goals::dependents_waiting(&mut *conn, id).await?;
        for dependent in dependents {
            let prereqs = goals::prerequisite_states(&mut *conn, dependent.id).await?;
            let new_state = next_state(&dependent, &prereqs, now);
            if new_state == dependent.state {
                continue;
            }

            goals::update_state(&mut *conn, dependent.id, new_state, now).await?;
            changed += 1;
            debug!(
                goal_id = %dependent.id,
                from = dependent.state.as_str(),
                to = new_state.as_str(),
                "Dependent re-evaluated"
            );

            if new_state == GoalState::WaitingForWorker {
                notify::publish(&mut *conn, dependent.id).await?;
            }
            if new_state.is_terminal() {
                pending.push(dependent.id);
            }
        }
    }

    Ok(changed)
}

/// The inverse direction, for administrative retry: releasing a failed
/// prerequisite can bring dependents written off as NOT_GOING_TO_HAPPEN_SOON
/// back to life. Each such dependent is re-evaluated from scratch; one that
/// revives cascades to its own written-off dependents. Returns the number of
/// state changes applied.
pub async fn revive_dependents(
    conn: &mut PgConnection,
    goal_id: Uuid,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let mut changed = 0;
    let mut pending = vec![goal_id];

    while let Some(id) = pending.pop() {
        let dependents = goals::dependents_written_off(&mut *conn, id).await?;
        for dependent in dependents {
            // bypass the terminal short-circuit: this is an explicit retry
            let mut fresh = dependent.clone();
            fresh.state = GoalState::WaitingForDate;
            let prereqs = goals::prerequisite_states(&mut *conn, dependent.id).await?;
            let new_state = next_state(&fresh, &prereqs, now);
            if new_state == dependent.state {
                continue;
            }

            goals::update_state(&mut *conn, dependent.id, new_state, now).await?;
            changed += 1;
            debug!(
                goal_id = %dependent.id,
                from = dependent.state.as_str(),
                to = new_state.as_str(),
                "Written-off dependent revived"
            );

            if new_state == GoalState::WaitingForWorker {
                notify::publish(&mut *conn, dependent.id).await?;
            }
            pending.push(dependent.id);
        }
    }

    Ok(changed)
}
