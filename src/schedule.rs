//! The scheduling API.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::goal::{Goal, GoalState, PreconditionsMode};
use crate::notify;
use crate::store::goals;
use crate::transitions::next_state;

/// Parameters for [`schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub handler: String,
    /// Opaque payload handed to the handler verbatim.
    pub instructions: Option<JsonValue>,
    /// Earliest time the goal may be pursued.
    pub precondition_date: Option<DateTime<Utc>>,
    /// Goals that must be achieved first (per `preconditions_mode`).
    pub precondition_goals: Vec<Uuid>,
    pub preconditions_mode: PreconditionsMode,
    pub precondition_failures_allowed: bool,
    /// When unset, `GOALS_DEFAULT_DEADLINE_SECONDS` from now is applied.
    pub deadline: Option<DateTime<Utc>>,
    /// Create the goal blocked, to be released administratively.
    pub blocked: bool,
}

impl ScheduleRequest {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            instructions: None,
            precondition_date: None,
            precondition_goals: Vec::new(),
            preconditions_mode: PreconditionsMode::All,
            precondition_failures_allowed: true,
            deadline: None,
            blocked: false,
        }
    }

    pub fn instructions(mut self, instructions: JsonValue) -> Self {
        self.instructions = Some(instructions);
        self
    }

    pub fn not_before(mut self, date: DateTime<Utc>) -> Self {
        self.precondition_date = Some(date);
        self
    }

    pub fn after(mut self, goals: Vec<Uuid>) -> Self {
        self.precondition_goals = goals;
        self
    }

    pub fn mode(mut self, mode: PreconditionsMode) -> Self {
        self.preconditions_mode = mode;
        self
    }

    pub fn fail_with_preconditions(mut self) -> Self {
        self.precondition_failures_allowed = false;
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn blocked(mut self) -> Self {
        self.blocked = true;
        self
    }
}

/// Create a goal and its precondition edges atomically and compute its
/// initial state. Runs on the caller's connection, so handlers can schedule
/// follow-up goals inside their own attempt.
///
/// The prerequisite rows are locked before the edges are inserted. Without
/// the lock a prerequisite could be achieved between our state read and the
/// edge insert; its resolver pass would not see the new edge and the goal
/// would wait forever.
pub async fn schedule(
    conn: &mut PgConnection,
    config: &EngineConfig,
    request: ScheduleRequest,
    now: DateTime<Utc>,
) -> anyhow::Result<Uuid> {
    let mut prerequisite_ids = request.precondition_goals;
    prerequisite_ids.sort();
    prerequisite_ids.dedup();

    let prereq_states = goals::lock_goal_states(&mut *conn, &prerequisite_ids).await?;

    let mut goal = Goal {
        id: Uuid::new_v4(),
        handler: request.handler,
        instructions: request.instructions,
        state: GoalState::WaitingForWorker,
        precondition_date: request.precondition_date,
        deadline: Some(
            request
                .deadline
                .unwrap_or_else(|| now + config.default_deadline()),
        ),
        preconditions_mode: request.preconditions_mode,
        precondition_failures_allowed: request.precondition_failures_allowed,
        created_at: now,
        updated_at: now,
    };
    goal.state = if request.blocked {
        GoalState::Blocked
    } else {
        next_state(&goal, &prereq_states, now)
    };

    goals::insert_goal(&mut *conn, &goal).await?;
    goals::add_edges(&mut *conn, goal.id, &prerequisite_ids).await?;

    if goal.state == GoalState::WaitingForWorker {
        notify::publish(&mut *conn, goal.id).await?;
    }

    debug!(
        goal_id = %goal.id,
        handler = %goal.handler,
        state = goal.state.as_str(),
        "Scheduled goal"
    );
    Ok(goal.id)
}
