use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Lifecycle state of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalState {
    /// Explicitly marked not to be pursued.
    Blocked,
    /// Allowed only after a future date.
    WaitingForDate,
    /// Other goals need to be achieved first.
    WaitingForPreconditions,
    /// Ready to be pursued; waiting for a worker to pick it up.
    WaitingForWorker,
    /// The goal has been achieved.
    Achieved,
    /// Too many failed attempts.
    GivenUp,
    /// A transaction error happened during execution, so we could not even
    /// properly store the failure.
    Corrupted,
    /// Waiting on a precondition that will not be achieved.
    NotGoingToHappenSoon,
}

impl GoalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalState::Blocked => "blocked",
            GoalState::WaitingForDate => "waiting_for_date",
            GoalState::WaitingForPreconditions => "waiting_for_preconditions",
            GoalState::WaitingForWorker => "waiting_for_worker",
            GoalState::Achieved => "achieved",
            GoalState::GivenUp => "given_up",
            GoalState::Corrupted => "corrupted",
            GoalState::NotGoingToHappenSoon => "not_going_to_happen_soon",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "blocked" => GoalState::Blocked,
            "waiting_for_date" => GoalState::WaitingForDate,
            "waiting_for_preconditions" => GoalState::WaitingForPreconditions,
            "waiting_for_worker" => GoalState::WaitingForWorker,
            "achieved" => GoalState::Achieved,
            "given_up" => GoalState::GivenUp,
            "corrupted" => GoalState::Corrupted,
            "not_going_to_happen_soon" => GoalState::NotGoingToHappenSoon,
            other => anyhow::bail!("unknown goal state '{}'", other),
        })
    }

    /// Terminal states never change except through explicit administrative
    /// retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GoalState::Achieved
                | GoalState::GivenUp
                | GoalState::Corrupted
                | GoalState::NotGoingToHappenSoon
        )
    }

    /// Failure states. A dependent with `precondition_failures_allowed =
    /// false` becomes NOT_GOING_TO_HAPPEN_SOON when a prerequisite enters one
    /// of these.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            GoalState::GivenUp | GoalState::Corrupted | GoalState::NotGoingToHappenSoon
        )
    }

    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            GoalState::WaitingForDate
                | GoalState::WaitingForPreconditions
                | GoalState::WaitingForWorker
        )
    }
}

/// How a goal's precondition set is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionsMode {
    /// All preconditions must be achieved before the goal can be pursued.
    #[default]
    All,
    /// The goal can be pursued as soon as any precondition is achieved.
    Any,
}

impl PreconditionsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreconditionsMode::All => "all",
            PreconditionsMode::Any => "any",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "all" => PreconditionsMode::All,
            "any" => PreconditionsMode::Any,
            other => anyhow::bail!("unknown preconditions mode '{}'", other),
        })
    }
}

/// A goal — a persistent unit of work pursued by calling a handler function,
/// possibly over many partial attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    /// Identifier resolved through the handler registry.
    pub handler: String,
    /// Opaque payload passed to the handler verbatim.
    pub instructions: Option<JsonValue>,
    pub state: GoalState,
    /// The goal will not be pursued before this date.
    pub precondition_date: Option<DateTime<Utc>>,
    /// Workers with a deadline horizon only pick goals due within it.
    pub deadline: Option<DateTime<Utc>>,
    pub preconditions_mode: PreconditionsMode,
    /// When false, a failed prerequisite moves this goal to
    /// NOT_GOING_TO_HAPPEN_SOON instead of leaving it waiting.
    pub precondition_failures_allowed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt at a goal. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub id: Uuid,
    pub goal_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub message: Option<String>,
    pub traceback: Option<String>,
}

impl Progress {
    pub fn new(
        goal_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        success: bool,
        message: Option<String>,
        traceback: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            goal_id,
            started_at,
            finished_at,
            success,
            message,
            traceback,
        }
    }
}

/// What a handler reports back after one attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The goal is achieved.
    AllDone,
    /// Like a process yielding in an operating system: record a successful
    /// partial attempt and come back later.
    RetryMeLater {
        /// `None` keeps the existing precondition edges. `Some(set)` replaces
        /// them; an empty set clears them.
        precondition_goals: Option<Vec<Uuid>>,
        /// When set, replaces the goal's date gate.
        precondition_date: Option<DateTime<Utc>>,
        message: Option<String>,
    },
}

impl Outcome {
    /// Retry with the current edges and gate untouched.
    pub fn retry() -> Self {
        Outcome::RetryMeLater {
            precondition_goals: None,
            precondition_date: None,
            message: None,
        }
    }

    /// Retry once the given goals are achieved, replacing the edge set.
    pub fn retry_after(goals: Vec<Uuid>) -> Self {
        Outcome::RetryMeLater {
            precondition_goals: Some(goals),
            precondition_date: None,
            message: None,
        }
    }

    /// Retry no earlier than the given date.
    pub fn retry_at(date: DateTime<Utc>) -> Self {
        Outcome::RetryMeLater {
            precondition_goals: None,
            precondition_date: Some(date),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            GoalState::Blocked,
            GoalState::WaitingForDate,
            GoalState::WaitingForPreconditions,
            GoalState::WaitingForWorker,
            GoalState::Achieved,
            GoalState::GivenUp,
            GoalState::Corrupted,
            GoalState::NotGoingToHappenSoon,
        ] {
            assert_eq!(GoalState::parse(state.as_str()).unwrap(), state);
        }
        assert!(GoalState::parse("nope").is_err());
    }

    #[test]
    fn test_terminal_and_failure_classes() {
        assert!(GoalState::Achieved.is_terminal());
        assert!(!GoalState::Achieved.is_failure());
        assert!(GoalState::GivenUp.is_failure());
        assert!(GoalState::Corrupted.is_failure());
        assert!(GoalState::NotGoingToHappenSoon.is_failure());
        assert!(!GoalState::Blocked.is_terminal());
        assert!(!GoalState::Blocked.is_failure());
        assert!(GoalState::WaitingForWorker.is_waiting());
    }
}
