//! The goal state machine.
//!
//! `next_state` is pure: it never reads or writes the database. The
//! scheduler, the dispatcher and the resolver call it to derive the target
//! state and apply the change within their own transaction.

use chrono::{DateTime, Utc};

use crate::goal::{Goal, GoalState, PreconditionsMode};

/// Compute the state a goal should be in, given the states of its direct
/// prerequisites, in priority order:
///
/// 1. Blocked and terminal states are left alone.
/// 2. A failed prerequisite sinks the goal when failures are not allowed.
/// 3. Unsatisfied preconditions (per mode) keep it waiting for them.
/// 4. A future date gate keeps it waiting for the date.
/// 5. Otherwise it is ready for a worker.
pub fn next_state(goal: &Goal, prereqs: &[GoalState], now: DateTime<Utc>) -> GoalState {
    if goal.state == GoalState::Blocked || goal.state.is_terminal() {
        return goal.state;
    }

    if !goal.precondition_failures_allowed && prereqs.iter().any(|s| s.is_failure()) {
        return GoalState::NotGoingToHappenSoon;
    }

    let satisfied = match goal.preconditions_mode {
        PreconditionsMode::All => prereqs.iter().all(|s| *s == GoalState::Achieved),
        PreconditionsMode::Any => {
            prereqs.is_empty() || prereqs.iter().any(|s| *s == GoalState::Achieved)
        }
    };
    if !satisfied {
        return GoalState::WaitingForPreconditions;
    }

    if let Some(date) = goal.precondition_date {
        if date > now {
            return GoalState::WaitingForDate;
        }
    }

    GoalState::WaitingForWorker
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn goal(state: GoalState) -> Goal {
        let now = Utc::now();
        Goal {
            id: Uuid::new_v4(),
            handler: "test.noop".to_string(),
            instructions: None,
            state,
            precondition_date: None,
            deadline: None,
            preconditions_mode: PreconditionsMode::All,
            precondition_failures_allowed: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_blocked_and_terminal_are_unchanged() {
        let now = Utc::now();
        for state in [
            GoalState::Blocked,
            GoalState::Achieved,
            GoalState::GivenUp,
            GoalState::Corrupted,
            GoalState::NotGoingToHappenSoon,
        ] {
            assert_eq!(next_state(&goal(state), &[], now), state);
            // even with failed prerequisites
            let mut g = goal(state);
            g.precondition_failures_allowed = false;
            assert_eq!(next_state(&g, &[GoalState::GivenUp], now), state);
        }
    }

    #[test]
    fn test_failed_prerequisite_sinks_goal_when_not_allowed() {
        let now = Utc::now();
        let mut g = goal(GoalState::WaitingForPreconditions);
        g.precondition_failures_allowed = false;
        for failed in [
            GoalState::GivenUp,
            GoalState::Corrupted,
            GoalState::NotGoingToHappenSoon,
        ] {
            assert_eq!(
                next_state(&g, &[GoalState::Achieved, failed], now),
                GoalState::NotGoingToHappenSoon,
            );
        }
        // blocked prerequisites are not failures
        assert_eq!(
            next_state(&g, &[GoalState::Blocked], now),
            GoalState::WaitingForPreconditions,
        );
    }

    #[test]
    fn test_failed_prerequisite_keeps_waiting_when_allowed() {
        let now = Utc::now();
        let g = goal(GoalState::WaitingForPreconditions);
        assert_eq!(
            next_state(&g, &[GoalState::GivenUp], now),
            GoalState::WaitingForPreconditions,
        );
    }

    #[test]
    fn test_all_mode_requires_every_prerequisite() {
        let now = Utc::now();
        let g = goal(GoalState::WaitingForPreconditions);
        assert_eq!(
            next_state(&g, &[GoalState::Achieved, GoalState::WaitingForWorker], now),
            GoalState::WaitingForPreconditions,
        );
        assert_eq!(
            next_state(&g, &[GoalState::Achieved, GoalState::Achieved], now),
            GoalState::WaitingForWorker,
        );
        // no prerequisites at all is satisfied
        assert_eq!(next_state(&g, &[], now), GoalState::WaitingForWorker);
    }

    #[test]
    fn test_any_mode_requires_one_prerequisite() {
        let now = Utc::now();
        let mut g = goal(GoalState::WaitingForPreconditions);
        g.preconditions_mode = PreconditionsMode::Any;
        assert_eq!(
            next_state(&g, &[GoalState::WaitingForWorker, GoalState::Achieved], now),
            GoalState::WaitingForWorker,
        );
        assert_eq!(
            next_state(
                &g,
                &[GoalState::WaitingForWorker, GoalState::WaitingForDate],
                now
            ),
            GoalState::WaitingForPreconditions,
        );
        assert_eq!(next_state(&g, &[], now), GoalState::WaitingForWorker);
    }

    #[test]
    fn test_date_gate_applies_after_preconditions() {
        let now = Utc::now();
        let mut g = goal(GoalState::WaitingForPreconditions);
        g.precondition_date = Some(now + Duration::hours(1));
        // unsatisfied preconditions win over the date gate
        assert_eq!(
            next_state(&g, &[GoalState::WaitingForWorker], now),
            GoalState::WaitingForPreconditions,
        );
        assert_eq!(
            next_state(&g, &[GoalState::Achieved], now),
            GoalState::WaitingForDate,
        );
        g.precondition_date = Some(now - Duration::hours(1));
        assert_eq!(
            next_state(&g, &[GoalState::Achieved], now),
            GoalState::WaitingForWorker,
        );
    }
}
