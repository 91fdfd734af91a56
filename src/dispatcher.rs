//! Goal dispatch.
//!
//! One iteration claims a ready goal under a row lock, records the pickup on
//! the tracking connection, runs the handler inside a savepoint with the
//! configured time limit, interprets the result, and commits. The savepoint
//! is what makes a handler failure recoverable: it aborts alone, leaving the
//! outer transaction usable for recording the failure. If even that
//! recording fails, the transaction is beyond saving and the goal is marked
//! corrupted on the tracking connection.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::{Acquire, Postgres, Transaction};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::goal::{Goal, GoalState, Outcome, Progress};
use crate::guard;
use crate::notify;
use crate::registry::HandlerRegistry;
use crate::resolver;
use crate::store::{goals, progress, Store, TrackingStore};
use crate::transitions::next_state;

/// What one dispatch iteration accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// A goal was claimed and an attempt was recorded.
    Progressed,
    /// Nothing was ready.
    Idle,
}

pub struct Dispatcher {
    store: Store,
    tracking: TrackingStore,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    worker_id: String,
    deadline_horizon: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        tracking: TrackingStore,
        registry: Arc<HandlerRegistry>,
        config: Arc<EngineConfig>,
        worker_id: impl Into<String>,
        deadline_horizon: Option<Duration>,
    ) -> Self {
        Self {
            store,
            tracking,
            registry,
            config,
            worker_id: worker_id.into(),
            deadline_horizon,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One dispatch iteration.
    pub async fn dispatch_one(&self, now: DateTime<Utc>) -> anyhow::Result<DispatchResult> {
        let mut tx = self.store.pool().begin().await?;

        let Some(goal) = goals::claim_next(&mut tx, now, self.deadline_horizon).await? else {
            tx.rollback().await?;
            return Ok(DispatchResult::Idle);
        };

        info!(goal_id = %goal.id, handler = %goal.handler, "Pursuing goal");

        let Some(handler) = self.registry.get(&goal.handler) else {
            // Config drift: the persisted identifier resolves to nothing.
            // The transaction is healthy, so the state change stays in it.
            // No progress entry for attempts that never ran.
            warn!(
                goal_id = %goal.id,
                handler = %goal.handler,
                "Unknown handler identifier, marking goal corrupted"
            );
            goals::update_state(&mut tx, goal.id, GoalState::Corrupted, now).await?;
            resolver::propagate(&mut tx, goal.id, now).await?;
            tx.commit().await?;
            return Ok(DispatchResult::Progressed);
        };

        self.tracking
            .record_pickup(&self.worker_id, goal.id, now)
            .await?;

        let started_at = now;
        let result = self.run_handler(&mut tx, handler.as_ref(), &goal).await;

        match self.record_attempt(&mut tx, &goal, result, started_at, now).await {
            Ok(final_state) => {
                // Tracking cleanup happens before the commit: a crash in
                // between still counts as an attempt.
                self.tracking.clear_pickup(&self.worker_id, goal.id).await?;
                tx.commit().await?;
                if final_state == GoalState::GivenUp {
                    warn!(goal_id = %goal.id, "Goal given up");
                }
                Ok(DispatchResult::Progressed)
            }
            Err(record_err) => {
                // The transaction can no longer record anything; give it up
                // and write the corruption through the tracking connection.
                error!(
                    goal_id = %goal.id,
                    "Could not record attempt, marking goal corrupted: {:#}",
                    record_err
                );
                tx.rollback().await.ok();
                guard::corrupt_goal(
                    self.tracking.pool(),
                    goal.id,
                    Some("corrupted"),
                    started_at,
                    now,
                )
                .await?;
                self.tracking.clear_pickup(&self.worker_id, goal.id).await?;
                Ok(DispatchResult::Progressed)
            }
        }
    }

    /// Run the handler under a savepoint, bounded by the configured wall
    /// time. An `Err` means the attempt failed and the savepoint was rolled
    /// back; the outer transaction is still usable.
    async fn run_handler(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        handler: &dyn crate::registry::GoalHandler,
        goal: &Goal,
    ) -> anyhow::Result<Outcome> {
        let mut savepoint = tx.begin().await?;

        let outcome = {
            let fut = handler.pursue(&mut savepoint, goal);
            match self.config.time_limit() {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "handler exceeded the time limit of {}s",
                        limit.as_secs()
                    )),
                },
                None => fut.await,
            }
        };

        match outcome {
            Ok(outcome) => {
                savepoint.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                savepoint.rollback().await?;
                Err(err)
            }
        }
    }

    /// Interpret the handler's result, append progress, enforce the progress
    /// cap, apply the state change and cascade. Any error here means the
    /// transaction is unusable.
    async fn record_attempt(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        goal: &Goal,
        result: anyhow::Result<Outcome>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<GoalState> {
        let mut updated = goal.clone();

        let (success, message, traceback) = match result {
            Ok(Outcome::AllDone) => {
                updated.state = GoalState::Achieved;
                (true, None, None)
            }
            Ok(Outcome::RetryMeLater {
                precondition_goals,
                precondition_date,
                message,
            }) => {
                if let Some(edges) = &precondition_goals {
                    let mut edges = edges.clone();
                    edges.sort();
                    edges.dedup();
                    goals::replace_edges(&mut *tx, goal.id, &edges).await?;
                }
                if let Some(date) = precondition_date {
                    updated.precondition_date = Some(date);
                }
                let prereqs = goals::prerequisite_states_locked(&mut *tx, goal.id).await?;
                updated.state = next_state(&updated, &prereqs, now);
                info!(
                    goal_id = %goal.id,
                    state = updated.state.as_str(),
                    message = message.as_deref().unwrap_or(""),
                    "Goal wants to be retried later"
                );
                (true, message, None)
            }
            Err(err) => {
                warn!(goal_id = %goal.id, "Goal attempt failed: {:#}", err);
                // Recoverable failure: stay ready so another attempt happens.
                (false, None, Some(format!("{:#}", err)))
            }
        };

        progress::append(
            &mut *tx,
            &Progress::new(goal.id, started_at, Utc::now(), success, message, traceback),
        )
        .await?;

        let attempts = progress::count(&mut *tx, goal.id).await?;
        if attempts >= self.config.max_progress_count && !updated.state.is_terminal() {
            warn!(
                goal_id = %goal.id,
                attempts,
                "Goal reached max progress count, giving up"
            );
            updated.state = GoalState::GivenUp;
        }

        if updated.precondition_date != goal.precondition_date {
            goals::update_gate(&mut *tx, goal.id, updated.precondition_date, now).await?;
        }
        goals::update_state(&mut *tx, goal.id, updated.state, now).await?;

        if updated.state.is_terminal() {
            resolver::propagate(&mut *tx, goal.id, now).await?;
        }
        notify::publish(&mut *tx, goal.id).await?;

        Ok(updated.state)
    }

    /// Dispatch until nothing is ready or `max` attempts were made. Returns
    /// the number of attempts.
    pub async fn dispatch_until_idle(&self, max: Option<u64>) -> anyhow::Result<u64> {
        let mut count = 0;
        loop {
            if let Some(max) = max {
                if count >= max {
                    return Ok(count);
                }
            }
            match self.dispatch_one(Utc::now()).await? {
                DispatchResult::Progressed => count += 1,
                DispatchResult::Idle => return Ok(count),
            }
        }
    }
}

/// Move goals whose date gate has arrived out of WAITING_FOR_DATE. Returns
/// the number of goals promoted.
pub async fn promote_due_goals(store: &Store, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let mut tx = store.pool().begin().await?;
    let due = goals::due_goals(&mut tx, now).await?;

    let mut promoted = 0;
    for goal in due {
        let prereqs = goals::prerequisite_states(&mut tx, goal.id).await?;
        let new_state = next_state(&goal, &prereqs, now);
        if new_state == goal.state {
            continue;
        }
        goals::update_state(&mut tx, goal.id, new_state, now).await?;
        promoted += 1;
        if new_state == GoalState::WaitingForWorker {
            notify::publish(&mut tx, goal.id).await?;
        }
    }

    tx.commit().await?;
    Ok(promoted)
}

/// Generate a worker identifier unique across processes and restarts.
pub fn new_worker_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}
