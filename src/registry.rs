//! Handler resolution.
//!
//! Handler identity is persisted as a string and resolved through a
//! process-wide registry at dispatch time. Goals referencing an identifier
//! that is not registered are marked corrupted by the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgConnection;

use crate::goal::{Goal, Outcome};

/// One attempt at a goal.
///
/// The handler runs inside the dispatch transaction (under a savepoint) and
/// may use `conn` to schedule further goals; those writes commit or roll back
/// with the attempt. Handlers must be idempotent: they can be re-invoked
/// after retries, crashes, and dynamic edge rewrites, and they may not assume
/// they are the only attempt ever made.
#[async_trait]
pub trait GoalHandler: Send + Sync {
    async fn pursue(&self, conn: &mut PgConnection, goal: &Goal) -> anyhow::Result<Outcome>;
}

#[async_trait]
impl<T: GoalHandler + ?Sized> GoalHandler for std::sync::Arc<T> {
    async fn pursue(&self, conn: &mut PgConnection, goal: &Goal) -> anyhow::Result<Outcome> {
        (**self).pursue(conn, goal).await
    }
}

/// Process-wide mapping from stable handler identifiers to handlers.
/// Register everything at process start, before any worker runs.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn GoalHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl GoalHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GoalHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
