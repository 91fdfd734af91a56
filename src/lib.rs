//! goald — a database-backed goal scheduling and execution engine.
//!
//! A goal is a persistent unit of work. When its preconditions are satisfied
//! (prerequisite goals achieved, date gate passed), a worker claims it under
//! a row lock and invokes the registered handler, possibly over many partial
//! attempts. Postgres provides all cross-worker coordination: row locks with
//! `SKIP LOCKED` for at-most-one execution per goal, and `LISTEN`/`NOTIFY`
//! to keep dispatch latency low without sacrificing the polling fallback.

pub mod admin;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod goal;
pub mod guard;
pub mod limits;
pub mod notify;
pub mod registry;
pub mod resolver;
pub mod retention;
pub mod schedule;
pub mod store;
pub mod transitions;
pub mod worker;


pub use config::EngineConfig;
pub use dispatcher::{DispatchResult, Dispatcher};
pub use goal::{Goal, GoalState, Outcome, PreconditionsMode, Progress};
pub use registry::{GoalHandler, HandlerRegistry};
pub use schedule::{schedule, ScheduleRequest};
pub use store::{Store, TrackingStore};
