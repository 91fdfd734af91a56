use sqlx::PgPool;
use tracing::debug;

/// Idempotent schema setup for the goal tables.
pub(crate) async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS goals (
            id UUID PRIMARY KEY,
            handler TEXT NOT NULL,
            instructions JSONB,
            state TEXT NOT NULL,
            precondition_date TIMESTAMPTZ,
            deadline TIMESTAMPTZ,
            preconditions_mode TEXT NOT NULL DEFAULT 'all',
            precondition_failures_allowed BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS goal_preconditions (
            dependent_id UUID NOT NULL REFERENCES goals (id) ON DELETE CASCADE,
            prerequisite_id UUID NOT NULL REFERENCES goals (id),
            PRIMARY KEY (dependent_id, prerequisite_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS goal_progress (
            id UUID PRIMARY KEY,
            goal_id UUID NOT NULL REFERENCES goals (id) ON DELETE CASCADE,
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ NOT NULL,
            success BOOLEAN NOT NULL,
            message TEXT,
            traceback TEXT
        )",
    )
    .execute(pool)
    .await?;

    // Written on a separate autocommit connection just before each handler
    // invocation; surviving rows indicate a crashed attempt.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS worker_tracking (
            worker_id TEXT NOT NULL,
            goal_id UUID NOT NULL REFERENCES goals (id) ON DELETE CASCADE,
            started_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (worker_id, goal_id)
        )",
    )
    .execute(pool)
    .await?;

    // claim query: state + dispatch ordering
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS goals_claim_idx
         ON goals (state, precondition_date, created_at)",
    )
    .execute(pool)
    .await?;

    // horizon-filtered claim query
    sqlx::query("CREATE INDEX IF NOT EXISTS goals_deadline_idx ON goals (state, deadline)")
        .execute(pool)
        .await?;

    // resolver: dependents of a newly-terminal goal
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS goal_preconditions_prerequisite_idx
         ON goal_preconditions (prerequisite_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS goal_progress_goal_idx ON goal_progress (goal_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS worker_tracking_goal_idx ON worker_tracking (goal_id)",
    )
    .execute(pool)
    .await?;

    debug!("Goal schema migration complete");
    Ok(())
}
