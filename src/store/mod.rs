//! Postgres persistence.
//!
//! The engine needs two kinds of database access per worker: a pooled
//! transactional connection for dispatch, and a dedicated autocommit
//! connection for worker tracking that must never participate in the dispatch
//! transaction. [`Store`] covers the first, [`TrackingStore`] the second.

pub mod goals;
pub mod migrations;
pub mod progress;
pub mod tracking;

pub use tracking::TrackingStore;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Transactional persistence for goals, precondition edges and progress.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Does not run migrations.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        migrations::migrate(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
