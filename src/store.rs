//! Transactional persistence.
//!
//! `Store` wraps the connection pool and is the only place that knows how to
//! open a transaction or embed migrations. Higher-level components (lease
//! manager, scheduler, run lifecycle) borrow the pool from `Store` and issue
//! their own row-locked statements inside a single transaction — no
//! component batches writes across entities without one.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Build a `Store` from an already-open pool (used by tests that stand
    /// up a `testcontainers` Postgres themselves).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction. All cross-entity mutations (claim, release,
    /// promotion, retry re-enqueue) must run their reads and writes inside
    /// one of these.
    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn health(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
