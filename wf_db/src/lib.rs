//! ABOUTME: Database layer with Postgres, migrations, and repositories
//! ABOUTME: Handles all durable state for jobs, executions, approvals, and flows

use backoff::ExponentialBackoffBuilder;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use wf_core::{Error, Result};

/// How long startup keeps retrying a database that is not up yet
const CONNECT_RETRY_BUDGET: Duration = Duration::from_secs(120);

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect and migrate. A database that is still coming up is retried
    /// with exponential backoff until the retry budget runs out; after that
    /// the error is fatal to the caller.
    #[instrument(skip(url))]
    pub async fn new(url: &str, pool_size: u32, acquire_timeout: Duration) -> Result<Self> {
        info!(pool_size, "Initializing database connection");

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(Some(CONNECT_RETRY_BUDGET))
            .build();

        let db = backoff::future::retry_notify(
            policy,
            || async {
                let db = Self::try_connect(url, pool_size, acquire_timeout)
                    .await
                    .map_err(backoff::Error::transient)?;
                db.migrate().await.map_err(backoff::Error::transient)?;
                Ok(db)
            },
            |error: Error, after: Duration| {
                warn!(
                    error = %error,
                    retry_in_ms = after.as_millis() as u64,
                    "Database not ready, will retry"
                );
            },
        )
        .await?;

        info!("Database connected and migrated");
        Ok(db)
    }

    async fn try_connect(url: &str, pool_size: u32, acquire_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .min_connections(1)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("Failed to create connection pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Run database migrations
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a Db instance from an existing pool (for testing/reuse)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

// Repository modules
pub mod repositories;

pub use repositories::{
    approvals::{Approval, ApprovalRepository, ApprovalStatus},
    cron_schedules::{CronScheduleRepository, CronScheduleRow, NewCronSchedule},
    executions::{
        ExecutionRepository, ExecutionRow, ExecutionStatus, NewExecution, TriggerType,
    },
    flows::{FlowRepository, FlowRow},
    nodes::{NodeRepository, NodeRow},
    secrets::SecretRepository,
};
