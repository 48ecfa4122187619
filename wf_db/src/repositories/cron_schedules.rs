//! ABOUTME: Cron schedule rows, both flow-declared (system) and user-created
//! ABOUTME: System rows are rebuilt from flow declarations; user rows persist

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use wf_core::{Error, Result};

/// One cron schedule row
#[derive(Debug, Clone, FromRow)]
pub struct CronScheduleRow {
    pub id: i64,
    pub flow_id: i64,
    pub cron_expr: String,
    pub timezone: String,
    pub inputs: serde_json::Value,
    pub created_by: String,
    pub is_user_created: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Request to register a schedule
#[derive(Debug, Clone)]
pub struct NewCronSchedule {
    pub flow_id: i64,
    pub cron_expr: String,
    pub timezone: String,
    pub inputs: serde_json::Value,
    pub created_by: String,
    pub is_user_created: bool,
}

/// Cron schedule repository
#[derive(Clone)]
pub struct CronScheduleRepository {
    pool: PgPool,
}

impl CronScheduleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a schedule; the (flow, expr, timezone, user-created) uniqueness
    /// makes re-registration a no-op returning the existing row.
    pub async fn insert(&self, req: NewCronSchedule) -> Result<CronScheduleRow> {
        let row = sqlx::query_as::<_, CronScheduleRow>(
            r#"
            INSERT INTO cron_schedules
                (flow_id, cron_expr, timezone, inputs, created_by, is_user_created)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (flow_id, cron_expr, timezone, is_user_created)
            DO UPDATE SET is_active = TRUE, inputs = EXCLUDED.inputs
            RETURNING *
            "#,
        )
        .bind(req.flow_id)
        .bind(&req.cron_expr)
        .bind(&req.timezone)
        .bind(&req.inputs)
        .bind(&req.created_by)
        .bind(req.is_user_created)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to insert cron schedule: {}", e)))?;

        Ok(row)
    }

    /// All active schedules
    pub async fn list_active(&self) -> Result<Vec<CronScheduleRow>> {
        let rows = sqlx::query_as::<_, CronScheduleRow>(
            "SELECT * FROM cron_schedules WHERE is_active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list cron schedules: {}", e)))?;

        Ok(rows)
    }

    /// Flows that still hold system (flow-declared) schedule rows. The
    /// syncer diffs this against the registry's declarations to catch flows
    /// that were deactivated or stopped declaring schedules.
    pub async fn list_system_flow_ids(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT flow_id FROM cron_schedules WHERE NOT is_user_created",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list system schedule flows: {}", e)))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Active user-created schedules only
    pub async fn list_active_user_created(&self) -> Result<Vec<CronScheduleRow>> {
        let rows = sqlx::query_as::<_, CronScheduleRow>(
            "SELECT * FROM cron_schedules WHERE is_active AND is_user_created ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list user cron schedules: {}", e)))?;

        Ok(rows)
    }

    /// Replace the system (flow-declared) schedules of a flow with a new set
    pub async fn replace_system_for_flow(
        &self,
        flow_id: i64,
        desired: &[NewCronSchedule],
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query("DELETE FROM cron_schedules WHERE flow_id = $1 AND NOT is_user_created")
            .bind(flow_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to clear system schedules: {}", e)))?;

        for req in desired {
            sqlx::query(
                r#"
                INSERT INTO cron_schedules
                    (flow_id, cron_expr, timezone, inputs, created_by, is_user_created)
                VALUES ($1, $2, $3, $4, $5, FALSE)
                "#,
            )
            .bind(flow_id)
            .bind(&req.cron_expr)
            .bind(&req.timezone)
            .bind(&req.inputs)
            .bind(&req.created_by)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to insert system schedule: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit schedules: {}", e)))?;

        Ok(())
    }

    /// Disable user schedules of a deactivated flow and drop its system rows
    pub async fn deactivate_for_flow(&self, flow_id: i64) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query(
            "UPDATE cron_schedules SET is_active = FALSE WHERE flow_id = $1 AND is_user_created",
        )
        .bind(flow_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to disable user schedules: {}", e)))?;

        sqlx::query("DELETE FROM cron_schedules WHERE flow_id = $1 AND NOT is_user_created")
            .bind(flow_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to drop system schedules: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit deactivation: {}", e)))?;

        Ok(())
    }

    /// Deactivate one schedule by id
    pub async fn deactivate(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE cron_schedules SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to deactivate schedule: {}", e)))?;

        Ok(())
    }
}
