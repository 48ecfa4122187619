//! ABOUTME: Execution log repository with append-only versioning
//! ABOUTME: The latest version row for an exec_id is the execution's state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;
use wf_core::{Error, Result};

/// Execution lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    PendingApproval,
    Completed,
    Errored,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PendingApproval => "pending_approval",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "pending_approval" => Ok(Self::PendingApproval),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!(
                "Unknown execution status: {}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// How the execution was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Schedule,
    Api,
    Retry,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
            Self::Api => "api",
            Self::Retry => "retry",
        }
    }
}

/// One version row of an execution
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionRow {
    pub id: i64,
    pub exec_id: Uuid,
    pub version: i32,
    pub flow_id: i64,
    pub namespace_id: i64,
    pub status: String,
    pub current_action_id: Option<String>,
    pub input: serde_json::Value,
    pub action_retries: serde_json::Value,
    pub trigger_type: String,
    pub triggered_by: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRow {
    pub fn status(&self) -> Result<ExecutionStatus> {
        ExecutionStatus::parse(&self.status)
    }

    /// Per-action retry counters as a plain map
    pub fn action_retries_map(&self) -> HashMap<String, u32> {
        self.action_retries
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n as u32)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Request to create the first version of an execution
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub exec_id: Uuid,
    pub flow_id: i64,
    pub namespace_id: i64,
    pub input: serde_json::Value,
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Execution log repository
#[derive(Clone)]
pub struct ExecutionRepository {
    pool: PgPool,
}

impl ExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert version 1 for a new execution. A duplicate (exec_id, version)
    /// means a replayed payload and is reported as a validation error.
    pub async fn create(&self, req: NewExecution) -> Result<ExecutionRow> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO execution_log
                (exec_id, version, flow_id, namespace_id, status, input,
                 trigger_type, triggered_by, scheduled_at)
            VALUES ($1, 1, $2, $3, 'pending', $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(req.exec_id)
        .bind(req.flow_id)
        .bind(req.namespace_id)
        .bind(&req.input)
        .bind(req.trigger_type.as_str())
        .bind(&req.triggered_by)
        .bind(req.scheduled_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::Validation(format!(
                "Execution {} version 1 already exists",
                req.exec_id
            )),
            _ => Error::Database(format!("Failed to create execution: {}", e)),
        })?;

        Ok(row)
    }

    /// Append a retry version carrying forward input and retry counters.
    /// `next_version = max(version)+1` is computed inside the insert so
    /// versions are strictly increasing even under concurrent appends.
    pub async fn append_version(&self, exec_id: Uuid) -> Result<ExecutionRow> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO execution_log
                (exec_id, version, flow_id, namespace_id, status, input,
                 action_retries, trigger_type, triggered_by, started_at)
            SELECT exec_id, version + 1, flow_id, namespace_id, 'pending', input,
                   action_retries, 'retry', triggered_by, started_at
            FROM execution_log
            WHERE exec_id = $1
            ORDER BY version DESC
            LIMIT 1
            RETURNING *
            "#,
        )
        .bind(exec_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to append execution version: {}", e)))?;

        row.ok_or_else(|| Error::NotFound(format!("Execution {} has no versions", exec_id)))
    }

    /// Latest version row for an execution
    pub async fn latest(&self, exec_id: Uuid) -> Result<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM execution_log
            WHERE exec_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(exec_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load execution: {}", e)))?;

        Ok(row)
    }

    /// Mark the latest version running, stamping started_at once
    pub async fn mark_running(&self, exec_id: Uuid) -> Result<()> {
        self.update_latest(
            exec_id,
            r#"
            UPDATE execution_log
            SET status = 'running',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE exec_id = $1
              AND version = (SELECT MAX(version) FROM execution_log WHERE exec_id = $1)
            "#,
        )
        .await
    }

    /// Persist the action the execution is currently on
    pub async fn set_current_action(&self, exec_id: Uuid, action_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE execution_log
            SET current_action_id = $2, updated_at = NOW()
            WHERE exec_id = $1
              AND version = (SELECT MAX(version) FROM execution_log WHERE exec_id = $1)
            "#,
        )
        .bind(exec_id)
        .bind(action_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to set current action: {}", e)))?;

        Self::expect_one(result.rows_affected(), exec_id)
    }

    /// Persist the per-action retry counters
    pub async fn set_action_retries(
        &self,
        exec_id: Uuid,
        retries: &HashMap<String, u32>,
    ) -> Result<()> {
        let json = serde_json::to_value(retries)?;
        let result = sqlx::query(
            r#"
            UPDATE execution_log
            SET action_retries = $2, updated_at = NOW()
            WHERE exec_id = $1
              AND version = (SELECT MAX(version) FROM execution_log WHERE exec_id = $1)
            "#,
        )
        .bind(exec_id)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to set action retries: {}", e)))?;

        Self::expect_one(result.rows_affected(), exec_id)
    }

    /// Move the latest version to a non-terminal status
    pub async fn set_status(&self, exec_id: Uuid, status: ExecutionStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE execution_log
            SET status = $2, updated_at = NOW()
            WHERE exec_id = $1
              AND version = (SELECT MAX(version) FROM execution_log WHERE exec_id = $1)
            "#,
        )
        .bind(exec_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to set execution status: {}", e)))?;

        Self::expect_one(result.rows_affected(), exec_id)
    }

    /// Terminal transition: stamps completed_at and the error column
    pub async fn finish(
        &self,
        exec_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE execution_log
            SET status = $2, error = $3, completed_at = NOW(), updated_at = NOW()
            WHERE exec_id = $1
              AND version = (SELECT MAX(version) FROM execution_log WHERE exec_id = $1)
            "#,
        )
        .bind(exec_id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to finish execution: {}", e)))?;

        Self::expect_one(result.rows_affected(), exec_id)
    }

    async fn update_latest(&self, exec_id: Uuid, sql: &str) -> Result<()> {
        let result = sqlx::query(sql)
            .bind(exec_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to update execution: {}", e)))?;

        Self::expect_one(result.rows_affected(), exec_id)
    }

    fn expect_one(rows: u64, exec_id: Uuid) -> Result<()> {
        if rows == 0 {
            return Err(Error::NotFound(format!("Execution {} not found", exec_id)));
        }
        Ok(())
    }
}
