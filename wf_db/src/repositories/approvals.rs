//! ABOUTME: Approval rows gating flow actions on a human decision
//! ABOUTME: At most one pending approval per (exec_id, action_id)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;
use wf_core::{Error, Result};

/// Approval decision states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::Validation(format!(
                "Unknown approval status: {}",
                other
            ))),
        }
    }
}

/// Approval entity
#[derive(Debug, Clone, FromRow)]
pub struct Approval {
    pub id: Uuid,
    pub exec_id: Uuid,
    pub action_id: String,
    pub status: String,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    pub fn status(&self) -> Result<ApprovalStatus> {
        ApprovalStatus::parse(&self.status)
    }
}

/// Approval repository
#[derive(Clone)]
pub struct ApprovalRepository {
    pool: PgPool,
}

impl ApprovalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pending approval, or return the existing pending row when one
    /// is already open for this (exec_id, action_id).
    pub async fn create_pending(&self, exec_id: Uuid, action_id: &str) -> Result<Approval> {
        let inserted = sqlx::query_as::<_, Approval>(
            r#"
            INSERT INTO approvals (id, exec_id, action_id, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (exec_id, action_id) WHERE status = 'pending'
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(exec_id)
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create approval: {}", e)))?;

        if let Some(approval) = inserted {
            return Ok(approval);
        }

        self.latest(exec_id, action_id)
            .await?
            .ok_or_else(|| Error::Database("Approval insert raced and vanished".to_string()))
    }

    /// Most recent approval row for an action of an execution
    pub async fn latest(&self, exec_id: Uuid, action_id: &str) -> Result<Option<Approval>> {
        let row = sqlx::query_as::<_, Approval>(
            r#"
            SELECT * FROM approvals
            WHERE exec_id = $1 AND action_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(exec_id)
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load approval: {}", e)))?;

        Ok(row)
    }

    /// Fetch an approval by id
    pub async fn get(&self, id: Uuid) -> Result<Option<Approval>> {
        let row = sqlx::query_as::<_, Approval>("SELECT * FROM approvals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to load approval: {}", e)))?;

        Ok(row)
    }

    /// Record a decision. The pending precondition makes the transition
    /// terminal: a second decision fails validation.
    pub async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalStatus,
        decided_by: &str,
    ) -> Result<Approval> {
        if decision == ApprovalStatus::Pending {
            return Err(Error::Validation(
                "Approval decision must be approved or rejected".to_string(),
            ));
        }

        let row = sqlx::query_as::<_, Approval>(
            r#"
            UPDATE approvals
            SET status = $2, decided_by = $3, decided_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(decision.as_str())
        .bind(decided_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to decide approval: {}", e)))?;

        row.ok_or_else(|| {
            Error::Validation(format!("Approval {} is not pending or does not exist", id))
        })
    }
}
