//! ABOUTME: Postgres JobStore using FOR UPDATE SKIP LOCKED leases
//! ABOUTME: Enqueues emit pg_notify so idle workers wake without polling

use crate::model::{Job, PayloadType};
use crate::notifications::JOB_CHANNEL;
use crate::store::{EnqueueRequest, JobStore, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;
use wf_core::{Error, Result};

/// PostgreSQL job store
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn db_err(context: &str, e: sqlx::Error) -> Error {
        Error::Database(format!("{}: {}", context, e))
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::db_err("Failed to begin enqueue", e))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, payload_type, payload, available_at, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(req.payload_type.as_str())
        .bind(&req.payload)
        .bind(req.available_at)
        .bind(req.max_attempts)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::db_err("Failed to enqueue job", e))?;

        // Same transaction: the notification is only delivered on commit, so
        // a woken worker always finds the row.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(JOB_CHANNEL)
            .bind(req.payload_type.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::db_err("Failed to notify", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::db_err("Failed to commit enqueue", e))?;

        debug!(job_id = %id, payload_type = %req.payload_type, "Job enqueued");
        Ok(id)
    }

    async fn lease(
        &self,
        worker_id: &str,
        accepted: &[PayloadType],
        lease_ttl: Duration,
    ) -> Result<Option<Job>> {
        if accepted.is_empty() {
            return Ok(None);
        }
        let types: Vec<String> = accepted.iter().map(|t| t.as_str().to_string()).collect();
        let expires = Utc::now()
            + ChronoDuration::from_std(lease_ttl)
                .map_err(|e| Error::Validation(format!("Lease TTL out of range: {}", e)))?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND available_at <= NOW()
                  AND payload_type = ANY($1)
                ORDER BY available_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'leased',
                lease_owner = $2,
                lease_expires_at = $3,
                attempt = attempt + 1,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING *
            "#,
        )
        .bind(&types)
        .bind(worker_id)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::db_err("Failed to lease job", e))?;

        Ok(job)
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'leased' AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(new_expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("Failed to heartbeat job", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Lease on job {} no longer held by {}",
                job_id, worker_id
            )));
        }
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'leased' AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("Failed to complete job", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Lease on job {} no longer held by {}",
                job_id, worker_id
            )));
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        err: &str,
        requeue_after: Option<Duration>,
    ) -> Result<()> {
        let requeue_at = match requeue_after {
            Some(delay) => Some(
                Utc::now()
                    + ChronoDuration::from_std(delay)
                        .map_err(|e| Error::Validation(format!("Requeue delay: {}", e)))?,
            ),
            None => None,
        };

        // Requeue only when a delay was given and attempts remain; the CASE
        // keeps the decision atomic with the status check.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE
                    WHEN $4::timestamptz IS NOT NULL AND attempt < max_attempts THEN 'pending'
                    ELSE 'failed'
                END,
                available_at = COALESCE($4, available_at),
                last_error = $3,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'leased' AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(err)
        .bind(requeue_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("Failed to fail job", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Lease on job {} no longer held by {}",
                job_id, worker_id
            )));
        }
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'leased')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("Failed to cancel job", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Job {} is not pending or leased",
                job_id
            )));
        }
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE
                    WHEN attempt >= max_attempts THEN 'failed'
                    ELSE 'pending'
                END,
                last_error = CASE
                    WHEN attempt >= max_attempts THEN COALESCE(last_error, 'lease expired')
                    ELSE last_error
                END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'leased' AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Self::db_err("Failed to reclaim leases", e))?;

        Ok(result.rows_affected())
    }

    async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'done' AND updated_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::db_err("Failed to purge done jobs", e))?;

        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::db_err("Failed to load job", e))?;

        Ok(job)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'leased') AS leased,
                COUNT(*) FILTER (WHERE status = 'done') AS done,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::db_err("Failed to load queue stats", e))?;

        Ok(QueueStats {
            pending: row.get("pending"),
            leased: row.get("leased"),
            done: row.get("done"),
            failed: row.get("failed"),
            cancelled: row.get("cancelled"),
        })
    }
}
