//! ABOUTME: JobStore trait: the durable leasing contract the scheduler runs on
//! ABOUTME: Implemented by PgJobStore (production) and MemoryJobStore (tests)

use crate::model::{Job, PayloadType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;
use wf_core::Result;

/// Request to enqueue a job
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub payload_type: PayloadType,
    pub payload: serde_json::Value,
    /// Earliest instant the job may be leased
    pub available_at: DateTime<Utc>,
    pub max_attempts: i32,
}

impl EnqueueRequest {
    /// A job dispatchable immediately
    pub fn now(payload_type: PayloadType, payload: serde_json::Value, max_attempts: i32) -> Self {
        Self {
            payload_type,
            payload,
            available_at: Utc::now(),
            max_attempts,
        }
    }
}

/// Per-status job counts
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: i64,
    pub leased: i64,
    pub done: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// Durable job persistence contract.
///
/// Invariants the implementations uphold:
/// - at most one live lease per job;
/// - leases are handed out in `(available_at, id)` order per payload type;
/// - `leased` implies a non-null owner and a future `lease_expires_at` at
///   lease time;
/// - transitions are pending → leased → (pending | done | failed | cancelled).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job and wake any listening worker.
    async fn enqueue(&self, req: EnqueueRequest) -> Result<Uuid>;

    /// Atomically lease the next ready job of one of the accepted types.
    /// Rows locked by concurrent leases are skipped, not waited on.
    async fn lease(
        &self,
        worker_id: &str,
        accepted: &[PayloadType],
        lease_ttl: Duration,
    ) -> Result<Option<Job>>;

    /// Extend a lease. Returns NotFound when the lease was lost (expired,
    /// reclaimed, or reassigned); the worker must abandon the job.
    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Mark an owned job done.
    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<()>;

    /// Record a failure. With `requeue_after` and attempts remaining the job
    /// returns to pending at `now + requeue_after`; otherwise it is failed.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        err: &str,
        requeue_after: Option<Duration>,
    ) -> Result<()>;

    /// Cancel a pending or leased job.
    async fn cancel(&self, job_id: Uuid) -> Result<()>;

    /// Return expired leases to pending (or failed when attempts are spent).
    async fn reclaim_expired(&self) -> Result<u64>;

    /// Delete done jobs older than the given instant.
    async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Fetch one job.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Per-status counts for observability.
    async fn stats(&self) -> Result<QueueStats>;
}
