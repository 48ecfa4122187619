//! ABOUTME: In-memory JobStore with the same transition rules as Postgres
//! ABOUTME: Backs scheduler and handler tests without a database

use crate::model::{Job, JobStatus, PayloadType};
use crate::notifications::JobNotifications;
use crate::store::{EnqueueRequest, JobStore, QueueStats};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;
use wf_core::{Error, Result};

/// In-memory job store. State is a single mutex-held map; the lease scan
/// re-sorts by `(available_at, id)` to match the Postgres ordering.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    notifications: JobNotifications,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_notifications(JobNotifications::in_process())
    }

    pub fn with_notifications(notifications: JobNotifications) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            notifications,
        }
    }

    pub fn notifications(&self) -> &JobNotifications {
        &self.notifications
    }

    /// Number of jobs currently held (any status)
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lease_lost(job_id: Uuid, worker_id: &str) -> Error {
        Error::NotFound(format!(
            "Lease on job {} no longer held by {}",
            job_id, worker_id
        ))
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, req: EnqueueRequest) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let job = Job {
            id,
            payload_type: req.payload_type.as_str().to_string(),
            payload: req.payload,
            status: JobStatus::Pending.as_str().to_string(),
            lease_owner: None,
            lease_expires_at: None,
            available_at: req.available_at,
            attempt: 0,
            max_attempts: req.max_attempts,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap().insert(id, job);

        let _ = self
            .notifications
            .sender()
            .send(req.payload_type.as_str().to_string());

        Ok(id)
    }

    async fn lease(
        &self,
        worker_id: &str,
        accepted: &[PayloadType],
        lease_ttl: Duration,
    ) -> Result<Option<Job>> {
        let accepted: Vec<&str> = accepted.iter().map(|t| t.as_str()).collect();
        let now = Utc::now();
        let expires = now
            + ChronoDuration::from_std(lease_ttl)
                .map_err(|e| Error::Validation(format!("Lease TTL out of range: {}", e)))?;

        let mut jobs = self.jobs.lock().unwrap();

        let mut ready: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|j| {
                j.status == "pending" && j.available_at <= now && accepted.contains(&j.payload_type.as_str())
            })
            .map(|j| (j.available_at, j.id))
            .collect();
        ready.sort();

        let Some((_, id)) = ready.into_iter().next() else {
            return Ok(None);
        };

        let job = jobs.get_mut(&id).expect("job disappeared under lock");
        job.status = JobStatus::Leased.as_str().to_string();
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(expires);
        job.attempt += 1;
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status == "leased" && job.lease_owner.as_deref() == Some(worker_id) =>
            {
                job.lease_expires_at = Some(new_expires_at);
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(Self::lease_lost(job_id, worker_id)),
        }
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status == "leased" && job.lease_owner.as_deref() == Some(worker_id) =>
            {
                job.status = JobStatus::Done.as_str().to_string();
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.last_error = None;
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(Self::lease_lost(job_id, worker_id)),
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        err: &str,
        requeue_after: Option<Duration>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job)
                if job.status == "leased" && job.lease_owner.as_deref() == Some(worker_id) =>
            {
                let now = Utc::now();
                let can_requeue = requeue_after.is_some() && job.attempt < job.max_attempts;
                if can_requeue {
                    let delay = ChronoDuration::from_std(requeue_after.unwrap())
                        .map_err(|e| Error::Validation(format!("Requeue delay: {}", e)))?;
                    job.status = JobStatus::Pending.as_str().to_string();
                    job.available_at = now + delay;
                } else {
                    job.status = JobStatus::Failed.as_str().to_string();
                }
                job.last_error = Some(err.to_string());
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                Ok(())
            }
            _ => Err(Self::lease_lost(job_id, worker_id)),
        }
    }

    async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == "pending" || job.status == "leased" => {
                job.status = JobStatus::Cancelled.as_str().to_string();
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(Error::NotFound(format!(
                "Job {} is not pending or leased",
                job_id
            ))),
        }
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut reclaimed = 0;
        let mut jobs = self.jobs.lock().unwrap();
        for job in jobs.values_mut() {
            let expired = job.status == "leased"
                && job.lease_expires_at.map(|t| t < now).unwrap_or(false);
            if !expired {
                continue;
            }
            if job.attempt >= job.max_attempts {
                job.status = JobStatus::Failed.as_str().to_string();
                if job.last_error.is_none() {
                    job.last_error = Some("lease expired".to_string());
                }
            } else {
                job.status = JobStatus::Pending.as_str().to_string();
            }
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status == "done" && j.updated_at < older_than));
        Ok((before - jobs.len()) as u64)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let jobs = self.jobs.lock().unwrap();
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match job.status.as_str() {
                "pending" => stats.pending += 1,
                "leased" => stats.leased += 1,
                "done" => stats.done += 1,
                "failed" => stats.failed += 1,
                "cancelled" => stats.cancelled += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}
