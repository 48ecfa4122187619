//! ABOUTME: Handler seam between the scheduler and payload-specific logic
//! ABOUTME: One handler per payload type, dispatched via a registry map

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wf_core::Result;
use wf_store::PayloadType;

/// Per-job context handed to a handler
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub worker_id: String,
    /// 1-based attempt number of this lease
    pub attempt: i32,
    pub max_attempts: i32,
    /// Cancelled on external cancel, lease loss, or shutdown grace expiry
    pub cancellation: CancellationToken,
}

/// A payload-type handler. Returning `Error::Suspended` marks the job done
/// without completing the underlying execution; `Error::Cancelled` records
/// the job as cancelled; transient errors requeue with backoff.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The payload type this handler consumes
    fn payload_type(&self) -> PayloadType;

    /// Process one decoded job payload
    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<()>;
}
