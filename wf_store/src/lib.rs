//! ABOUTME: Durable job store with leasing, retries, and wakeup notifications
//! ABOUTME: Postgres implementation plus an in-memory store for tests

pub mod memory;
pub mod model;
pub mod notifications;
pub mod payload;
pub mod postgres;
pub mod store;

pub use memory::MemoryJobStore;
pub use model::{Job, JobStatus, PayloadType};
pub use notifications::{JobNotifications, JOB_CHANNEL};
pub use payload::{FlowExecutionPayload, NotificationPayload};
pub use postgres::PgJobStore;
pub use store::{EnqueueRequest, JobStore, QueueStats};
