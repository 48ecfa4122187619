//! ABOUTME: Scheduler core: worker pool, fair-share queue routing, lease lifecycle
//! ABOUTME: Dispatches leased jobs to registered handlers with retry and cancellation

use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wf_core::Error;
use wf_store::{Job, JobNotifications, JobStore, PayloadType};

pub mod backoff;
pub mod cancel;
pub mod handler;
pub mod router;

pub use backoff::{backoff_delay, default_backoff};
pub use cancel::CancellationBus;
pub use handler::{JobContext, JobHandler};
pub use router::QueueRouter;

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_count: usize,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
    pub reclaim_interval: Duration,
    /// Done job rows older than this are purged
    pub job_retention: Duration,
    /// Ordered queue list with weights
    pub queues: Vec<(PayloadType, u32)>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_count: 8,
            lease_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            reclaim_interval: Duration::from_secs(30),
            job_retention: Duration::from_secs(30 * 24 * 3600),
            queues: vec![
                (PayloadType::FlowExecution, 8),
                (PayloadType::Notification, 2),
            ],
        }
    }
}

/// Scheduler counters, snapshotted on demand
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub jobs_leased: std::sync::atomic::AtomicU64,
    pub jobs_completed: std::sync::atomic::AtomicU64,
    pub jobs_failed: std::sync::atomic::AtomicU64,
    pub jobs_requeued: std::sync::atomic::AtomicU64,
    pub jobs_cancelled: std::sync::atomic::AtomicU64,
    pub jobs_suspended: std::sync::atomic::AtomicU64,
    pub jobs_unroutable: std::sync::atomic::AtomicU64,
}

impl SchedulerMetrics {
    fn inc(counter: &std::sync::atomic::AtomicU64) {
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get_leased(&self) -> u64 {
        self.jobs_leased.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_completed(&self) -> u64 {
        self.jobs_completed
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.jobs_failed.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_requeued(&self) -> u64 {
        self.jobs_requeued
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_cancelled(&self) -> u64 {
        self.jobs_cancelled
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_suspended(&self) -> u64 {
        self.jobs_suspended
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_unroutable(&self) -> u64 {
        self.jobs_unroutable
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Builder for the scheduler singleton; dependencies are injected so tests
/// run on the in-memory store.
pub struct SchedulerBuilder {
    store: Arc<dyn JobStore>,
    settings: SchedulerSettings,
    notifications: JobNotifications,
    handlers: HashMap<PayloadType, Arc<dyn JobHandler>>,
    bus: CancellationBus,
}

impl SchedulerBuilder {
    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn notifications(mut self, notifications: JobNotifications) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn cancellation_bus(mut self, bus: CancellationBus) -> Self {
        self.bus = bus;
        self
    }

    /// Register a handler under its payload type
    pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.payload_type(), handler);
        self
    }

    pub fn build(self) -> Arc<Scheduler> {
        let router = QueueRouter::new(&self.settings.queues);
        Arc::new(Scheduler {
            store: self.store,
            settings: self.settings,
            notifications: self.notifications,
            handlers: self.handlers,
            router,
            bus: self.bus,
            metrics: Arc::new(SchedulerMetrics::default()),
            leasing: CancellationToken::new(),
            running: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        })
    }
}

/// The scheduler. Exactly one per process; workers, the reclaimer, and the
/// purger all hang off it.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    settings: SchedulerSettings,
    notifications: JobNotifications,
    handlers: HashMap<PayloadType, Arc<dyn JobHandler>>,
    router: QueueRouter,
    bus: CancellationBus,
    metrics: Arc<SchedulerMetrics>,
    /// Cancelled first at shutdown: stop taking new leases
    leasing: CancellationToken,
    /// Cancelled at grace expiry: running handler contexts derive from this
    running: CancellationToken,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn builder(store: Arc<dyn JobStore>) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            settings: SchedulerSettings::default(),
            notifications: JobNotifications::in_process(),
            handlers: HashMap::new(),
            bus: CancellationBus::new(),
        }
    }

    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    pub fn cancellation_bus(&self) -> &CancellationBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Cancel a running execution through the in-process bus. Pending jobs
    /// for the execution are untouched; the running handler observes its
    /// context and checkpoints the cancellation.
    pub fn cancel_job(&self, exec_id: Uuid) -> bool {
        self.bus.cancel(exec_id)
    }

    /// Spawn worker loops and the reclaimer
    pub async fn start(self: &Arc<Self>) {
        info!(
            workers = self.settings.worker_count,
            lease_ttl_secs = self.settings.lease_ttl.as_secs(),
            queues = self.settings.queues.len(),
            "Scheduler starting"
        );

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let pid = std::process::id();

        let mut tasks = self.tasks.lock().await;
        for index in 0..self.settings.worker_count {
            let scheduler = Arc::clone(self);
            let worker_id = format!("{}:{}:{}", host, pid, index);
            tasks.spawn(async move { scheduler.worker_loop(worker_id).await });
        }

        let scheduler = Arc::clone(self);
        tasks.spawn(async move { scheduler.reclaimer_loop().await });
    }

    /// Graceful shutdown: stop leasing, wait up to `grace` for running
    /// handlers, then cancel their contexts and drain.
    pub async fn shutdown(&self, grace: Duration) {
        info!(grace_secs = grace.as_secs(), "Scheduler shutting down");
        self.leasing.cancel();

        let mut tasks = self.tasks.lock().await;
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(_) => continue,
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Shutdown grace expired, cancelling running handlers");
                    self.running.cancel();
                    break;
                }
            }
        }
        while tasks.join_next().await.is_some() {}
        info!("Scheduler stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String) {
        debug!(worker = %worker_id, "Worker started");
        let mut wakeups = self.notifications.subscribe();

        loop {
            if self.leasing.is_cancelled() {
                break;
            }

            match self.try_lease(&worker_id).await {
                Some(job) => self.dispatch(&worker_id, job).await,
                None => {
                    // jittered so a fleet of workers does not poll in phase
                    let poll = self.jittered_poll();
                    tokio::select! {
                        _ = self.leasing.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                        result = wakeups.recv() => {
                            // Lagged just means we missed wakeups; the lease
                            // scan below finds whatever is ready.
                            if result.is_err() {
                                debug!(worker = %worker_id, "Wakeup channel lagged");
                            }
                        }
                    }
                }
            }
        }
        debug!(worker = %worker_id, "Worker stopped");
    }

    fn jittered_poll(&self) -> Duration {
        let base = self.settings.poll_interval.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        Duration::from_millis(base + jitter)
    }

    /// One routing round: walk payload types in deficit order until a lease
    /// lands.
    async fn try_lease(&self, worker_id: &str) -> Option<Job> {
        let plan = self.router.plan();
        for payload_type in plan {
            match self
                .store
                .lease(worker_id, &[payload_type], self.settings.lease_ttl)
                .await
            {
                Ok(Some(job)) => {
                    self.router.record_served(payload_type);
                    SchedulerMetrics::inc(&self.metrics.jobs_leased);
                    return Some(job);
                }
                Ok(None) => continue,
                Err(e) => {
                    error!(worker = %worker_id, error = %e, "Lease attempt failed");
                    break;
                }
            }
        }
        self.router.record_idle();
        None
    }

    async fn dispatch(self: &Arc<Self>, worker_id: &str, job: Job) {
        let payload_type = match job.payload_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Unroutable job payload type");
                SchedulerMetrics::inc(&self.metrics.jobs_unroutable);
                let _ = self
                    .store
                    .fail(job.id, worker_id, "unroutable: unknown payload type", None)
                    .await;
                return;
            }
        };

        let Some(handler) = self.handlers.get(&payload_type).cloned() else {
            warn!(job_id = %job.id, payload_type = %payload_type, "No handler registered");
            SchedulerMetrics::inc(&self.metrics.jobs_unroutable);
            let _ = self
                .store
                .fail(job.id, worker_id, "unroutable: no handler", None)
                .await;
            return;
        };

        let job_token = self.running.child_token();
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&self.store),
            job.id,
            worker_id.to_string(),
            self.settings.lease_ttl,
            job_token.clone(),
            heartbeat_stop.clone(),
        ));

        let ctx = JobContext {
            job_id: job.id,
            worker_id: worker_id.to_string(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            cancellation: job_token,
        };

        debug!(
            job_id = %job.id,
            payload_type = %payload_type,
            attempt = job.attempt,
            worker = %worker_id,
            "Dispatching job"
        );

        let result = handler.handle(ctx, job.payload.clone()).await;

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        self.settle(worker_id, &job, result).await;
    }

    /// Renew the lease at ttl/3. Heartbeat rejection means the lease was
    /// reclaimed or reassigned: the handler context is cancelled.
    async fn heartbeat_loop(
        store: Arc<dyn JobStore>,
        job_id: Uuid,
        worker_id: String,
        lease_ttl: Duration,
        job_token: CancellationToken,
        stop: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(lease_ttl / 3);
        ticker.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {
                    let new_expiry = Utc::now()
                        + chrono::Duration::from_std(lease_ttl).unwrap_or_default();
                    if let Err(e) = store.heartbeat(job_id, &worker_id, new_expiry).await {
                        warn!(job_id = %job_id, error = %e, "Lease lost, cancelling handler");
                        job_token.cancel();
                        return;
                    }
                }
            }
        }
    }

    async fn settle(
        &self,
        worker_id: &str,
        job: &Job,
        result: std::result::Result<(), Error>,
    ) {
        match result {
            Ok(()) => {
                SchedulerMetrics::inc(&self.metrics.jobs_completed);
                if let Err(e) = self.store.complete(job.id, worker_id).await {
                    warn!(job_id = %job.id, error = %e, "Completion lost its lease");
                }
            }
            Err(Error::Suspended) => {
                // The execution waits for an approval decision; the job
                // itself is finished.
                SchedulerMetrics::inc(&self.metrics.jobs_suspended);
                if let Err(e) = self.store.complete(job.id, worker_id).await {
                    warn!(job_id = %job.id, error = %e, "Suspension lost its lease");
                }
            }
            Err(Error::Cancelled) => {
                info!(job_id = %job.id, "Job cancelled");
                SchedulerMetrics::inc(&self.metrics.jobs_cancelled);
                if let Err(e) = self.store.cancel(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Cancel transition failed");
                }
            }
            Err(e) if e.is_transient() && job.attempt < job.max_attempts => {
                let delay = default_backoff(job.attempt);
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "Transient failure, requeueing"
                );
                SchedulerMetrics::inc(&self.metrics.jobs_requeued);
                if let Err(e) = self
                    .store
                    .fail(job.id, worker_id, &e.to_string(), Some(delay))
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "Requeue lost its lease");
                }
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Job failed terminally");
                SchedulerMetrics::inc(&self.metrics.jobs_failed);
                if let Err(e) = self.store.fail(job.id, worker_id, &e.to_string(), None).await {
                    warn!(job_id = %job.id, error = %e, "Failure transition lost its lease");
                }
            }
        }
    }

    async fn reclaimer_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.reclaim_interval);
        // purge roughly hourly, expressed in reclaim ticks
        let purge_every = (3600 / self.settings.reclaim_interval.as_secs().max(1)).max(1);
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                _ = self.leasing.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.store.reclaim_expired().await {
                Ok(0) => {}
                Ok(n) => info!(reclaimed = n, "Expired leases returned to pending"),
                Err(e) => error!(error = %e, "Lease reclaim failed"),
            }

            tick_count += 1;
            if tick_count % purge_every == 0 {
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(self.settings.job_retention).unwrap_or_default();
                match self.store.purge_done(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => info!(purged = n, "Old done jobs purged"),
                    Err(e) => error!(error = %e, "Job purge failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wf_store::{EnqueueRequest, MemoryJobStore};

    enum Behavior {
        Succeed,
        FailTransientTimes(u32),
        FailTerminal,
        Suspend,
        RegisterAndBlock { exec_id: Uuid, bus: CancellationBus },
    }

    struct TestHandler {
        payload_type: PayloadType,
        behavior: Behavior,
        calls: AtomicU32,
    }

    impl TestHandler {
        fn new(payload_type: PayloadType, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                payload_type,
                behavior,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        fn payload_type(&self) -> PayloadType {
            self.payload_type
        }

        async fn handle(&self, ctx: JobContext, _payload: serde_json::Value) -> wf_core::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match &self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::FailTransientTimes(n) => {
                    if call <= *n {
                        Err(Error::External("synthetic transient failure".into()))
                    } else {
                        Ok(())
                    }
                }
                Behavior::FailTerminal => Err(Error::Validation("synthetic bad input".into())),
                Behavior::Suspend => Err(Error::Suspended),
                Behavior::RegisterAndBlock { exec_id, bus } => {
                    bus.register(*exec_id, ctx.cancellation.clone());
                    ctx.cancellation.cancelled().await;
                    bus.unregister(*exec_id);
                    Err(Error::Cancelled)
                }
            }
        }
    }

    fn fast_settings() -> SchedulerSettings {
        SchedulerSettings {
            worker_count: 1,
            lease_ttl: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            reclaim_interval: Duration::from_secs(60),
            job_retention: Duration::from_secs(3600),
            queues: vec![
                (PayloadType::FlowExecution, 8),
                (PayloadType::Notification, 2),
            ],
        }
    }

    async fn wait_for_status(store: &MemoryJobStore, id: Uuid, status: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = store.get(id).await.unwrap() {
                if job.status == status {
                    return;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} never reached status {}",
                id,
                status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_successful_job_is_completed() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = TestHandler::new(PayloadType::FlowExecution, Behavior::Succeed);
        let scheduler = Scheduler::builder(store.clone())
            .settings(fast_settings())
            .notifications(store.notifications().clone())
            .handler(handler.clone())
            .build();
        scheduler.start().await;

        let id = store
            .enqueue(EnqueueRequest::now(PayloadType::FlowExecution, json!({}), 3))
            .await
            .unwrap();

        wait_for_status(&store, id, "done").await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.metrics().get_completed(), 1);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_then_succeeds() {
        let store = Arc::new(MemoryJobStore::new());
        let handler =
            TestHandler::new(PayloadType::FlowExecution, Behavior::FailTransientTimes(1));
        let scheduler = Scheduler::builder(store.clone())
            .settings(fast_settings())
            .notifications(store.notifications().clone())
            .handler(handler.clone())
            .build();
        scheduler.start().await;

        let id = store
            .enqueue(EnqueueRequest::now(PayloadType::FlowExecution, json!({}), 3))
            .await
            .unwrap();

        wait_for_status(&store, id, "done").await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.metrics().get_requeued(), 1);
        assert_eq!(scheduler.metrics().get_completed(), 1);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_terminal_error_never_retries() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = TestHandler::new(PayloadType::FlowExecution, Behavior::FailTerminal);
        let scheduler = Scheduler::builder(store.clone())
            .settings(fast_settings())
            .notifications(store.notifications().clone())
            .handler(handler.clone())
            .build();
        scheduler.start().await;

        let id = store
            .enqueue(EnqueueRequest::now(PayloadType::FlowExecution, json!({}), 3))
            .await
            .unwrap();

        wait_for_status(&store, id, "failed").await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.last_error.unwrap().contains("synthetic bad input"));

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_suspension_marks_job_done() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = TestHandler::new(PayloadType::FlowExecution, Behavior::Suspend);
        let scheduler = Scheduler::builder(store.clone())
            .settings(fast_settings())
            .notifications(store.notifications().clone())
            .handler(handler.clone())
            .build();
        scheduler.start().await;

        let id = store
            .enqueue(EnqueueRequest::now(PayloadType::FlowExecution, json!({}), 3))
            .await
            .unwrap();

        wait_for_status(&store, id, "done").await;
        assert_eq!(scheduler.metrics().get_suspended(), 1);
        assert_eq!(scheduler.metrics().get_completed(), 0);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_job_without_handler_is_unroutable() {
        let store = Arc::new(MemoryJobStore::new());
        // only a flow_execution handler is registered
        let handler = TestHandler::new(PayloadType::FlowExecution, Behavior::Succeed);
        let scheduler = Scheduler::builder(store.clone())
            .settings(fast_settings())
            .notifications(store.notifications().clone())
            .handler(handler)
            .build();
        scheduler.start().await;

        let id = store
            .enqueue(EnqueueRequest::now(PayloadType::Notification, json!({}), 3))
            .await
            .unwrap();

        wait_for_status(&store, id, "failed").await;
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.last_error.unwrap().contains("unroutable"));
        assert_eq!(scheduler.metrics().get_unroutable(), 1);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cancel_job_reaches_running_handler() {
        let store = Arc::new(MemoryJobStore::new());
        let exec_id = Uuid::new_v4();
        let bus = CancellationBus::new();
        let handler = TestHandler::new(
            PayloadType::FlowExecution,
            Behavior::RegisterAndBlock {
                exec_id,
                bus: bus.clone(),
            },
        );
        let scheduler = Scheduler::builder(store.clone())
            .settings(fast_settings())
            .notifications(store.notifications().clone())
            .cancellation_bus(bus)
            .handler(handler)
            .build();
        scheduler.start().await;

        let id = store
            .enqueue(EnqueueRequest::now(PayloadType::FlowExecution, json!({}), 3))
            .await
            .unwrap();

        // wait for the handler to register itself on the bus
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while scheduler.cancellation_bus().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "handler never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(scheduler.cancel_job(exec_id));
        wait_for_status(&store, id, "cancelled").await;
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.lease_owner.is_none());
        assert_eq!(scheduler.metrics().get_cancelled(), 1);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_grace_cancels_running_handler() {
        let store = Arc::new(MemoryJobStore::new());
        let exec_id = Uuid::new_v4();
        let bus = CancellationBus::new();
        let handler = TestHandler::new(
            PayloadType::FlowExecution,
            Behavior::RegisterAndBlock {
                exec_id,
                bus: bus.clone(),
            },
        );
        let scheduler = Scheduler::builder(store.clone())
            .settings(fast_settings())
            .notifications(store.notifications().clone())
            .cancellation_bus(bus.clone())
            .handler(handler)
            .build();
        scheduler.start().await;

        let id = store
            .enqueue(EnqueueRequest::now(PayloadType::FlowExecution, json!({}), 3))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while bus.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "handler never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // the handler blocks forever, so shutdown must cut it at grace
        scheduler.shutdown(Duration::from_millis(100)).await;

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, "cancelled");
    }
}
