//! ABOUTME: Bridges Postgres NOTIFY into an in-process broadcast channel
//! ABOUTME: Workers select on this to wake as soon as a job is enqueued

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use wf_core::{Error, Result};

/// NOTIFY channel shared by all enqueue paths
pub const JOB_CHANNEL: &str = "weft_jobs";

/// Fan-out of job wakeups. The payload of each message is the payload_type
/// string of the enqueued job.
#[derive(Clone)]
pub struct JobNotifications {
    tx: broadcast::Sender<String>,
}

impl JobNotifications {
    /// Create a standalone wakeup channel not backed by Postgres. Used with
    /// the in-memory store and in tests.
    pub fn in_process() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Connect a LISTEN loop to the pool and fan notifications into the
    /// broadcast channel. The loop reconnects forever; missed notifications
    /// are covered by the scheduler's polling fallback.
    pub async fn start(pool: &PgPool) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect listener: {}", e)))?;

        listener
            .listen(JOB_CHANNEL)
            .await
            .map_err(|e| Error::Database(format!("Failed to LISTEN on {}: {}", JOB_CHANNEL, e)))?;

        let (tx, _) = broadcast::channel(256);
        let fanout = tx.clone();

        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        debug!(payload = notification.payload(), "Job wakeup received");
                        // Send errors just mean nobody is listening right now
                        let _ = fanout.send(notification.payload().to_string());
                    }
                    Err(e) => {
                        warn!(error = %e, "Job listener dropped, reconnect pending");
                        // PgListener reconnects internally on the next recv;
                        // back off briefly so a dead DB does not spin.
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self { tx })
    }

    /// Subscribe a worker to wakeups
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Sender half, for stores that publish wakeups in-process
    pub fn sender(&self) -> broadcast::Sender<String> {
        self.tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_fanout() {
        let notifications = JobNotifications::in_process();
        let mut rx = notifications.subscribe();

        notifications
            .sender()
            .send("flow_execution".to_string())
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got, "flow_execution");
    }
}
