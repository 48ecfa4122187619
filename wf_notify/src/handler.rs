//! ABOUTME: Handler for notification jobs: resolve channel, format, deliver
//! ABOUTME: Unknown channels are terminal; transport failures retry

use crate::messenger::{Message, MessengerRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use wf_core::{Error, Result};
use wf_sched::{JobContext, JobHandler};
use wf_store::{NotificationPayload, PayloadType};

/// Handler for `notification` jobs. Delivery failures surface as transient
/// errors so the scheduler retries them with backoff up to the job's
/// max_attempts; after that the job fails and the notification is dropped.
pub struct NotificationHandler {
    messengers: Arc<MessengerRegistry>,
}

impl NotificationHandler {
    pub fn new(messengers: Arc<MessengerRegistry>) -> Self {
        Self { messengers }
    }

    fn format(payload: &NotificationPayload) -> Message {
        Message {
            subject: format!("[weft] {} {}", payload.flow_name, payload.status),
            body: format!(
                "Flow '{}' execution {} finished the '{}' event with status {}.",
                payload.flow_name, payload.exec_id, payload.event, payload.status
            ),
            recipients: payload.recipients.clone(),
        }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    fn payload_type(&self) -> PayloadType {
        PayloadType::Notification
    }

    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<()> {
        let payload: NotificationPayload = serde_json::from_value(payload)
            .map_err(|e| Error::Validation(format!("Malformed notification payload: {}", e)))?;

        let messenger = self.messengers.get(&payload.channel).ok_or_else(|| {
            Error::NotFound(format!("No messenger for channel '{}'", payload.channel))
        })?;

        let message = Self::format(&payload);
        debug!(
            job_id = %ctx.job_id,
            channel = %payload.channel,
            attempt = ctx.attempt,
            "Delivering notification"
        );

        messenger.deliver(&message).await?;

        info!(
            exec_id = %payload.exec_id,
            channel = %payload.channel,
            event = %payload.event,
            "Notification delivered"
        );
        Ok(())
    }
}
