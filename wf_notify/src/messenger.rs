//! ABOUTME: Messenger seam: one adapter per delivery channel
//! ABOUTME: Concrete transports plug in externally; a log adapter ships here

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use wf_core::Result;

/// A formatted notification ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

/// A delivery channel adapter
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Channel name this messenger serves (email, slack, webhook, ...)
    fn channel(&self) -> &str;

    async fn deliver(&self, message: &Message) -> Result<()>;
}

/// Messengers by channel name
#[derive(Default)]
pub struct MessengerRegistry {
    messengers: HashMap<String, Arc<dyn Messenger>>,
}

impl MessengerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, messenger: Arc<dyn Messenger>) {
        self.messengers
            .insert(messenger.channel().to_string(), messenger);
    }

    pub fn get(&self, channel: &str) -> Option<Arc<dyn Messenger>> {
        self.messengers.get(channel).cloned()
    }
}

/// Fallback adapter that delivers into the process log. Useful for
/// deployments without a real transport and as the default wiring.
pub struct LogMessenger {
    channel: String,
}

impl LogMessenger {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Messenger for LogMessenger {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn deliver(&self, message: &Message) -> Result<()> {
        info!(
            channel = %self.channel,
            recipients = message.recipients.len(),
            subject = %message.subject,
            "Notification delivered to log"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_lookup_and_log_delivery() {
        let mut registry = MessengerRegistry::new();
        registry.register(Arc::new(LogMessenger::new("ops")));

        let messenger = registry.get("ops").expect("registered channel");
        assert!(registry.get("pager").is_none());

        let message = Message {
            subject: "s".to_string(),
            body: "b".to_string(),
            recipients: vec!["ops@example.com".to_string()],
        };
        messenger.deliver(&message).await.unwrap();
    }
}
