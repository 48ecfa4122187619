//! ABOUTME: Notification delivery: messenger adapters behind a channel registry
//! ABOUTME: Consumes notification jobs and formats terminal-event messages

pub mod handler;
pub mod messenger;

pub use handler::NotificationHandler;
pub use messenger::{LogMessenger, Message, Messenger, MessengerRegistry};
