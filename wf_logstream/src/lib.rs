//! ABOUTME: Per-execution append-only log files with rotation and retention
//! ABOUTME: Live tailing feeds concurrent consumers through bounded channels

pub mod logger;
pub mod manager;
pub mod message;

pub use logger::{ExecutionLogger, ScopedLogger};
pub use manager::{LogManager, LogManagerConfig};
pub use message::{MessageType, StreamMessage};
