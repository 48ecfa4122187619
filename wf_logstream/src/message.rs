//! ABOUTME: The on-disk log record: one self-delimited JSON object per line
//! ABOUTME: Value bytes are base64; lines without a retry field mean retry 1

use serde::{Deserialize, Serialize};
use wf_core::{Error, Result};

/// Kinds of log records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Log,
    Error,
    Result,
    Cancelled,
}

/// One log line. The JSON shape is the on-disk contract; older files may
/// lack `retry`, which reads back as 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub action_id: String,
    pub message_type: MessageType,
    pub node_id: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    /// RFC3339 UTC
    pub timestamp: String,
    #[serde(default = "default_retry")]
    pub retry: u32,
}

fn default_retry() -> u32 {
    1
}

impl StreamMessage {
    pub fn new(
        action_id: impl Into<String>,
        node_id: impl Into<String>,
        retry: u32,
        message_type: MessageType,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            message_type,
            node_id: node_id.into(),
            value: value.into(),
            timestamp: wf_core::now_rfc3339(),
            retry,
        }
    }

    /// Serialise to a newline-terminated JSON line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| Error::Storage(format!("Failed to encode log line: {}", e)))?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line back
    pub fn parse_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| Error::Storage(format!("Malformed log line: {}", e)))
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_roundtrip() {
        let msg = StreamMessage::new("build", "n1", 2, MessageType::Log, b"hello".to_vec());
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let back = StreamMessage::parse_line(&line).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.value, b"hello");
    }

    #[test]
    fn test_value_is_base64_on_disk() {
        let msg = StreamMessage::new("build", "local", 1, MessageType::Result, b"ok".to_vec());
        let line = msg.to_line().unwrap();
        let raw: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(raw["value"], "b2s=");
        assert_eq!(raw["message_type"], "result");
    }

    #[test]
    fn test_missing_retry_reads_as_one() {
        let line = r#"{"action_id":"a","message_type":"log","node_id":"local","value":"","timestamp":"2021-01-01T00:00:00Z"}"#;
        let msg = StreamMessage::parse_line(line).unwrap();
        assert_eq!(msg.retry, 1);
    }

    #[test]
    fn test_malformed_line_rejected() {
        assert!(StreamMessage::parse_line("not json").is_err());
        assert!(StreamMessage::parse_line(r#"{"action_id":"a"}"#).is_err());
    }
}
