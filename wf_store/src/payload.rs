//! ABOUTME: Wire formats of job payloads, one struct per payload type
//! ABOUTME: Handlers decode these from the job's JSON bytes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of a `flow_execution` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionPayload {
    pub exec_id: Uuid,
    pub flow_slug: String,
    pub namespace: String,
    #[serde(default)]
    pub input: serde_json::Value,
    pub trigger_type: String,
    pub triggered_by: String,
    /// Set on retries and approval resumes: actions before this id are skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_from_action: Option<String>,
    /// The cron instant that produced this job, for schedule triggers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Payload of a `notification` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub channel: String,
    pub recipients: Vec<String>,
    pub event: String,
    pub exec_id: Uuid,
    pub flow_name: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flow_execution_payload_roundtrip() {
        let payload = FlowExecutionPayload {
            exec_id: Uuid::new_v4(),
            flow_slug: "demo".to_string(),
            namespace: "default".to_string(),
            input: json!({"tag": "v1"}),
            trigger_type: "manual".to_string(),
            triggered_by: "alice".to_string(),
            retry_from_action: None,
            scheduled_at: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        // optional fields stay off the wire when unset
        assert!(value.get("retry_from_action").is_none());
        let back: FlowExecutionPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back.flow_slug, "demo");
        assert_eq!(back.input["tag"], "v1");
    }

    #[test]
    fn test_notification_payload_roundtrip() {
        let payload = NotificationPayload {
            channel: "email".to_string(),
            recipients: vec!["ops@example.com".to_string()],
            event: "flow_completed".to_string(),
            exec_id: Uuid::new_v4(),
            flow_name: "demo".to_string(),
            status: "completed".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: NotificationPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.channel, "email");
        assert_eq!(back.recipients.len(), 1);
    }
}
