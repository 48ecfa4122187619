//! ABOUTME: Job entity and the closed payload-type and status sets
//! ABOUTME: Jobs map one-to-one to an execution or a notification delivery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use wf_core::{Error, Result};

/// Closed set of job payload kinds. Dispatch is a registry lookup keyed by
/// this type, never dynamic discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    FlowExecution,
    Notification,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowExecution => "flow_execution",
            Self::Notification => "notification",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "flow_execution" => Ok(Self::FlowExecution),
            "notification" => Ok(Self::Notification),
            other => Err(Error::Validation(format!("Unknown payload type: {}", other))),
        }
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Leased,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Validation(format!("Unknown job status: {}", other))),
        }
    }
}

/// Job entity
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub payload_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn payload_type(&self) -> Result<PayloadType> {
        PayloadType::parse(&self.payload_type)
    }

    pub fn status(&self) -> Result<JobStatus> {
        JobStatus::parse(&self.status)
    }

    /// Decode the payload into a concrete type
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Validation(format!("Malformed job payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_type_roundtrip() {
        assert_eq!(
            PayloadType::parse("flow_execution").unwrap(),
            PayloadType::FlowExecution
        );
        assert_eq!(
            PayloadType::parse("notification").unwrap(),
            PayloadType::Notification
        );
        assert!(PayloadType::parse("shell_script").is_err());
    }

    #[test]
    fn test_job_status_roundtrip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Leased,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()).unwrap(), s);
        }
    }
}
