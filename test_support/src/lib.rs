//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Common test fixtures for all weft crates

/// Namespace used by cross-crate tests
pub fn test_namespace() -> String {
    "testspace".to_string()
}

/// A fresh execution id for tests
pub fn test_exec_id() -> uuid::Uuid {
    uuid::Uuid::new_v4()
}

/// Minimal flow-execution input map used by handler tests
pub fn test_input() -> serde_json::Value {
    serde_json::json!({ "tag": "v1" })
}
