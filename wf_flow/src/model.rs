//! ABOUTME: Declarative flow shape parsed from YAML files
//! ABOUTME: Structural validation lives here; inputs are checked at trigger time

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use wf_core::{Error, Result};

/// Flow metadata block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMetadata {
    /// Slug identifying the flow within its namespace
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Optional; when present it must match the directory the file lives in
    #[serde(default)]
    pub namespace: Option<String>,
    /// Declared cron schedules (5-field expressions, fired in UTC)
    #[serde(default)]
    pub schedules: Vec<String>,
}

/// Input field kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    String,
    Number,
    Password,
    File,
    Datetime,
    Checkbox,
    Select,
}

/// One typed flow input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InputKind,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Expression over `{value, inputs}` that must evaluate to true
    #[serde(default)]
    pub validation: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    /// Choices for select inputs
    #[serde(default)]
    pub options: Vec<String>,
}

/// One step of a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub executor: String,
    /// Executor-specific configuration
    #[serde(default)]
    pub with: HashMap<String, serde_json::Value>,
    /// Gate this action on a human decision
    #[serde(default)]
    pub approval: bool,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// File paths pulled back from the node after the action runs
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Expression over `{inputs, results, env}`; absent means run
    #[serde(default)]
    pub condition: Option<String>,
    /// Target node names; empty means the local synthetic node
    #[serde(default)]
    pub on: Vec<String>,
}

/// A parsed flow definition plus the registry's bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub metadata: FlowMetadata,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub outputs: HashMap<String, String>,

    /// Database id, set by the registry after upsert
    #[serde(skip)]
    pub flow_dbid: i64,
    /// Database id of the owning namespace, set by the registry
    #[serde(skip)]
    pub namespace_dbid: i64,
    /// SHA-256 of the source file bytes, set by the registry
    #[serde(skip)]
    pub checksum: String,
    /// Namespace resolved from the directory, set by the registry
    #[serde(skip)]
    pub namespace: String,
}

fn input_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static regex"))
}

impl Flow {
    /// Parse a flow definition from YAML bytes
    pub fn parse_yaml(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("Malformed flow file: {}", e)))
    }

    pub fn slug(&self) -> &str {
        &self.metadata.id
    }

    /// Position of an action by id
    pub fn action_index(&self, action_id: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.id == action_id)
    }

    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// A flow can be scheduled only when every input carries a default
    pub fn is_schedulable(&self) -> bool {
        self.inputs.iter().all(|i| i.default.is_some())
    }

    /// Input defaults as the input map of a scheduled run
    pub fn default_inputs(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .inputs
            .iter()
            .filter_map(|i| i.default.clone().map(|d| (i.name.clone(), d)))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Structural validation against the known executor set
    pub fn validate(&self, known_executors: &HashSet<String>) -> Result<()> {
        if self.metadata.id.is_empty() {
            return Err(Error::Validation("Flow metadata.id is empty".to_string()));
        }
        if self.actions.is_empty() {
            return Err(Error::Validation(format!(
                "Flow '{}' declares no actions",
                self.metadata.id
            )));
        }

        let mut seen_actions = HashSet::new();
        for action in &self.actions {
            if action.id.is_empty() {
                return Err(Error::Validation(format!(
                    "Flow '{}' has an action without an id",
                    self.metadata.id
                )));
            }
            if !seen_actions.insert(action.id.as_str()) {
                return Err(Error::Validation(format!(
                    "Flow '{}' has duplicate action id '{}'",
                    self.metadata.id, action.id
                )));
            }
            if !known_executors.contains(&action.executor) {
                return Err(Error::Validation(format!(
                    "Flow '{}' action '{}' uses unknown executor '{}'",
                    self.metadata.id, action.id, action.executor
                )));
            }
            if action.on.iter().any(|n| n.is_empty()) {
                return Err(Error::Validation(format!(
                    "Flow '{}' action '{}' has an empty node name",
                    self.metadata.id, action.id
                )));
            }
        }

        let mut seen_inputs = HashSet::new();
        for input in &self.inputs {
            if !input_name_pattern().is_match(&input.name) {
                return Err(Error::Validation(format!(
                    "Flow '{}' input '{}' must be alphanumeric or underscore",
                    self.metadata.id, input.name
                )));
            }
            if !seen_inputs.insert(input.name.as_str()) {
                return Err(Error::Validation(format!(
                    "Flow '{}' has duplicate input '{}'",
                    self.metadata.id, input.name
                )));
            }
            if input.kind == InputKind::Select && input.options.is_empty() {
                return Err(Error::Validation(format!(
                    "Flow '{}' select input '{}' has no options",
                    self.metadata.id, input.name
                )));
            }
        }

        if !self.metadata.schedules.is_empty() {
            if !self.is_schedulable() {
                return Err(Error::Validation(format!(
                    "Flow '{}' declares schedules but not every input has a default",
                    self.metadata.id
                )));
            }
            for expr in &self.metadata.schedules {
                wf_cron::validate_expression(expr)?;
            }
        }

        Ok(())
    }
}
