//! ABOUTME: In-memory execution, approval, node, and flow state for tests
//! ABOUTME: Same transition rules as the Postgres implementations

use crate::executor::ExecTarget;
use crate::state::{ApprovalGate, ExecutionStore, FlowResolver, NodeDirectory};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use wf_core::{Error, Result};
use wf_db::{Approval, ApprovalStatus, ExecutionRow, ExecutionStatus, NewExecution};
use wf_flow::Flow;

/// In-memory execution log with append-only versions
#[derive(Default)]
pub struct MemoryExecutionStore {
    rows: Mutex<Vec<ExecutionRow>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All versions of an execution, for assertions
    pub fn versions(&self, exec_id: Uuid) -> Vec<ExecutionRow> {
        let mut rows: Vec<ExecutionRow> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.exec_id == exec_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.version);
        rows
    }

    fn with_latest<T>(
        &self,
        exec_id: Uuid,
        f: impl FnOnce(&mut ExecutionRow) -> T,
    ) -> Result<T> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .filter(|r| r.exec_id == exec_id)
            .max_by_key(|r| r.version)
            .ok_or_else(|| Error::NotFound(format!("Execution {} not found", exec_id)))?;
        row.updated_at = Utc::now();
        Ok(f(row))
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn latest(&self, exec_id: Uuid) -> Result<Option<ExecutionRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.exec_id == exec_id)
            .max_by_key(|r| r.version)
            .cloned())
    }

    async fn create(&self, req: NewExecution) -> Result<ExecutionRow> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.exec_id == req.exec_id) {
            return Err(Error::Validation(format!(
                "Execution {} version 1 already exists",
                req.exec_id
            )));
        }
        let now = Utc::now();
        let row = ExecutionRow {
            id: rows.len() as i64 + 1,
            exec_id: req.exec_id,
            version: 1,
            flow_id: req.flow_id,
            namespace_id: req.namespace_id,
            status: ExecutionStatus::Pending.as_str().to_string(),
            current_action_id: None,
            input: req.input,
            action_retries: serde_json::json!({}),
            trigger_type: req.trigger_type.as_str().to_string(),
            triggered_by: req.triggered_by,
            scheduled_at: req.scheduled_at,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn append_retry_version(&self, exec_id: Uuid) -> Result<ExecutionRow> {
        let mut rows = self.rows.lock().unwrap();
        let latest = rows
            .iter()
            .filter(|r| r.exec_id == exec_id)
            .max_by_key(|r| r.version)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Execution {} has no versions", exec_id)))?;
        let now = Utc::now();
        let next_id = rows.len() as i64 + 1;
        let row = ExecutionRow {
            id: next_id,
            version: latest.version + 1,
            status: ExecutionStatus::Pending.as_str().to_string(),
            trigger_type: "retry".to_string(),
            current_action_id: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
            ..latest
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn mark_running(&self, exec_id: Uuid) -> Result<()> {
        self.with_latest(exec_id, |row| {
            row.status = ExecutionStatus::Running.as_str().to_string();
            if row.started_at.is_none() {
                row.started_at = Some(Utc::now());
            }
        })
    }

    async fn set_current_action(&self, exec_id: Uuid, action_id: &str) -> Result<()> {
        self.with_latest(exec_id, |row| {
            row.current_action_id = Some(action_id.to_string());
        })
    }

    async fn set_action_retries(
        &self,
        exec_id: Uuid,
        retries: &HashMap<String, u32>,
    ) -> Result<()> {
        let value = serde_json::to_value(retries)?;
        self.with_latest(exec_id, |row| {
            row.action_retries = value;
        })
    }

    async fn set_status(&self, exec_id: Uuid, status: ExecutionStatus) -> Result<()> {
        self.with_latest(exec_id, |row| {
            row.status = status.as_str().to_string();
        })
    }

    async fn finish(
        &self,
        exec_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_latest(exec_id, |row| {
            row.status = status.as_str().to_string();
            row.error = error.map(|s| s.to_string());
            row.completed_at = Some(Utc::now());
        })
    }
}

/// In-memory approval rows
#[derive(Default)]
pub struct MemoryApprovalGate {
    rows: Mutex<Vec<Approval>>,
}

impl MemoryApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalGate for MemoryApprovalGate {
    async fn latest(&self, exec_id: Uuid, action_id: &str) -> Result<Option<Approval>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.exec_id == exec_id && a.action_id == action_id)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn create_pending(&self, exec_id: Uuid, action_id: &str) -> Result<Approval> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows
            .iter()
            .find(|a| a.exec_id == exec_id && a.action_id == action_id && a.status == "pending")
        {
            return Ok(existing.clone());
        }
        let approval = Approval {
            id: Uuid::new_v4(),
            exec_id,
            action_id: action_id.to_string(),
            status: ApprovalStatus::Pending.as_str().to_string(),
            decided_by: None,
            decided_at: None,
            created_at: Utc::now(),
        };
        rows.push(approval.clone());
        Ok(approval)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Approval>> {
        Ok(self.rows.lock().unwrap().iter().find(|a| a.id == id).cloned())
    }

    async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalStatus,
        decided_by: &str,
    ) -> Result<Approval> {
        if decision == ApprovalStatus::Pending {
            return Err(Error::Validation(
                "Approval decision must be approved or rejected".to_string(),
            ));
        }
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|a| a.id == id && a.status == "pending")
            .ok_or_else(|| {
                Error::Validation(format!("Approval {} is not pending or does not exist", id))
            })?;
        row.status = decision.as_str().to_string();
        row.decided_by = Some(decided_by.to_string());
        row.decided_at = Some(Utc::now());
        Ok(row.clone())
    }
}

/// Fixed node set per namespace
#[derive(Default)]
pub struct MemoryNodeDirectory {
    nodes: Mutex<HashMap<i64, Vec<ExecTarget>>>,
}

impl MemoryNodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, namespace_id: i64, name: &str, address: &str) {
        self.nodes
            .lock()
            .unwrap()
            .entry(namespace_id)
            .or_default()
            .push(ExecTarget {
                name: name.to_string(),
                address: Some(address.to_string()),
            });
    }
}

#[async_trait]
impl NodeDirectory for MemoryNodeDirectory {
    async fn find_by_names(
        &self,
        namespace_id: i64,
        names: &[String],
    ) -> Result<Vec<ExecTarget>> {
        let nodes = self.nodes.lock().unwrap();
        let known = nodes.get(&namespace_id).cloned().unwrap_or_default();
        Ok(known
            .into_iter()
            .filter(|n| names.contains(&n.name))
            .collect())
    }
}

/// Fixed flow set for tests
#[derive(Default)]
pub struct StaticFlows {
    by_slug: HashMap<(String, String), Arc<Flow>>,
    by_dbid: HashMap<i64, Arc<Flow>>,
}

impl StaticFlows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, flow: Flow) {
        let flow = Arc::new(flow);
        self.by_slug.insert(
            (flow.namespace.clone(), flow.slug().to_string()),
            flow.clone(),
        );
        self.by_dbid.insert(flow.flow_dbid, flow);
    }
}

#[async_trait]
impl FlowResolver for StaticFlows {
    async fn flow_by_slug(&self, namespace: &str, slug: &str) -> Option<Arc<Flow>> {
        self.by_slug
            .get(&(namespace.to_string(), slug.to_string()))
            .cloned()
    }

    async fn flow_by_dbid(&self, flow_dbid: i64) -> Option<Arc<Flow>> {
        self.by_dbid.get(&flow_dbid).cloned()
    }
}
