//! ABOUTME: Approval decisions and the resume path back into the scheduler
//! ABOUTME: Deciding enqueues a fresh job; local waiters get a courtesy nudge

use crate::state::{ApprovalGate, ExecutionStore, FlowResolver};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;
use wf_core::{Error, Result};
use wf_db::{Approval, ApprovalStatus};
use wf_store::{EnqueueRequest, FlowExecutionPayload, JobStore, PayloadType};

/// Coordinates approval rows with execution resumption. The re-enqueued job
/// is the authoritative resume path; the per-action Notify only serves
/// in-process observers and is best effort.
pub struct ApprovalService {
    approvals: Arc<dyn ApprovalGate>,
    executions: Arc<dyn ExecutionStore>,
    flows: Arc<dyn FlowResolver>,
    store: Arc<dyn JobStore>,
    waiters: DashMap<(Uuid, String), Arc<Notify>>,
}

impl ApprovalService {
    pub fn new(
        approvals: Arc<dyn ApprovalGate>,
        executions: Arc<dyn ExecutionStore>,
        flows: Arc<dyn FlowResolver>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            approvals,
            executions,
            flows,
            store,
            waiters: DashMap::new(),
        }
    }

    /// Open (or return the existing) pending approval for an action
    pub async fn request(&self, exec_id: Uuid, action_id: &str) -> Result<Approval> {
        self.approvals.create_pending(exec_id, action_id).await
    }

    /// The pending approval of an execution's action, if any
    pub async fn pending(&self, exec_id: Uuid, action_id: &str) -> Result<Option<Approval>> {
        let latest = self.approvals.latest(exec_id, action_id).await?;
        Ok(latest.filter(|a| a.status == "pending"))
    }

    /// Record a decision and enqueue the resuming flow_execution job. The
    /// handler re-reads the approval row at the gated action: approved
    /// proceeds, rejected cancels.
    pub async fn decide(
        &self,
        approval_id: Uuid,
        decision: ApprovalStatus,
        decided_by: &str,
    ) -> Result<Approval> {
        let approval = self
            .approvals
            .decide(approval_id, decision, decided_by)
            .await?;

        let execution = self
            .executions
            .latest(approval.exec_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Execution {} not found", approval.exec_id))
            })?;
        let flow = self
            .flows
            .flow_by_dbid(execution.flow_id)
            .await
            .ok_or_else(|| {
                Error::NotFound(format!("Flow {} is no longer active", execution.flow_id))
            })?;

        let payload = FlowExecutionPayload {
            exec_id: approval.exec_id,
            flow_slug: flow.slug().to_string(),
            namespace: flow.namespace.clone(),
            input: execution.input.clone(),
            trigger_type: execution.trigger_type.clone(),
            triggered_by: decided_by.to_string(),
            retry_from_action: Some(approval.action_id.clone()),
            scheduled_at: None,
        };

        self.store
            .enqueue(EnqueueRequest::now(
                PayloadType::FlowExecution,
                serde_json::to_value(&payload)?,
                1,
            ))
            .await?;

        info!(
            exec_id = %approval.exec_id,
            action_id = %approval.action_id,
            decision = %approval.status,
            decided_by = %decided_by,
            "Approval decided, resume job enqueued"
        );

        // Local wakeup; remote replicas resume through the job alone.
        if let Some(waiter) = self
            .waiters
            .get(&(approval.exec_id, approval.action_id.clone()))
        {
            waiter.notify_waiters();
        }

        Ok(approval)
    }

    /// In-process wakeup handle for an approval gate
    pub fn wait_handle(&self, exec_id: Uuid, action_id: &str) -> Arc<Notify> {
        self.waiters
            .entry((exec_id, action_id.to_string()))
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}
