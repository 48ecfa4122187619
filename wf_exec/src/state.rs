//! ABOUTME: Trait seams over durable execution, approval, node, and flow state
//! ABOUTME: Postgres implementations delegate to wf_db; tests use memory ones

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use wf_core::Result;
use wf_db::{
    Approval, ApprovalRepository, ApprovalStatus, ExecutionRepository, ExecutionRow,
    ExecutionStatus, NewExecution, NodeRepository,
};
use wf_flow::Flow;

use crate::executor::ExecTarget;

/// Durable execution-log state as the handler sees it
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn latest(&self, exec_id: Uuid) -> Result<Option<ExecutionRow>>;
    async fn create(&self, req: NewExecution) -> Result<ExecutionRow>;
    /// Append a retry version carrying input and retry counters forward
    async fn append_retry_version(&self, exec_id: Uuid) -> Result<ExecutionRow>;
    async fn mark_running(&self, exec_id: Uuid) -> Result<()>;
    async fn set_current_action(&self, exec_id: Uuid, action_id: &str) -> Result<()>;
    async fn set_action_retries(
        &self,
        exec_id: Uuid,
        retries: &HashMap<String, u32>,
    ) -> Result<()>;
    async fn set_status(&self, exec_id: Uuid, status: ExecutionStatus) -> Result<()>;
    async fn finish(
        &self,
        exec_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()>;
}

/// Durable approval rows as the handler sees them
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn latest(&self, exec_id: Uuid, action_id: &str) -> Result<Option<Approval>>;
    async fn create_pending(&self, exec_id: Uuid, action_id: &str) -> Result<Approval>;
    async fn get(&self, id: Uuid) -> Result<Option<Approval>>;
    async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalStatus,
        decided_by: &str,
    ) -> Result<Approval>;
}

/// Node name resolution within a namespace
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// Resolve the named nodes; implementations return only the nodes that
    /// exist, and callers treat missing names as terminal errors.
    async fn find_by_names(&self, namespace_id: i64, names: &[String])
        -> Result<Vec<ExecTarget>>;
}

/// The handler's read-only view of the flow registry
#[async_trait]
pub trait FlowResolver: Send + Sync {
    async fn flow_by_slug(&self, namespace: &str, slug: &str) -> Option<Arc<Flow>>;
    async fn flow_by_dbid(&self, flow_dbid: i64) -> Option<Arc<Flow>>;
}

#[async_trait]
impl FlowResolver for wf_flow::FlowRegistry {
    async fn flow_by_slug(&self, namespace: &str, slug: &str) -> Option<Arc<Flow>> {
        self.get_by_slug(namespace, slug).await
    }

    async fn flow_by_dbid(&self, flow_dbid: i64) -> Option<Arc<Flow>> {
        self.get_by_dbid(flow_dbid).await
    }
}

/// Postgres-backed execution store
pub struct PgExecutionStore {
    repo: ExecutionRepository,
}

impl PgExecutionStore {
    pub fn new(repo: ExecutionRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn latest(&self, exec_id: Uuid) -> Result<Option<ExecutionRow>> {
        self.repo.latest(exec_id).await
    }

    async fn create(&self, req: NewExecution) -> Result<ExecutionRow> {
        self.repo.create(req).await
    }

    async fn append_retry_version(&self, exec_id: Uuid) -> Result<ExecutionRow> {
        self.repo.append_version(exec_id).await
    }

    async fn mark_running(&self, exec_id: Uuid) -> Result<()> {
        self.repo.mark_running(exec_id).await
    }

    async fn set_current_action(&self, exec_id: Uuid, action_id: &str) -> Result<()> {
        self.repo.set_current_action(exec_id, action_id).await
    }

    async fn set_action_retries(
        &self,
        exec_id: Uuid,
        retries: &HashMap<String, u32>,
    ) -> Result<()> {
        self.repo.set_action_retries(exec_id, retries).await
    }

    async fn set_status(&self, exec_id: Uuid, status: ExecutionStatus) -> Result<()> {
        self.repo.set_status(exec_id, status).await
    }

    async fn finish(
        &self,
        exec_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.repo.finish(exec_id, status, error).await
    }
}

/// Postgres-backed approval gate
pub struct PgApprovalGate {
    repo: ApprovalRepository,
}

impl PgApprovalGate {
    pub fn new(repo: ApprovalRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ApprovalGate for PgApprovalGate {
    async fn latest(&self, exec_id: Uuid, action_id: &str) -> Result<Option<Approval>> {
        self.repo.latest(exec_id, action_id).await
    }

    async fn create_pending(&self, exec_id: Uuid, action_id: &str) -> Result<Approval> {
        self.repo.create_pending(exec_id, action_id).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Approval>> {
        self.repo.get(id).await
    }

    async fn decide(
        &self,
        id: Uuid,
        decision: ApprovalStatus,
        decided_by: &str,
    ) -> Result<Approval> {
        self.repo.decide(id, decision, decided_by).await
    }
}

/// Postgres-backed node directory
pub struct PgNodeDirectory {
    repo: NodeRepository,
}

impl PgNodeDirectory {
    pub fn new(repo: NodeRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl NodeDirectory for PgNodeDirectory {
    async fn find_by_names(
        &self,
        namespace_id: i64,
        names: &[String],
    ) -> Result<Vec<ExecTarget>> {
        let rows = self.repo.find_by_names(namespace_id, names).await?;
        Ok(rows
            .into_iter()
            .map(|n| ExecTarget {
                name: n.name,
                address: Some(n.address),
            })
            .collect())
    }
}
