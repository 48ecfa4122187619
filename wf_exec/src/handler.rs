//! ABOUTME: The flow execution state machine behind flow_execution jobs
//! ABOUTME: Conditions, approvals, per-action retries, and node fan-out

use crate::executor::{ExecArgs, ExecTarget, ExecutorRegistry};
use crate::secrets::SecretsProvider;
use crate::state::{ApprovalGate, ExecutionStore, FlowResolver, NodeDirectory};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wf_core::{Error, Result};
use wf_db::{ApprovalStatus, ExecutionRow, ExecutionStatus, NewExecution, TriggerType};
use wf_flow::{eval_bool, validate_input, ActionSpec, Flow, Scope};
use wf_logstream::{ExecutionLogger, LogManager, MessageType, ScopedLogger};
use wf_sched::{CancellationBus, JobContext, JobHandler};
use wf_store::{
    EnqueueRequest, FlowExecutionPayload, JobStore, NotificationPayload, PayloadType,
};

/// Who gets told about terminal executions
#[derive(Debug, Clone)]
pub struct NotificationRule {
    pub channel: String,
    pub recipients: Vec<String>,
    /// Terminal events this rule matches: completed, errored, cancelled
    pub events: Vec<String>,
}

/// Flow handler tuning
#[derive(Debug, Clone)]
pub struct FlowHandlerSettings {
    /// Wall-clock budget for one handler invocation
    pub execution_timeout: Duration,
    /// Per-action attempt budget; 1 means no retry
    pub max_action_retries: u32,
    /// Delay before a retried execution becomes dispatchable
    pub action_backoff: Duration,
    /// Cap on parallel node runs per action; default is the node count
    pub max_concurrency_per_action: Option<usize>,
    pub notifications: Vec<NotificationRule>,
}

impl Default for FlowHandlerSettings {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(3600),
            max_action_retries: 1,
            action_backoff: Duration::from_secs(10),
            max_concurrency_per_action: None,
            notifications: Vec::new(),
        }
    }
}

/// Handler for `flow_execution` jobs.
///
/// Flow-level retries are expressed as new execution versions plus a fresh
/// job, so flow_execution jobs are always enqueued with max_attempts = 1 and
/// the scheduler's own backoff never re-runs a flow.
pub struct FlowExecutionHandler {
    flows: Arc<dyn FlowResolver>,
    executions: Arc<dyn ExecutionStore>,
    approvals: Arc<dyn ApprovalGate>,
    nodes: Arc<dyn NodeDirectory>,
    secrets: Arc<dyn SecretsProvider>,
    executors: Arc<ExecutorRegistry>,
    logs: Arc<LogManager>,
    store: Arc<dyn JobStore>,
    bus: CancellationBus,
    settings: FlowHandlerSettings,
}

/// How the action loop ended when it did not fail
enum RunOutcome {
    Completed,
    /// A failed action had retries left; a new version job was enqueued
    Requeued,
    /// A rejected approval already finalized the execution as cancelled
    CancelledByRejection,
}

/// The action the execution is currently on, for checkpoint scoping when an
/// error surfaces outside the per-action code.
struct Cursor {
    action_id: String,
    retry: u32,
}

impl FlowExecutionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flows: Arc<dyn FlowResolver>,
        executions: Arc<dyn ExecutionStore>,
        approvals: Arc<dyn ApprovalGate>,
        nodes: Arc<dyn NodeDirectory>,
        secrets: Arc<dyn SecretsProvider>,
        executors: Arc<ExecutorRegistry>,
        logs: Arc<LogManager>,
        store: Arc<dyn JobStore>,
        bus: CancellationBus,
        settings: FlowHandlerSettings,
    ) -> Self {
        Self {
            flows,
            executions,
            approvals,
            nodes,
            secrets,
            executors,
            logs,
            store,
            bus,
            settings,
        }
    }

    /// Every exit from here leaves the execution row in a coherent state:
    /// terminal rows carry their error and close the logger; suspension and
    /// requeue leave the logger open for the follow-up job.
    async fn run(
        &self,
        token: CancellationToken,
        payload: &FlowExecutionPayload,
    ) -> Result<()> {
        let exec_id = payload.exec_id;

        let Some(flow) = self
            .flows
            .flow_by_slug(&payload.namespace, &payload.flow_slug)
            .await
        else {
            let err = Error::NotFound(format!(
                "Flow {}/{} not found",
                payload.namespace, payload.flow_slug
            ));
            // Best effort: an already-recorded execution gets the error.
            if self.executions.latest(exec_id).await?.is_some() {
                let _ = self
                    .executions
                    .finish(exec_id, ExecutionStatus::Errored, Some(&err.to_string()))
                    .await;
            }
            return Err(err);
        };

        let row = match self.executions.latest(exec_id).await? {
            Some(row) => {
                if row.status()?.is_terminal() {
                    // Replayed payload for a finished execution: no-op.
                    info!(exec_id = %exec_id, status = %row.status, "Execution already terminal, skipping");
                    return Ok(());
                }
                row
            }
            None => {
                self.executions
                    .create(NewExecution {
                        exec_id,
                        flow_id: flow.flow_dbid,
                        namespace_id: flow.namespace_dbid,
                        input: payload.input.clone(),
                        trigger_type: parse_trigger(&payload.trigger_type)?,
                        triggered_by: payload.triggered_by.clone(),
                        scheduled_at: payload.scheduled_at,
                    })
                    .await?
            }
        };

        let input = match validate_input(&flow, &payload.input) {
            Ok(input) => input,
            Err(e) => {
                if let Err(finish_err) = self
                    .executions
                    .finish(exec_id, ExecutionStatus::Errored, Some(&e.to_string()))
                    .await
                {
                    warn!(exec_id = %exec_id, error = %finish_err, "Failed to record error");
                }
                self.notify(&flow, exec_id, "errored").await;
                return Err(e);
            }
        };

        let logger = match self.logs.open_logger(exec_id).await {
            Ok(logger) => logger,
            Err(e) => {
                // No log file to checkpoint into, but the row still ends.
                warn!(exec_id = %exec_id, error = %e, "Cannot open execution log");
                if let Err(finish_err) = self
                    .executions
                    .finish(exec_id, ExecutionStatus::Errored, Some(&e.to_string()))
                    .await
                {
                    warn!(exec_id = %exec_id, error = %finish_err, "Failed to record error");
                }
                self.notify(&flow, exec_id, "errored").await;
                return Err(e);
            }
        };

        let mut cursor = Cursor {
            action_id: payload.retry_from_action.clone().unwrap_or_else(|| {
                flow.actions
                    .first()
                    .map(|a| a.id.clone())
                    .unwrap_or_default()
            }),
            retry: 1,
        };

        match self
            .execute_actions(&token, &flow, payload, &logger, &input, &row, &mut cursor)
            .await
        {
            Ok(RunOutcome::Completed) => {
                if let Err(e) = self
                    .executions
                    .finish(exec_id, ExecutionStatus::Completed, None)
                    .await
                {
                    self.finalize_error(&flow, &logger, exec_id, &cursor, &e).await;
                    return Err(e);
                }
                self.notify(&flow, exec_id, "completed").await;
                if let Err(e) = self.logs.close_logger(exec_id).await {
                    warn!(exec_id = %exec_id, error = %e, "Log close failed");
                }
                info!(exec_id = %exec_id, flow = %flow.slug(), "Execution completed");
                Ok(())
            }
            Ok(RunOutcome::Requeued) => Ok(()),
            Ok(RunOutcome::CancelledByRejection) => Ok(()),
            Err(Error::Suspended) => Err(Error::Suspended),
            Err(Error::Cancelled) => {
                self.finalize_cancelled(&flow, &logger, exec_id, &cursor).await;
                Err(Error::Cancelled)
            }
            Err(e) => {
                self.finalize_error(&flow, &logger, exec_id, &cursor, &e).await;
                Err(e)
            }
        }
    }

    /// The action loop proper. Fallible state calls use plain `?`: whatever
    /// escapes here is finalized by `run`, so the execution row never sticks
    /// at a non-terminal status.
    #[allow(clippy::too_many_arguments)]
    async fn execute_actions(
        &self,
        token: &CancellationToken,
        flow: &Flow,
        payload: &FlowExecutionPayload,
        logger: &Arc<ExecutionLogger>,
        input: &serde_json::Value,
        row: &ExecutionRow,
        cursor: &mut Cursor,
    ) -> Result<RunOutcome> {
        let exec_id = payload.exec_id;

        self.executions.mark_running(exec_id).await?;
        let mut action_retries = row.action_retries_map();

        let resume_index = match &payload.retry_from_action {
            Some(action_id) => match flow.action_index(action_id) {
                Some(index) => Some(index),
                None => {
                    // The flow changed while the execution was parked and
                    // the resume anchor is gone.
                    cursor.action_id = action_id.clone();
                    return Err(Error::NotFound(format!(
                        "Resume action '{}' no longer exists in flow '{}'",
                        action_id,
                        flow.slug()
                    )));
                }
            },
            None => None,
        };

        let mut results = serde_json::Map::new();

        for (index, action) in flow.actions.iter().enumerate() {
            if let Some(resume) = resume_index {
                if index < resume {
                    continue;
                }
            }

            cursor.action_id = action.id.clone();
            cursor.retry = action_retries.get(&action.id).copied().unwrap_or(0).max(1);

            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            self.executions.set_current_action(exec_id, &action.id).await?;

            if let Some(condition) = &action.condition {
                let scope = Scope::new(serde_json::json!({
                    "inputs": input,
                    "results": serde_json::Value::Object(results.clone()),
                    "env": action.variables,
                }));
                match eval_bool(condition, &scope) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(exec_id = %exec_id, action = %action.id, "Condition false, skipping action");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if action.approval {
                let gate = self.approvals.latest(exec_id, &action.id).await?;
                let status = gate.as_ref().map(|a| a.status()).transpose()?;
                match status {
                    None | Some(ApprovalStatus::Pending) => {
                        self.approvals.create_pending(exec_id, &action.id).await?;
                        self.executions
                            .set_status(exec_id, ExecutionStatus::PendingApproval)
                            .await?;
                        let scoped =
                            ScopedLogger::new(logger.clone(), &action.id, "local", cursor.retry);
                        let _ = scoped.checkpoint(MessageType::Log, b"awaiting approval");
                        info!(exec_id = %exec_id, action = %action.id, "Execution suspended on approval");
                        // The logger stays open: the resume appends to it.
                        return Err(Error::Suspended);
                    }
                    Some(ApprovalStatus::Rejected) => {
                        info!(exec_id = %exec_id, action = %action.id, "Approval rejected");
                        let scoped =
                            ScopedLogger::new(logger.clone(), &action.id, "local", cursor.retry);
                        let _ = scoped.checkpoint(MessageType::Cancelled, b"approval rejected");
                        self.executions
                            .finish(exec_id, ExecutionStatus::Cancelled, None)
                            .await?;
                        self.notify(flow, exec_id, "cancelled").await;
                        if let Err(e) = self.logs.close_logger(exec_id).await {
                            warn!(exec_id = %exec_id, error = %e, "Log close failed");
                        }
                        return Ok(RunOutcome::CancelledByRejection);
                    }
                    Some(ApprovalStatus::Approved) => {}
                }
            }

            let retry = action_retries.get(&action.id).copied().unwrap_or(0) + 1;
            action_retries.insert(action.id.clone(), retry);
            cursor.retry = retry;
            self.executions
                .set_action_retries(exec_id, &action_retries)
                .await?;

            match self
                .run_action(token, flow, action, logger, input, &results, retry)
                .await
            {
                ActionOutcome::Success(node_results) => {
                    results.insert(action.id.clone(), node_results);
                }
                ActionOutcome::Cancelled => return Err(Error::Cancelled),
                ActionOutcome::Failed(e) => {
                    if retry < self.settings.max_action_retries {
                        self.requeue_retry(payload, &action.id).await?;
                        info!(
                            exec_id = %exec_id,
                            action = %action.id,
                            retry,
                            max = self.settings.max_action_retries,
                            "Action failed, execution requeued"
                        );
                        // This job is finished; the new version runs later.
                        return Ok(RunOutcome::Requeued);
                    }
                    return Err(e);
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Run one action across its target nodes and aggregate. Infrastructure
    /// failures while resolving nodes or secrets count as action failures,
    /// so they flow through the per-action retry budget like executor
    /// errors do.
    #[allow(clippy::too_many_arguments)]
    async fn run_action(
        &self,
        token: &CancellationToken,
        flow: &Flow,
        action: &ActionSpec,
        logger: &Arc<ExecutionLogger>,
        input: &serde_json::Value,
        results: &serde_json::Map<String, serde_json::Value>,
        retry: u32,
    ) -> ActionOutcome {
        let exec_id = logger.exec_id();

        let Some(executor) = self.executors.get(&action.executor) else {
            return ActionOutcome::Failed(Error::NotFound(format!(
                "Executor '{}' is not registered",
                action.executor
            )));
        };

        let targets = if action.on.is_empty() {
            vec![ExecTarget::local()]
        } else {
            let found = match self
                .nodes
                .find_by_names(flow.namespace_dbid, &action.on)
                .await
            {
                Ok(found) => found,
                Err(e) => return ActionOutcome::Failed(e),
            };
            if found.len() != action.on.len() {
                let missing: Vec<&String> = action
                    .on
                    .iter()
                    .filter(|name| !found.iter().any(|t| &t.name == *name))
                    .collect();
                return ActionOutcome::Failed(Error::NotFound(format!(
                    "Unknown nodes {:?} for action '{}'",
                    missing, action.id
                )));
            }
            found
        };

        let secrets = match self
            .secrets
            .secrets_for(flow.namespace_dbid, flow.flow_dbid)
            .await
        {
            Ok(secrets) => secrets,
            Err(e) => return ActionOutcome::Failed(e),
        };

        let limit = self
            .settings
            .max_concurrency_per_action
            .unwrap_or(targets.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        debug!(
            exec_id = %exec_id,
            action = %action.id,
            nodes = targets.len(),
            limit,
            retry,
            "Dispatching action"
        );

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let scoped = ScopedLogger::new(logger.clone(), &action.id, &target.name, retry);
            let args = ExecArgs {
                with: action.with.clone(),
                variables: action.variables.clone(),
                secrets: secrets.clone(),
                input: input.clone(),
                previous_results: serde_json::Value::Object(results.clone()),
                node: target.clone(),
            };
            let executor = executor.clone();
            let semaphore = semaphore.clone();
            let node_token = token.child_token();
            let node_name = target.name.clone();

            handles.push(tokio::spawn(async move {
                // the semaphore is never closed, so acquisition cannot fail
                let _permit = semaphore.acquire_owned().await.ok();
                let output = executor.execute(node_token, &scoped, args).await;
                match &output {
                    Ok(out) => {
                        let body = serde_json::to_vec(&out.results).unwrap_or_default();
                        if let Err(e) = scoped.checkpoint(MessageType::Result, &body) {
                            warn!(error = %e, "Result checkpoint dropped");
                        }
                    }
                    Err(Error::Cancelled) => {}
                    Err(e) => {
                        let _ = scoped.checkpoint(MessageType::Error, e.to_string().as_bytes());
                    }
                }
                (node_name, output)
            }));
        }

        let mut node_results = serde_json::Map::new();
        let mut failure: Option<Error> = None;
        let mut cancelled = false;

        for joined in join_all(handles).await {
            match joined {
                Ok((node, Ok(output))) => match serde_json::to_value(output.results) {
                    Ok(value) => {
                        node_results.insert(node, value);
                    }
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(Error::from(e));
                        }
                    }
                },
                Ok((_, Err(Error::Cancelled))) => cancelled = true,
                Ok((node, Err(e))) => {
                    warn!(exec_id = %exec_id, action = %action.id, node = %node, error = %e, "Node failed");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(join_error) => {
                    error!(exec_id = %exec_id, action = %action.id, error = %join_error, "Node task panicked");
                    if failure.is_none() {
                        failure = Some(Error::External(format!(
                            "Node task panicked: {}",
                            join_error
                        )));
                    }
                }
            }
        }

        if cancelled || token.is_cancelled() {
            return ActionOutcome::Cancelled;
        }
        if let Some(e) = failure {
            return ActionOutcome::Failed(e);
        }

        // The `*` alias carries the single-node result for conditions that
        // do not care about node names.
        if node_results.len() == 1 {
            let only = node_results.values().next().cloned().unwrap_or_default();
            node_results.insert("*".to_string(), only);
        }
        ActionOutcome::Success(serde_json::Value::Object(node_results))
    }

    /// Append a retry version and enqueue the job that will run it
    async fn requeue_retry(
        &self,
        payload: &FlowExecutionPayload,
        action_id: &str,
    ) -> Result<()> {
        self.executions.append_retry_version(payload.exec_id).await?;

        let retry_payload = FlowExecutionPayload {
            exec_id: payload.exec_id,
            flow_slug: payload.flow_slug.clone(),
            namespace: payload.namespace.clone(),
            input: payload.input.clone(),
            trigger_type: "retry".to_string(),
            triggered_by: payload.triggered_by.clone(),
            retry_from_action: Some(action_id.to_string()),
            scheduled_at: None,
        };

        self.store
            .enqueue(EnqueueRequest {
                payload_type: PayloadType::FlowExecution,
                payload: serde_json::to_value(&retry_payload)?,
                available_at: chrono::Utc::now()
                    + chrono::Duration::from_std(self.settings.action_backoff)
                        .unwrap_or_default(),
                max_attempts: 1,
            })
            .await?;
        Ok(())
    }

    /// Terminal cancellation: checkpoint, row, notifications, log close
    async fn finalize_cancelled(
        &self,
        flow: &Flow,
        logger: &Arc<ExecutionLogger>,
        exec_id: Uuid,
        cursor: &Cursor,
    ) {
        info!(exec_id = %exec_id, action = %cursor.action_id, "Execution cancelled");
        let scoped = ScopedLogger::new(logger.clone(), &cursor.action_id, "local", cursor.retry);
        let _ = scoped.checkpoint(MessageType::Cancelled, b"execution cancelled");
        if let Err(e) = self
            .executions
            .finish(exec_id, ExecutionStatus::Cancelled, None)
            .await
        {
            warn!(exec_id = %exec_id, error = %e, "Failed to record cancellation");
        }
        self.notify(flow, exec_id, "cancelled").await;
        if let Err(e) = self.logs.close_logger(exec_id).await {
            warn!(exec_id = %exec_id, error = %e, "Log close failed");
        }
    }

    /// Terminal error: checkpoint, error column, notifications, log close
    async fn finalize_error(
        &self,
        flow: &Flow,
        logger: &Arc<ExecutionLogger>,
        exec_id: Uuid,
        cursor: &Cursor,
        err: &Error,
    ) {
        error!(exec_id = %exec_id, action = %cursor.action_id, error = %err, "Execution errored");
        if !cursor.action_id.is_empty() {
            let scoped =
                ScopedLogger::new(logger.clone(), &cursor.action_id, "local", cursor.retry);
            let _ = scoped.checkpoint(MessageType::Error, err.to_string().as_bytes());
        }
        if let Err(e) = self
            .executions
            .finish(exec_id, ExecutionStatus::Errored, Some(&err.to_string()))
            .await
        {
            warn!(exec_id = %exec_id, error = %e, "Failed to record error");
        }
        self.notify(flow, exec_id, "errored").await;
        if let Err(e) = self.logs.close_logger(exec_id).await {
            warn!(exec_id = %exec_id, error = %e, "Log close failed");
        }
    }

    /// Enqueue notification jobs for rules matching a terminal event
    async fn notify(&self, flow: &Flow, exec_id: Uuid, event: &str) {
        for rule in &self.settings.notifications {
            if !rule.events.iter().any(|e| e == event) {
                continue;
            }
            let payload = NotificationPayload {
                channel: rule.channel.clone(),
                recipients: rule.recipients.clone(),
                event: event.to_string(),
                exec_id,
                flow_name: flow.metadata.name.clone(),
                status: event.to_string(),
            };
            let request = match serde_json::to_value(&payload) {
                Ok(value) => EnqueueRequest::now(PayloadType::Notification, value, 3),
                Err(e) => {
                    warn!(error = %e, "Notification payload encode failed");
                    continue;
                }
            };
            if let Err(e) = self.store.enqueue(request).await {
                warn!(channel = %rule.channel, error = %e, "Notification enqueue failed");
            }
        }
    }
}

enum ActionOutcome {
    Success(serde_json::Value),
    Failed(Error),
    Cancelled,
}

fn parse_trigger(s: &str) -> Result<TriggerType> {
    match s {
        "manual" => Ok(TriggerType::Manual),
        "schedule" => Ok(TriggerType::Schedule),
        "api" => Ok(TriggerType::Api),
        "retry" => Ok(TriggerType::Retry),
        other => Err(Error::Validation(format!("Unknown trigger type: {}", other))),
    }
}

#[async_trait]
impl JobHandler for FlowExecutionHandler {
    fn payload_type(&self) -> PayloadType {
        PayloadType::FlowExecution
    }

    async fn handle(&self, ctx: JobContext, payload: serde_json::Value) -> Result<()> {
        let payload: FlowExecutionPayload = serde_json::from_value(payload)
            .map_err(|e| Error::Validation(format!("Malformed flow_execution payload: {}", e)))?;
        let exec_id = payload.exec_id;

        // The execution context dies with the job context, on external
        // cancel, or when the wall clock runs out.
        let exec_token = ctx.cancellation.child_token();
        self.bus.register(exec_id, exec_token.clone());

        let watchdog = {
            let token = exec_token.clone();
            let timeout = self.settings.execution_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!(timeout_secs = timeout.as_secs(), "Flow execution timed out");
                        token.cancel();
                    }
                }
            })
        };

        let result = self.run(exec_token.clone(), &payload).await;

        exec_token.cancel();
        let _ = watchdog.await;
        self.bus.unregister(exec_id);

        result
    }
}
