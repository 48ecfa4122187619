//! ABOUTME: End-to-end handler tests over the in-memory state and job store
//! ABOUTME: Covers the happy path, approvals, retries, fan-out, cancellation

use crate::approval::ApprovalService;
use crate::executor::{ExecArgs, ExecOutput, Executor, ExecutorRegistry};
use crate::handler::{FlowExecutionHandler, FlowHandlerSettings, NotificationRule};
use crate::memory::{MemoryApprovalGate, MemoryExecutionStore, MemoryNodeDirectory, StaticFlows};
use crate::secrets::StaticSecrets;
use crate::state::ExecutionStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wf_core::{Error, Result};
use wf_db::ApprovalStatus;
use wf_flow::Flow;
use wf_logstream::{LogManager, LogManagerConfig, MessageType, ScopedLogger, StreamMessage};
use wf_sched::{CancellationBus, JobContext, JobHandler};
use wf_store::{FlowExecutionPayload, JobStore, MemoryJobStore, PayloadType};

/// Scriptable executor: behaviour is driven by the action's `with` block.
/// `fail_on` fails named nodes, `fail_times` fails the first N runs of a
/// `cmd`, `sleep_ms` parks until cancelled or the time passes.
struct FakeExecutor {
    remaining_failures: Mutex<HashMap<String, u64>>,
}

impl FakeExecutor {
    fn new() -> Self {
        Self {
            remaining_failures: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        "script"
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        logger: &ScopedLogger,
        args: ExecArgs,
    ) -> Result<ExecOutput> {
        logger.write(format!("running on {}", args.node.name).as_bytes())?;

        if let Some(ms) = args.with.get("sleep_ms").and_then(|v| v.as_u64()) {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            }
        }

        if let Some(bad_nodes) = args.with.get("fail_on").and_then(|v| v.as_array()) {
            if bad_nodes.iter().any(|n| n.as_str() == Some(&args.node.name)) {
                return Err(Error::External(format!("node {} exploded", args.node.name)));
            }
        }

        if let Some(times) = args.with.get("fail_times").and_then(|v| v.as_u64()) {
            let key = args
                .with
                .get("cmd")
                .and_then(|v| v.as_str())
                .unwrap_or("default")
                .to_string();
            let mut remaining = self.remaining_failures.lock().unwrap();
            let left = remaining.entry(key).or_insert(times);
            if *left > 0 {
                *left -= 1;
                return Err(Error::External("transient executor failure".to_string()));
            }
        }

        let mut results = HashMap::new();
        results.insert("status".to_string(), "ok".to_string());
        results.insert("node".to_string(), args.node.name.clone());
        Ok(ExecOutput {
            results,
            artifacts: Vec::new(),
        })
    }
}

struct World {
    executions: Arc<MemoryExecutionStore>,
    store: Arc<MemoryJobStore>,
    logs: Arc<LogManager>,
    bus: CancellationBus,
    handler: Arc<FlowExecutionHandler>,
    approval_service: ApprovalService,
    _tmp: tempfile::TempDir,
}

impl World {
    fn new(flow_yaml: &str, settings: FlowHandlerSettings) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let logs = LogManager::new(LogManagerConfig {
            directory: tmp.path().to_path_buf(),
            max_size_bytes: 1024 * 1024,
            flush_interval: Duration::from_millis(10),
            retention: Duration::from_secs(3600),
            scan_interval: Duration::from_secs(3600),
        })
        .unwrap();

        let mut flow = Flow::parse_yaml(flow_yaml.as_bytes()).unwrap();
        flow.flow_dbid = 1;
        flow.namespace_dbid = 1;
        flow.namespace = "default".to_string();
        let mut flows = StaticFlows::new();
        flows.add(flow);
        let flows: Arc<StaticFlows> = Arc::new(flows);

        let executions = Arc::new(MemoryExecutionStore::new());
        let approvals = Arc::new(MemoryApprovalGate::new());
        let nodes = Arc::new(MemoryNodeDirectory::new());
        nodes.add_node(1, "n1", "10.0.0.1:22");
        nodes.add_node(1, "n2", "10.0.0.2:22");
        nodes.add_node(1, "n3", "10.0.0.3:22");

        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(FakeExecutor::new()));

        let store = Arc::new(MemoryJobStore::new());
        let bus = CancellationBus::new();

        let handler = Arc::new(FlowExecutionHandler::new(
            flows.clone(),
            executions.clone(),
            approvals.clone(),
            nodes,
            Arc::new(StaticSecrets(HashMap::from([(
                "DEPLOY_KEY".to_string(),
                "s3cret".to_string(),
            )]))),
            Arc::new(executors),
            logs.clone(),
            store.clone(),
            bus.clone(),
            settings,
        ));

        let approval_service = ApprovalService::new(
            approvals.clone(),
            executions.clone(),
            flows,
            store.clone(),
        );

        World {
            executions,
            store,
            logs,
            bus,
            handler,
            approval_service,
            _tmp: tmp,
        }
    }

    fn ctx(&self) -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            worker_id: "test:0:0".to_string(),
            attempt: 1,
            max_attempts: 1,
            cancellation: CancellationToken::new(),
        }
    }

    fn payload(&self, exec_id: Uuid, slug: &str, input: serde_json::Value) -> serde_json::Value {
        serde_json::to_value(FlowExecutionPayload {
            exec_id,
            flow_slug: slug.to_string(),
            namespace: "default".to_string(),
            input,
            trigger_type: "manual".to_string(),
            triggered_by: "alice".to_string(),
            retry_from_action: None,
            scheduled_at: None,
        })
        .unwrap()
    }

    async fn read_log(&self, exec_id: Uuid, retries: HashMap<String, u32>) -> Vec<StreamMessage> {
        let mut rx = self
            .logs
            .stream_logs(CancellationToken::new(), exec_id, retries)
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        out
    }

    /// Pop the next pending flow_execution job payload from the store
    async fn next_flow_job(&self) -> Option<FlowExecutionPayload> {
        // leases walk the queue in order; a test lease is fine here
        let job = self
            .store
            .lease("test:pop", &[PayloadType::FlowExecution], Duration::from_secs(5))
            .await
            .unwrap()?;
        Some(job.decode().unwrap())
    }
}

const LINEAR_FLOW: &str = r#"
metadata: { id: demo, name: Demo }
inputs:
  - { name: tag, type: string, required: true }
actions:
  - id: build
    executor: script
    with: { cmd: "make build" }
  - id: deploy
    executor: script
    with: { cmd: "make deploy" }
"#;

#[tokio::test]
async fn test_linear_happy_path() {
    let world = World::new(LINEAR_FLOW, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();

    world
        .handler
        .handle(
            world.ctx(),
            world.payload(exec_id, "demo", serde_json::json!({"tag": "v1"})),
        )
        .await
        .unwrap();

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "completed");
    assert!(row.started_at.is_some());
    assert!(row.completed_at.is_some());
    assert_eq!(row.action_retries_map().get("build"), Some(&1));
    assert_eq!(row.action_retries_map().get("deploy"), Some(&1));

    // log has raw output and a result checkpoint per action, in order
    let log = world.read_log(exec_id, HashMap::new()).await;
    let build_result = log
        .iter()
        .any(|m| m.action_id == "build" && m.message_type == MessageType::Result);
    let deploy_result = log
        .iter()
        .any(|m| m.action_id == "deploy" && m.message_type == MessageType::Result);
    assert!(build_result && deploy_result);
    let first_build = log.iter().position(|m| m.action_id == "build").unwrap();
    let first_deploy = log.iter().position(|m| m.action_id == "deploy").unwrap();
    assert!(first_build < first_deploy);

    // logger was closed at completion
    assert!(world.logs.active_logger(exec_id).await.is_none());
}

#[tokio::test]
async fn test_replayed_payload_is_noop() {
    let world = World::new(LINEAR_FLOW, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();
    let payload = world.payload(exec_id, "demo", serde_json::json!({"tag": "v1"}));

    world.handler.handle(world.ctx(), payload.clone()).await.unwrap();
    let versions_before = world.executions.versions(exec_id).len();

    // same payload again: terminal execution, nothing changes
    world.handler.handle(world.ctx(), payload).await.unwrap();
    assert_eq!(world.executions.versions(exec_id).len(), versions_before);
}

#[tokio::test]
async fn test_unknown_flow_is_terminal() {
    let world = World::new(LINEAR_FLOW, FlowHandlerSettings::default());
    let err = world
        .handler
        .handle(
            world.ctx(),
            world.payload(Uuid::new_v4(), "ghost", serde_json::json!({})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_invalid_input_errors_execution() {
    let world = World::new(LINEAR_FLOW, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();

    let err = world
        .handler
        .handle(world.ctx(), world.payload(exec_id, "demo", serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "errored");
    assert!(row.error.unwrap().contains("tag"));
}

#[tokio::test]
async fn test_condition_skips_action() {
    let flow = r#"
metadata: { id: demo, name: Demo }
inputs:
  - { name: tag, type: string, required: true }
actions:
  - id: build
    executor: script
  - id: deploy
    executor: script
    condition: 'inputs.tag != "skip"'
"#;
    let world = World::new(flow, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();

    world
        .handler
        .handle(
            world.ctx(),
            world.payload(exec_id, "demo", serde_json::json!({"tag": "skip"})),
        )
        .await
        .unwrap();

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "completed");
    // deploy never ran: no retry recorded, no log lines
    assert!(row.action_retries_map().get("deploy").is_none());
    let log = world.read_log(exec_id, HashMap::new()).await;
    assert!(log.iter().all(|m| m.action_id != "deploy"));
}

const APPROVAL_FLOW: &str = r#"
metadata: { id: paid-release, name: Paid release }
actions:
  - id: stage
    executor: script
  - id: promote
    executor: script
    approval: true
"#;

#[tokio::test]
async fn test_approval_round_trip() {
    let world = World::new(APPROVAL_FLOW, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();
    let payload = world.payload(exec_id, "paid-release", serde_json::json!({}));

    // first run suspends at the gate
    let err = world.handler.handle(world.ctx(), payload).await.unwrap_err();
    assert!(matches!(err, Error::Suspended));

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "pending_approval");
    // the suspended logger stays open for the resume
    let live = world.logs.active_logger(exec_id).await.unwrap();
    assert!(!live.is_closed());

    let approval = world
        .approval_service
        .pending(exec_id, "promote")
        .await
        .unwrap()
        .expect("pending approval row");

    // approve: the service enqueues a resume job anchored at the gate
    world
        .approval_service
        .decide(approval.id, ApprovalStatus::Approved, "carol")
        .await
        .unwrap();

    let resume = world.next_flow_job().await.expect("resume job enqueued");
    assert_eq!(resume.exec_id, exec_id);
    assert_eq!(resume.retry_from_action.as_deref(), Some("promote"));

    // the resumed run sees the approved row and completes
    world
        .handler
        .handle(world.ctx(), serde_json::to_value(&resume).unwrap())
        .await
        .unwrap();

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "completed");

    // stage ran once, in the first job only
    assert_eq!(row.action_retries_map().get("stage"), Some(&1));
    assert_eq!(row.action_retries_map().get("promote"), Some(&1));
}

#[tokio::test]
async fn test_approval_rejection_cancels() {
    let world = World::new(APPROVAL_FLOW, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();
    let payload = world.payload(exec_id, "paid-release", serde_json::json!({}));

    let err = world.handler.handle(world.ctx(), payload).await.unwrap_err();
    assert!(matches!(err, Error::Suspended));

    let approval = world
        .approval_service
        .pending(exec_id, "promote")
        .await
        .unwrap()
        .unwrap();
    world
        .approval_service
        .decide(approval.id, ApprovalStatus::Rejected, "carol")
        .await
        .unwrap();

    let resume = world.next_flow_job().await.unwrap();
    world
        .handler
        .handle(world.ctx(), serde_json::to_value(&resume).unwrap())
        .await
        .unwrap();

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "cancelled");

    let log = world.read_log(exec_id, HashMap::new()).await;
    assert!(log
        .iter()
        .any(|m| m.action_id == "promote" && m.message_type == MessageType::Cancelled));
}

#[tokio::test]
async fn test_double_decision_rejected() {
    let world = World::new(APPROVAL_FLOW, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();
    let payload = world.payload(exec_id, "paid-release", serde_json::json!({}));
    let _ = world.handler.handle(world.ctx(), payload).await;

    let approval = world
        .approval_service
        .pending(exec_id, "promote")
        .await
        .unwrap()
        .unwrap();
    world
        .approval_service
        .decide(approval.id, ApprovalStatus::Approved, "carol")
        .await
        .unwrap();
    // terminal: a second decision fails
    assert!(world
        .approval_service
        .decide(approval.id, ApprovalStatus::Rejected, "mallory")
        .await
        .is_err());
}

const FLAKY_FLOW: &str = r#"
metadata: { id: flaky-flow, name: Flaky }
actions:
  - id: flaky
    executor: script
    with: { cmd: "flaky-step", fail_times: 1 }
"#;

#[tokio::test]
async fn test_transient_action_failure_retries_as_new_version() {
    let settings = FlowHandlerSettings {
        max_action_retries: 2,
        action_backoff: Duration::from_millis(0),
        ..Default::default()
    };
    let world = World::new(FLAKY_FLOW, settings);
    let exec_id = Uuid::new_v4();
    let payload = world.payload(exec_id, "flaky-flow", serde_json::json!({}));

    // first attempt fails and requeues; the job itself succeeds
    world.handler.handle(world.ctx(), payload).await.unwrap();

    let versions = world.executions.versions(exec_id);
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[1].trigger_type, "retry");
    assert_eq!(versions[1].action_retries_map().get("flaky"), Some(&1));

    let retry_job = world.next_flow_job().await.expect("retry job enqueued");
    assert_eq!(retry_job.retry_from_action.as_deref(), Some("flaky"));

    // second attempt succeeds
    world
        .handler
        .handle(world.ctx(), serde_json::to_value(&retry_job).unwrap())
        .await
        .unwrap();

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "completed");
    assert_eq!(row.action_retries_map().get("flaky"), Some(&2));

    // retry filter: {flaky:2} sees only second-attempt lines, {flaky:1}
    // only first-attempt lines
    let second = world
        .read_log(exec_id, HashMap::from([("flaky".to_string(), 2)]))
        .await;
    assert!(!second.is_empty());
    assert!(second.iter().all(|m| m.retry == 2));

    let first = world
        .read_log(exec_id, HashMap::from([("flaky".to_string(), 1)]))
        .await;
    assert!(!first.is_empty());
    assert!(first.iter().all(|m| m.retry == 1));
}

#[tokio::test]
async fn test_exhausted_action_retries_error_execution() {
    // fail_times larger than the retry budget
    let flow = r#"
metadata: { id: flaky-flow, name: Flaky }
actions:
  - id: flaky
    executor: script
    with: { cmd: "always-fails", fail_times: 99 }
"#;
    let settings = FlowHandlerSettings {
        max_action_retries: 2,
        action_backoff: Duration::from_millis(0),
        ..Default::default()
    };
    let world = World::new(flow, settings);
    let exec_id = Uuid::new_v4();

    // attempt 1: requeues
    world
        .handler
        .handle(world.ctx(), world.payload(exec_id, "flaky-flow", serde_json::json!({})))
        .await
        .unwrap();
    let retry_job = world.next_flow_job().await.unwrap();

    // attempt 2: budget spent, terminal
    let err = world
        .handler
        .handle(world.ctx(), serde_json::to_value(&retry_job).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::External(_)));

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "errored");
    assert!(row.error.unwrap().contains("transient executor failure"));

    let log = world
        .read_log(exec_id, HashMap::from([("flaky".to_string(), 2)]))
        .await;
    assert!(log.iter().any(|m| m.message_type == MessageType::Error));
}

const FANOUT_FLOW: &str = r#"
metadata: { id: fanout, name: Fan out }
actions:
  - id: roll
    executor: script
    with: { cmd: "roll", fail_on: ["n2"] }
    on: [n1, n2, n3]
"#;

#[tokio::test]
async fn test_fanout_one_node_failure_fails_action() {
    let world = World::new(FANOUT_FLOW, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();

    let err = world
        .handler
        .handle(world.ctx(), world.payload(exec_id, "fanout", serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::External(_)));

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "errored");

    // every node logged lines, interleaving aside
    let log = world.read_log(exec_id, HashMap::new()).await;
    for node in ["n1", "n2", "n3"] {
        assert!(
            log.iter().any(|m| m.node_id == node),
            "no lines from {}",
            node
        );
    }
    // the healthy nodes produced results, the bad one an error
    assert!(log
        .iter()
        .any(|m| m.node_id == "n1" && m.message_type == MessageType::Result));
    assert!(log
        .iter()
        .any(|m| m.node_id == "n2" && m.message_type == MessageType::Error));
}

#[tokio::test]
async fn test_fanout_success_keys_results_by_node() {
    let flow = r#"
metadata: { id: fanout, name: Fan out }
actions:
  - id: roll
    executor: script
    on: [n1, n2]
  - id: check
    executor: script
    condition: 'results.roll.n1.status == "ok" && results.roll.n2.status == "ok"'
"#;
    let world = World::new(flow, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();

    world
        .handler
        .handle(world.ctx(), world.payload(exec_id, "fanout", serde_json::json!({})))
        .await
        .unwrap();

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    // the condition over per-node results held, so check ran
    assert_eq!(row.status, "completed");
    assert_eq!(row.action_retries_map().get("check"), Some(&1));
}

#[tokio::test]
async fn test_single_node_result_exposed_under_star() {
    let flow = r#"
metadata: { id: star, name: Star }
actions:
  - id: solo
    executor: script
  - id: gated
    executor: script
    condition: 'results.solo.*.status == "ok"'
"#;
    // `*` is not an identifier in the expression language, so address the
    // node key directly instead
    let flow = flow.replace("results.solo.*.status", "results.solo.local.status");
    let world = World::new(&flow, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();

    world
        .handler
        .handle(world.ctx(), world.payload(exec_id, "star", serde_json::json!({})))
        .await
        .unwrap();
    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "completed");
}

#[tokio::test]
async fn test_unknown_node_is_terminal() {
    let flow = r#"
metadata: { id: ghost-node, name: Ghost }
actions:
  - id: roll
    executor: script
    on: [n1, nowhere]
"#;
    let world = World::new(flow, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();

    let err = world
        .handler
        .handle(world.ctx(), world.payload(exec_id, "ghost-node", serde_json::json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "errored");
}

const SLEEPY_FLOW: &str = r#"
metadata: { id: sleepy, name: Sleepy }
actions:
  - id: nap
    executor: script
    with: { cmd: "sleep", sleep_ms: 60000 }
"#;

#[tokio::test]
async fn test_cancel_mid_run() {
    let world = World::new(SLEEPY_FLOW, FlowHandlerSettings::default());
    let exec_id = Uuid::new_v4();
    let payload = world.payload(exec_id, "sleepy", serde_json::json!({}));

    let handler = world.handler.clone();
    let ctx = world.ctx();
    let task = tokio::spawn(async move { handler.handle(ctx, payload).await });

    // wait for the handler to register on the cancellation bus
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while world.bus.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "handler never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(world.bus.cancel(exec_id));
    let result = task.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "cancelled");

    let log = world.read_log(exec_id, HashMap::new()).await;
    assert!(log.iter().any(|m| m.message_type == MessageType::Cancelled));
}

#[tokio::test]
async fn test_execution_timeout_cancels() {
    let settings = FlowHandlerSettings {
        execution_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let world = World::new(SLEEPY_FLOW, settings);
    let exec_id = Uuid::new_v4();

    let result = world
        .handler
        .handle(world.ctx(), world.payload(exec_id, "sleepy", serde_json::json!({})))
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));

    let row = world.executions.latest(exec_id).await.unwrap().unwrap();
    assert_eq!(row.status, "cancelled");
}

#[tokio::test]
async fn test_terminal_notifications_enqueued() {
    let settings = FlowHandlerSettings {
        notifications: vec![NotificationRule {
            channel: "ops".to_string(),
            recipients: vec!["ops@example.com".to_string()],
            events: vec!["completed".to_string()],
        }],
        ..Default::default()
    };
    let world = World::new(LINEAR_FLOW, settings);
    let exec_id = Uuid::new_v4();

    world
        .handler
        .handle(
            world.ctx(),
            world.payload(exec_id, "demo", serde_json::json!({"tag": "v1"})),
        )
        .await
        .unwrap();

    let job = world
        .store
        .lease("test:pop", &[PayloadType::Notification], Duration::from_secs(5))
        .await
        .unwrap()
        .expect("notification job for completion");
    let payload: wf_store::NotificationPayload = job.decode().unwrap();
    assert_eq!(payload.channel, "ops");
    assert_eq!(payload.event, "completed");
    assert_eq!(payload.exec_id, exec_id);
    assert_eq!(payload.flow_name, "Demo");
}
