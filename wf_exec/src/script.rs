//! ABOUTME: Local shell executor: runs the action's cmd and streams output
//! ABOUTME: Variables and secrets become environment; cancel kills the child

use crate::executor::{ExecArgs, ExecOutput, Executor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wf_core::{Error, Result};
use wf_logstream::{MessageType, ScopedLogger};

/// Runs `with.cmd` through `sh -c` on the local node. Remote executors
/// implement the same trait externally; this one keeps a bare deployment
/// useful.
pub struct ScriptExecutor;

impl ScriptExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new()
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: R, logger: ScopedLogger, error_stream: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let result = if error_stream {
            logger.checkpoint(MessageType::Error, line.as_bytes())
        } else {
            logger.write(line.as_bytes())
        };
        if result.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    fn name(&self) -> &str {
        "script"
    }

    async fn execute(
        &self,
        ctx: CancellationToken,
        logger: &ScopedLogger,
        args: ExecArgs,
    ) -> Result<ExecOutput> {
        let cmd = args
            .with
            .get("cmd")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("script action needs with.cmd".to_string()))?;

        debug!(node = %args.node.name, "Running script action");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in args.variables.iter().chain(args.secrets.iter()) {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::External(format!("Failed to spawn script: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_pump = stdout.map(|s| tokio::spawn(pump(s, logger.clone(), false)));
        let err_pump = stderr.map(|s| tokio::spawn(pump(s, logger.clone(), true)));

        let status = tokio::select! {
            _ = ctx.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled);
            }
            status = child.wait() => {
                status.map_err(|e| Error::External(format!("Script wait failed: {}", e)))?
            }
        };

        if let Some(pump) = out_pump {
            let _ = pump.await;
        }
        if let Some(pump) = err_pump {
            let _ = pump.await;
        }

        if !status.success() {
            return Err(Error::External(format!(
                "Script exited with {}",
                status.code().map_or("signal".to_string(), |c| c.to_string())
            )));
        }

        let mut results = HashMap::new();
        results.insert("exit_code".to_string(), "0".to_string());
        Ok(ExecOutput {
            results,
            artifacts: args
                .with
                .get("artifacts")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|p| p.as_str().map(std::path::PathBuf::from))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;
    use wf_logstream::{ExecutionLogger, StreamMessage};

    fn scoped(dir: &std::path::Path, exec_id: Uuid) -> (Arc<ExecutionLogger>, ScopedLogger) {
        let logger = Arc::new(ExecutionLogger::open(dir, exec_id, 1024 * 1024).unwrap());
        let scoped = ScopedLogger::new(logger.clone(), "run", "local", 1);
        (logger, scoped)
    }

    fn args(cmd: &str) -> ExecArgs {
        ExecArgs {
            with: HashMap::from([(
                "cmd".to_string(),
                serde_json::Value::String(cmd.to_string()),
            )]),
            variables: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            secrets: HashMap::new(),
            input: serde_json::json!({}),
            previous_results: serde_json::json!({}),
            node: crate::executor::ExecTarget::local(),
        }
    }

    #[tokio::test]
    async fn test_runs_command_and_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let exec_id = Uuid::new_v4();
        let (logger, scoped) = scoped(dir.path(), exec_id);

        let output = ScriptExecutor::new()
            .execute(CancellationToken::new(), &scoped, args("echo $GREETING"))
            .await
            .unwrap();
        assert_eq!(output.results.get("exit_code").map(String::as_str), Some("0"));

        logger.close().unwrap();
        let content =
            std::fs::read_to_string(dir.path().join(format!("{}.0", exec_id))).unwrap();
        let lines: Vec<StreamMessage> = content
            .lines()
            .map(|l| StreamMessage::parse_line(l).unwrap())
            .collect();
        assert!(lines.iter().any(|m| m.value == b"hello"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_transient_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_logger, scoped) = scoped(dir.path(), Uuid::new_v4());

        let err = ScriptExecutor::new()
            .execute(CancellationToken::new(), &scoped, args("exit 3"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains('3'));
    }

    #[tokio::test]
    async fn test_missing_cmd_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_logger, scoped) = scoped(dir.path(), Uuid::new_v4());

        let mut bad = args("true");
        bad.with.clear();
        let err = ScriptExecutor::new()
            .execute(CancellationToken::new(), &scoped, bad)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let (_logger, scoped) = scoped(dir.path(), Uuid::new_v4());

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let start = std::time::Instant::now();
        let err = ScriptExecutor::new()
            .execute(token, &scoped, args("sleep 60"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(start.elapsed() < std::time::Duration::from_secs(10));
    }
}
