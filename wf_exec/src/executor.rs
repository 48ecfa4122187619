//! ABOUTME: Executor seam: plugins do the actual work against one node
//! ABOUTME: The engine resolves executors by name from a registry

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wf_core::Result;
use wf_logstream::ScopedLogger;

/// The node an executor runs against. The synthetic local target has no
/// address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub name: String,
    pub address: Option<String>,
}

impl ExecTarget {
    pub fn local() -> Self {
        Self {
            name: "local".to_string(),
            address: None,
        }
    }
}

/// Everything an executor gets for one node run
#[derive(Debug, Clone)]
pub struct ExecArgs {
    /// Executor-specific configuration from the action's `with` block
    pub with: HashMap<String, serde_json::Value>,
    /// Action environment variables
    pub variables: HashMap<String, String>,
    /// Merged namespace and flow secrets, flow over namespace
    pub secrets: HashMap<String, String>,
    /// Validated flow input
    pub input: serde_json::Value,
    /// Results of earlier actions, keyed by action id
    pub previous_results: serde_json::Value,
    pub node: ExecTarget,
}

/// What one node run produced
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub results: HashMap<String, String>,
    pub artifacts: Vec<PathBuf>,
}

/// An executor plugin. Implementations stream stdout/stderr through the
/// scoped logger as they run; the engine writes the result checkpoint after
/// a successful return.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: CancellationToken,
        logger: &ScopedLogger,
        args: ExecArgs,
    ) -> Result<ExecOutput>;
}

/// Executors by name
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors
            .insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(name).cloned()
    }

    /// Known executor names, for flow validation
    pub fn names(&self) -> HashSet<String> {
        self.executors.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopExecutor;

    #[async_trait]
    impl Executor for NoopExecutor {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(
            &self,
            _ctx: CancellationToken,
            _logger: &ScopedLogger,
            _args: ExecArgs,
        ) -> Result<ExecOutput> {
            Ok(ExecOutput::default())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("docker").is_none());
        assert!(registry.names().contains("noop"));
    }

    #[test]
    fn test_local_target() {
        let local = ExecTarget::local();
        assert_eq!(local.name, "local");
        assert!(local.address.is_none());
    }
}
