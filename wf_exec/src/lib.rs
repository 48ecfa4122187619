//! ABOUTME: Flow execution handler: conditions, approvals, retries, fan-out
//! ABOUTME: Runs a flow's actions through executors and checkpoints the log

pub mod approval;
pub mod executor;
pub mod handler;
pub mod memory;
pub mod script;
pub mod secrets;
pub mod state;

#[cfg(test)]
mod tests;

pub use approval::ApprovalService;
pub use executor::{ExecArgs, ExecOutput, ExecTarget, Executor, ExecutorRegistry};
pub use handler::{FlowExecutionHandler, FlowHandlerSettings, NotificationRule};
pub use script::ScriptExecutor;
pub use secrets::{DbSecretsProvider, Keeper, PlainKeeper, SecretsProvider, StaticSecrets};
pub use state::{
    ApprovalGate, ExecutionStore, FlowResolver, NodeDirectory, PgApprovalGate,
    PgExecutionStore, PgNodeDirectory,
};
