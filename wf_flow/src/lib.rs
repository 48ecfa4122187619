//! ABOUTME: Flow model, YAML loading, expression evaluation, and the registry
//! ABOUTME: Flows are declarative ordered action pipelines defined on disk

pub mod expr;
pub mod model;
pub mod registry;
pub mod validate;

pub use expr::{eval_bool, eval_expr, Scope};
pub use model::{ActionSpec, Flow, FlowMetadata, InputKind, InputSpec};
pub use registry::{FlowRegistry, LoadedFlow, RebuildReport};
pub use validate::validate_input;
