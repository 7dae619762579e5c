//! Graph execution runtime
//!
//! This crate provides the engine that runs built graphs: the operator
//! registry, the worker pool that executes vertex tasks, the per-run
//! execution contexts and the graph manager that pools them.

mod context;
mod executor;
mod registry;
mod runtime;

pub use context::RunReport;
pub use executor::{SubmitError, Task, TaskExecutor, WorkerPool};
pub use registry::{
    ExpressionOperator, FnFactory, OperatorFactory, OperatorMetadata, OperatorRegistry,
    PortDefinition,
};
pub use runtime::{GraphManager, RuntimeConfig};
