//! Core abstractions for the DAG engine
//!
//! This crate provides the graph model, the operator contract and the
//! declarative graph source that the runtime builds on. It owns no threads
//! and executes nothing.

mod dot;
mod error;
pub mod expr;
mod graph;
mod operator;
mod spec;
mod value;

pub use error::{BuildError, DagError, OperatorError};
pub use expr::{ExprError, Expression};
pub use graph::{
    DataInput, DataOutput, Dependency, Expect, Graph, GraphCluster, OperatorCatalog,
    OperatorPorts, Successor, Vertex, VertexResult, EXPR_OPERATOR,
};
pub use operator::{Operator, OperatorOutput, RunContext, UserData};
pub use spec::{ClusterSpec, DataBinding, GraphSpec, VertexSpec};
pub use value::Value;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, DagError>;
