use crate::expr::ExprError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DagError {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Operator error: {0}")]
    Operator(#[from] OperatorError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("graph cluster {0} is not existed")]
    ClusterNotFound(String),

    #[error("graph {graph} is not existed in graph cluster {cluster}")]
    GraphNotFound { cluster: String, graph: String },

    #[error("task executor has been stopped")]
    ExecutorStopped,
}

impl From<toml::de::Error> for DagError {
    fn from(e: toml::de::Error) -> Self {
        DagError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for DagError {
    fn from(e: serde_json::Error) -> Self {
        DagError::Decode(e.to_string())
    }
}

/// Failure reported by an operator during one run. Never reaches the caller of
/// `execute`; the vertex resolves to `Fail` instead.
#[derive(Error, Debug, Clone)]
pub enum OperatorError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("{operator} does not accept input '{name}'")]
    UnexpectedInput { operator: String, name: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("condition '{0}' evaluated to false")]
    ConditionUnmet(String),

    #[error("condition '{expr}' is not a bool expression, it returned {actual}")]
    NotBoolean { expr: String, actual: String },

    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("graph cluster defines no graph")]
    EmptyCluster,

    #[error("[graphCluster] graph {0} is duplicated")]
    DuplicateGraph(String),

    #[error("[graph:{0}] has no vertex")]
    EmptyGraph(String),

    #[error("[graph:{graph}] vertex {vertex} is duplicated")]
    DuplicateVertex { graph: String, vertex: String },

    #[error("[graph:{graph}] vertex id:{vertex}, a vertex can't have operator and cond at the same time")]
    OperatorAndCondition { graph: String, vertex: String },

    #[error("[graph:{0}] has an anonymous vertex, a normal vertex must have an operator and a condition vertex must have an ID")]
    AnonymousVertex(String),

    #[error("[graph:{0}] has an anonymous condition vertex, which must have an ID")]
    AnonymousCondition(String),

    #[error("[graph:{graph}] vertex id:{vertex}, operator {operator} is not registered")]
    UnknownOperator {
        graph: String,
        vertex: String,
        operator: String,
    },

    #[error("[graph:{graph}] vertex id:{vertex}, invalid cond: {source}")]
    InvalidCondition {
        graph: String,
        vertex: String,
        #[source]
        source: ExprError,
    },

    #[error("[graph:{graph}] data {data} is produced by both {first} and {second}")]
    DuplicateOutput {
        graph: String,
        data: String,
        first: String,
        second: String,
    },

    #[error("[graph:{graph}] vertex id:{vertex}, no vertex produces its input data {data}")]
    MissingProducer {
        graph: String,
        vertex: String,
        data: String,
    },

    #[error("[graph:{graph}] vertex id:{vertex}, in vertex's {relation} array, id:{target} is not existed")]
    UnknownVertex {
        graph: String,
        vertex: String,
        relation: &'static str,
        target: String,
    },

    #[error("[graph:{graph}] vertex id:{vertex}, a start vertex shouldn't have deps vertex, delete the start flag or deps array")]
    StartWithDeps { graph: String, vertex: String },

    #[error("[graph:{graph}] vertex id:{vertex}, non-start vertex shouldn't be isolated")]
    Isolated { graph: String, vertex: String },

    #[error("[graph:{graph}] cyclic dependency detected at vertex {vertex}")]
    Cycle { graph: String, vertex: String },
}
