use crate::expr::{ExprError, Expression};
use crate::{OperatorError, Value};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Opaque caller data attached to one run.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Core trait that all executable operators implement.
///
/// One instance is owned by one vertex of one pooled execution context, so
/// `execute` takes `&mut self` and an operator may keep state between
/// `inject` and `execute`. Between runs the engine calls `reset`.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Operator name, as registered (e.g. "time.delay")
    fn name(&self) -> &str;

    /// Execute the operator against the run's shared parameter store
    async fn execute(&mut self, ctx: &RunContext) -> Result<OperatorOutput, OperatorError>;

    /// Receive one declared input before `execute` is called
    fn inject(&mut self, name: &str, _value: Value) -> Result<(), OperatorError> {
        Err(OperatorError::UnexpectedInput {
            operator: self.name().to_string(),
            name: name.to_string(),
        })
    }

    /// Prepare the instance for the next run.
    ///
    /// Return `false` if the instance can't be reused; the engine then drops it
    /// and asks the operator's factory for a fresh one.
    fn reset(&mut self) -> bool {
        true
    }
}

/// Shared state visible to every operator during one run
pub struct RunContext {
    params: RwLock<HashMap<String, Value>>,
    user_data: Option<UserData>,
}

impl RunContext {
    pub fn new(user_data: Option<UserData>) -> Self {
        Self::with_params(HashMap::new(), user_data)
    }

    /// Create a context whose parameter store starts with `params`
    pub fn with_params(params: HashMap<String, Value>, user_data: Option<UserData>) -> Self {
        Self {
            params: RwLock::new(params),
            user_data,
        }
    }

    /// Caller data passed to `execute`, if it has type `T`
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_data.as_deref()?.downcast_ref::<T>()
    }

    pub async fn get(&self, name: &str) -> Option<Value> {
        self.params.read().await.get(name).cloned()
    }

    /// Get a parameter or return error
    pub async fn require(&self, name: &str) -> Result<Value, OperatorError> {
        self.get(name)
            .await
            .ok_or_else(|| OperatorError::MissingInput(name.to_string()))
    }

    pub async fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.params.write().await.insert(name.into(), value.into());
    }

    /// Copy of every parameter currently set
    pub async fn params(&self) -> HashMap<String, Value> {
        self.params.read().await.clone()
    }

    /// Evaluate `expr` with the parameter store as its variables
    pub async fn evaluate(&self, expr: &Expression) -> Result<Value, ExprError> {
        let params = self.params.read().await;
        expr.evaluate(&params)
    }

    pub async fn clear(&self) {
        self.params.write().await.clear();
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Output from operator execution
#[derive(Debug, Clone, Default)]
pub struct OperatorOutput {
    /// Emitted values keyed by output name
    pub outputs: HashMap<String, Value>,
}

impl OperatorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }
}
