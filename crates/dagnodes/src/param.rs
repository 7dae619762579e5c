use async_trait::async_trait;
use dagcore::{Operator, OperatorError, OperatorOutput, RunContext, Value, Vertex};
use dagruntime::{OperatorFactory, OperatorMetadata};
use std::collections::HashMap;

/// Writes every entry of its config into the run's parameter store
pub struct SetParamsOperator {
    values: HashMap<String, Value>,
}

impl SetParamsOperator {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl Operator for SetParamsOperator {
    fn name(&self) -> &str {
        "param.set"
    }

    async fn execute(&mut self, ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        for (name, value) in &self.values {
            ctx.set(name.clone(), value.clone()).await;
        }
        Ok(OperatorOutput::new())
    }
}

pub struct SetParamsOperatorFactory;

impl OperatorFactory for SetParamsOperatorFactory {
    fn create(&self, vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError> {
        Ok(Box::new(SetParamsOperator::new(vertex.config().clone())))
    }

    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata {
            description: "Set run parameters from the vertex config".to_string(),
            category: "param".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}

/// Emits every entry of its config as an output, for data-driven edges
pub struct EmitOperator {
    values: HashMap<String, Value>,
}

impl EmitOperator {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

#[async_trait]
impl Operator for EmitOperator {
    fn name(&self) -> &str {
        "value.emit"
    }

    async fn execute(&mut self, _ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        Ok(OperatorOutput {
            outputs: self.values.clone(),
        })
    }
}

pub struct EmitOperatorFactory;

impl OperatorFactory for EmitOperatorFactory {
    fn create(&self, vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError> {
        Ok(Box::new(EmitOperator::new(vertex.config().clone())))
    }

    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata {
            description: "Emit config values as outputs".to_string(),
            category: "param".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}
