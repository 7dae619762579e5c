use async_trait::async_trait;
use dagcore::{Operator, OperatorError, OperatorOutput, RunContext, Value, Vertex};
use dagruntime::{OperatorFactory, OperatorMetadata};
use std::collections::BTreeMap;

/// Simple debug operator that logs its message and inputs
pub struct DebugOperator {
    vertex: String,
    message: String,
    inputs: BTreeMap<String, Value>,
}

impl DebugOperator {
    pub fn new(vertex: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            vertex: vertex.into(),
            message: message.into(),
            inputs: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl Operator for DebugOperator {
    fn name(&self) -> &str {
        "debug.log"
    }

    fn inject(&mut self, name: &str, value: Value) -> Result<(), OperatorError> {
        self.inputs.insert(name.to_string(), value);
        Ok(())
    }

    async fn execute(&mut self, _ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        tracing::info!("DEBUG [{}]: {}", self.vertex, self.message);

        // Also log all inputs for visibility
        for (key, value) in &self.inputs {
            tracing::info!("  {}: {}", key, value);
        }

        Ok(OperatorOutput::new().with_output("message", self.message.clone()))
    }

    fn reset(&mut self) -> bool {
        self.inputs.clear();
        true
    }
}

pub struct DebugOperatorFactory;

impl OperatorFactory for DebugOperatorFactory {
    fn create(&self, vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError> {
        let message = vertex
            .config()
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        Ok(Box::new(DebugOperator::new(vertex.id(), message)))
    }

    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata {
            description: "Logs its message and any injected inputs".to_string(),
            category: "debug".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}
