use async_trait::async_trait;
use dagcore::{Operator, OperatorError, OperatorOutput, RunContext, Value, Vertex};
use dagruntime::{OperatorFactory, OperatorMetadata};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

/// Delay execution for a specified duration
pub struct DelayOperator {
    delay: Duration,
    inputs: HashMap<String, Value>,
}

impl DelayOperator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inputs: HashMap::new(),
        }
    }
}

#[async_trait]
impl Operator for DelayOperator {
    fn name(&self) -> &str {
        "time.delay"
    }

    fn inject(&mut self, name: &str, value: Value) -> Result<(), OperatorError> {
        self.inputs.insert(name.to_string(), value);
        Ok(())
    }

    async fn execute(&mut self, _ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        tracing::debug!("Delaying for {:?}", self.delay);

        sleep(self.delay).await;

        // Pass through any inputs
        Ok(OperatorOutput {
            outputs: self.inputs.clone(),
        })
    }

    fn reset(&mut self) -> bool {
        self.inputs.clear();
        true
    }
}

pub struct DelayOperatorFactory;

impl OperatorFactory for DelayOperatorFactory {
    fn create(&self, vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError> {
        let delay_ms = match vertex.config().get("delay_ms") {
            None => 1000.0, // Default to 1 second if not specified
            Some(value) => value
                .as_f64()
                .filter(|ms| *ms >= 0.0)
                .ok_or_else(|| OperatorError::InvalidInputType {
                    field: "delay_ms".to_string(),
                    expected: "non-negative number".to_string(),
                    actual: value.type_name().to_string(),
                })?,
        };
        Ok(Box::new(DelayOperator::new(Duration::from_millis(delay_ms as u64))))
    }

    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![],
            outputs: vec![],
        }
    }
}
