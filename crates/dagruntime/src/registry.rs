use async_trait::async_trait;
use dagcore::{
    Expression, Operator, OperatorCatalog, OperatorError, OperatorOutput, OperatorPorts,
    RunContext, Value, Vertex, EXPR_OPERATOR,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Factory trait for creating operator instances
pub trait OperatorFactory: Send + Sync {
    /// Create a new operator instance for `vertex`, reading its config
    fn create(&self, vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError>;

    /// Optional: describe the operator and the ports it consumes and emits
    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata::default()
    }
}

/// Metadata about an operator
#[derive(Debug, Clone)]
pub struct OperatorMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for OperatorMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, description)
        }
    }
}

/// Factory backed by a closure
pub struct FnFactory<F> {
    create: F,
    metadata: OperatorMetadata,
}

impl<F> FnFactory<F>
where
    F: Fn(&Vertex) -> Result<Box<dyn Operator>, OperatorError> + Send + Sync,
{
    pub fn new(create: F) -> Self {
        Self {
            create,
            metadata: OperatorMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: OperatorMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl<F> OperatorFactory for FnFactory<F>
where
    F: Fn(&Vertex) -> Result<Box<dyn Operator>, OperatorError> + Send + Sync,
{
    fn create(&self, vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError> {
        (self.create)(vertex)
    }

    fn metadata(&self) -> OperatorMetadata {
        self.metadata.clone()
    }
}

/// Registry of available operators.
///
/// Every registry starts with the condition evaluator bound to
/// [`EXPR_OPERATOR`].
pub struct OperatorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn OperatorFactory>>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register(EXPR_OPERATOR, Arc::new(ExpressionFactory));
        registry
    }

    /// Register an operator factory, replacing any factory of the same name
    pub fn register(&self, name: impl Into<String>, factory: Arc<dyn OperatorFactory>) {
        let name = name.into();
        tracing::info!("Registering operator: {}", name);
        let previous = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), factory);
        if previous.is_some() {
            tracing::info!("Replaced previously registered operator: {}", name);
        }
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, create: F)
    where
        F: Fn(&Vertex) -> Result<Box<dyn Operator>, OperatorError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(FnFactory::new(create)));
    }

    fn factory(&self, name: &str) -> Option<Arc<dyn OperatorFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Create the operator instance for `vertex`
    pub fn create(&self, vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError> {
        let factory = self.factory(vertex.operator()).ok_or_else(|| {
            OperatorError::Configuration(format!(
                "operator {} is not registered",
                vertex.operator()
            ))
        })?;
        factory.create(vertex)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Names of all user-visible operators, sorted
    pub fn list_operators(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|name| name.as_str() != EXPR_OPERATOR)
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn metadata(&self, name: &str) -> Option<OperatorMetadata> {
        self.factory(name).map(|f| f.metadata())
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorCatalog for OperatorRegistry {
    fn ports(&self, operator: &str) -> Option<OperatorPorts> {
        let metadata = self.metadata(operator)?;
        Some(OperatorPorts {
            inputs: metadata.inputs.into_iter().map(|p| p.name).collect(),
            outputs: metadata.outputs.into_iter().map(|p| p.name).collect(),
        })
    }
}

struct ExpressionFactory;

impl OperatorFactory for ExpressionFactory {
    fn create(&self, vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError> {
        let expr = vertex.condition().cloned().ok_or_else(|| {
            OperatorError::Configuration(format!("vertex {} has no condition", vertex.id()))
        })?;
        Ok(Box::new(ExpressionOperator::new(expr)))
    }

    fn metadata(&self) -> OperatorMetadata {
        OperatorMetadata {
            description: "Evaluates a condition vertex against the run parameters".to_string(),
            category: "core".to_string(),
            ..OperatorMetadata::default()
        }
    }
}

/// Succeeds when its expression evaluates to `true`
pub struct ExpressionOperator {
    expr: Arc<Expression>,
}

impl ExpressionOperator {
    pub fn new(expr: Arc<Expression>) -> Self {
        Self { expr }
    }
}

#[async_trait]
impl Operator for ExpressionOperator {
    fn name(&self) -> &str {
        EXPR_OPERATOR
    }

    async fn execute(&mut self, ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        match ctx.evaluate(&self.expr).await? {
            Value::Bool(true) => Ok(OperatorOutput::new()),
            Value::Bool(false) => {
                tracing::debug!("Condition '{}' evaluated to false", self.expr);
                Err(OperatorError::ConditionUnmet(self.expr.source().to_string()))
            }
            other => Err(OperatorError::NotBoolean {
                expr: self.expr.source().to_string(),
                actual: other.type_name().to_string(),
            }),
        }
    }
}
