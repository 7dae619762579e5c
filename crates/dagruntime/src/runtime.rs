use crate::context::{GraphClusterContext, OnFinish, RunReport};
use crate::executor::{TaskExecutor, WorkerPool};
use crate::registry::{OperatorFactory, OperatorRegistry};
use dagcore::{ClusterSpec, DagError, GraphCluster, RunContext, UserData};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Capacity of the task queue
    pub queue_length: usize,
    /// Number of worker tasks draining the queue
    pub workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_length: 32,
            workers: 8,
        }
    }
}

/// A built cluster plus its pool of idle execution contexts
struct ExecutableCluster {
    name: String,
    cluster: Arc<GraphCluster>,
    idle: Mutex<Vec<Arc<GraphClusterContext>>>,
}

impl ExecutableCluster {
    fn new(name: String, cluster: GraphCluster) -> Self {
        Self {
            name,
            cluster: Arc::new(cluster),
            idle: Mutex::new(Vec::new()),
        }
    }

    fn acquire(
        &self,
        registry: &Arc<OperatorRegistry>,
    ) -> Result<Arc<GraphClusterContext>, DagError> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        match pooled {
            Some(ctx) => Ok(ctx),
            None => {
                tracing::debug!("Creating execution context for cluster {}", self.name);
                let ctx =
                    GraphClusterContext::new(&self.name, self.cluster.clone(), registry.clone())?;
                Ok(Arc::new(ctx))
            }
        }
    }

    fn release(&self, ctx: Arc<GraphClusterContext>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ctx);
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Owns named graph clusters and runs them on a shared task executor
pub struct GraphManager {
    registry: Arc<OperatorRegistry>,
    executor: std::sync::RwLock<Arc<dyn TaskExecutor>>,
    clusters: RwLock<HashMap<String, Arc<ExecutableCluster>>>,
}

impl GraphManager {
    pub fn new(registry: Arc<OperatorRegistry>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            registry,
            executor: std::sync::RwLock::new(executor),
            clusters: RwLock::new(HashMap::new()),
        }
    }

    /// Create a manager with a fresh registry and worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_config(config: RuntimeConfig) -> Self {
        let executor = Arc::new(WorkerPool::new(config.queue_length, config.workers));
        Self::new(Arc::new(OperatorRegistry::new()), executor)
    }

    /// Get access to the operator registry
    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> Arc<dyn TaskExecutor> {
        self.executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn register_operator(&self, name: impl Into<String>, factory: Arc<dyn OperatorFactory>) {
        self.registry.register(name, factory);
    }

    pub fn is_operator_registered(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Decode a TOML cluster document and install it under `name`
    pub async fn build(&self, name: &str, source: &str) -> Result<(), DagError> {
        let spec = ClusterSpec::from_toml(source)?;
        self.build_spec(name, &spec).await
    }

    /// Build and install a cluster, replacing any cluster of the same name.
    ///
    /// Runs already in flight keep the cluster they started with. On error
    /// the previously installed cluster stays live.
    pub async fn build_spec(&self, name: &str, spec: &ClusterSpec) -> Result<(), DagError> {
        let cluster = GraphCluster::build(spec, self.registry.as_ref()).map_err(|e| {
            tracing::error!("Failed to build graph cluster {}: {}", name, e);
            e
        })?;
        tracing::info!(
            "Built graph cluster {} with graphs {:?}",
            name,
            cluster.graph_names()
        );

        let unit = Arc::new(ExecutableCluster::new(name.to_string(), cluster));
        if self.clusters.write().await.insert(name.to_string(), unit).is_some() {
            tracing::info!("Replaced graph cluster {}", name);
        }
        Ok(())
    }

    /// Run graph `graph` of cluster `cluster` with a fresh parameter store.
    ///
    /// Returns once the run is started; `done` fires exactly once when every
    /// vertex has resolved. `timeout_ms` of 0 means no deadline.
    pub async fn execute<F>(
        &self,
        user_data: Option<UserData>,
        cluster: &str,
        graph: &str,
        timeout_ms: u64,
        done: F,
    ) -> Result<(), DagError>
    where
        F: FnOnce(RunReport) + Send + 'static,
    {
        self.execute_with_context(RunContext::new(user_data), cluster, graph, timeout_ms, done)
            .await
    }

    /// Like [`execute`](Self::execute), with a caller-prepared parameter store
    pub async fn execute_with_context<F>(
        &self,
        ctx: RunContext,
        cluster: &str,
        graph: &str,
        timeout_ms: u64,
        done: F,
    ) -> Result<(), DagError>
    where
        F: FnOnce(RunReport) + Send + 'static,
    {
        let unit = self.unit(cluster).await?;
        let graph_idx = unit
            .cluster
            .position(graph)
            .ok_or_else(|| DagError::GraphNotFound {
                cluster: cluster.to_string(),
                graph: graph.to_string(),
            })?;

        let context = unit.acquire(&self.registry)?;
        let pool = unit.clone();
        let on_finish: OnFinish = Box::new(move |context, report| {
            pool.release(context);
            done(report);
        });

        let started = context
            .clone()
            .start(graph_idx, Arc::new(ctx), self.executor(), timeout_ms, on_finish)
            .await;
        if let Err(e) = started {
            tracing::error!("Failed to start graph {} of cluster {}: {}", graph, cluster, e);
            unit.release(context);
            return Err(e);
        }
        Ok(())
    }

    /// Stop the task executor, draining queued vertex tasks
    pub async fn stop(&self) {
        self.executor().stop().await;
        tracing::info!("Graph manager stopped");
    }

    /// Stop the current executor, then install `executor`
    pub async fn replace_executor(&self, executor: Arc<dyn TaskExecutor>) {
        self.executor().stop().await;
        *self
            .executor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = executor;
        tracing::info!("Task executor replaced");
    }

    pub async fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn graph_names(&self, cluster: &str) -> Result<Vec<String>, DagError> {
        Ok(self.unit(cluster).await?.cluster.graph_names())
    }

    /// Number of pooled contexts waiting for a run
    pub async fn idle_contexts(&self, cluster: &str) -> Result<usize, DagError> {
        Ok(self.unit(cluster).await?.idle_count())
    }

    pub async fn dump_dot(&self, cluster: &str) -> Result<String, DagError> {
        Ok(self.unit(cluster).await?.cluster.to_dot())
    }

    async fn unit(&self, cluster: &str) -> Result<Arc<ExecutableCluster>, DagError> {
        self.clusters
            .read()
            .await
            .get(cluster)
            .cloned()
            .ok_or_else(|| DagError::ClusterNotFound(cluster.to_string()))
    }
}
