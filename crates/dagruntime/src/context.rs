//! Per-run mutable mirror of a static graph cluster.
//!
//! A [`GraphClusterContext`] is built once per pool slot and reused serially.
//! Each run walks one graph of it: every vertex keeps an atomic count of the
//! dependencies still outstanding, and the task that resolves the last one
//! dispatches the vertex. No task owns the whole run.

use crate::executor::{Task, TaskExecutor};
use crate::registry::OperatorRegistry;
use chrono::{DateTime, Utc};
use dagcore::{
    DagError, Graph, GraphCluster, Operator, OperatorError, RunContext, Value, Vertex,
    VertexResult,
};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Outcome of one run, handed to the completion callback
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub cluster: String,
    pub graph: String,
    /// Terminal result of every vertex, keyed by vertex id
    pub results: HashMap<String, VertexResult>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Whether the deadline passed before every vertex was executed
    pub timed_out: bool,
}

impl RunReport {
    pub fn result(&self, vertex: &str) -> Option<VertexResult> {
        self.results.get(vertex).copied()
    }

    /// Whether every vertex resolved to Ok
    pub fn is_success(&self) -> bool {
        self.results.values().all(|r| *r == VertexResult::Ok)
    }
}

/// Called once when a run resolves its last vertex, after the context is reset
pub(crate) type OnFinish = Box<dyn FnOnce(Arc<GraphClusterContext>, RunReport) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

struct VertexContext {
    operator: Mutex<Option<Box<dyn Operator>>>,
    remaining: AtomicUsize,
    dep_results: Vec<AtomicU8>,
    result: AtomicU8,
    outputs: Mutex<HashMap<String, Value>>,
}

impl VertexContext {
    fn new(vertex: &Vertex, registry: &OperatorRegistry) -> Result<Self, OperatorError> {
        Ok(Self {
            operator: Mutex::new(Some(registry.create(vertex)?)),
            remaining: AtomicUsize::new(vertex.deps().len()),
            dep_results: vertex
                .deps()
                .iter()
                .map(|_| AtomicU8::new(VertexResult::Init as u8))
                .collect(),
            result: AtomicU8::new(VertexResult::Init as u8),
            outputs: Mutex::new(HashMap::new()),
        })
    }

    /// Record a predecessor's result in `slot`.
    ///
    /// Returns true when this report satisfied the last outstanding
    /// dependency. A slot accepts one report per run; later ones are ignored.
    fn report(&self, slot: usize, result: VertexResult) -> bool {
        let first = self.dep_results[slot]
            .compare_exchange(
                VertexResult::Init as u8,
                result as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        first && self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn result(&self) -> VertexResult {
        VertexResult::from_u8(self.result.load(Ordering::Acquire))
    }

    fn output(&self, name: &str) -> Option<Value> {
        lock(&self.outputs).get(name).cloned()
    }

    fn reset(&self, vertex: &Vertex, registry: &OperatorRegistry) {
        self.result.store(VertexResult::Init as u8, Ordering::Release);
        for slot in &self.dep_results {
            slot.store(VertexResult::Init as u8, Ordering::Release);
        }
        self.remaining.store(vertex.deps().len(), Ordering::Release);
        lock(&self.outputs).clear();

        let mut operator = lock(&self.operator);
        let reusable = operator.as_mut().is_some_and(|op| op.reset());
        if !reusable {
            *operator = match registry.create(vertex) {
                Ok(fresh) => Some(fresh),
                Err(e) => {
                    tracing::error!(
                        "Failed to recreate operator for vertex {}: {}",
                        vertex.id(),
                        e
                    );
                    None
                }
            };
        }
    }
}

struct RunInfo {
    id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
}

struct GraphContext {
    vertices: Vec<VertexContext>,
    remaining: AtomicUsize,
    run: Mutex<Option<RunInfo>>,
    done: Mutex<Option<OnFinish>>,
}

impl GraphContext {
    fn new(graph: &Graph, registry: &OperatorRegistry) -> Result<Self, OperatorError> {
        let vertices = graph
            .vertices()
            .iter()
            .map(|v| VertexContext::new(v, registry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            vertices,
            remaining: AtomicUsize::new(graph.len()),
            run: Mutex::new(None),
            done: Mutex::new(None),
        })
    }

    fn reset(&self, graph: &Graph, registry: &OperatorRegistry) {
        for (vertex, ctx) in graph.vertices().iter().zip(&self.vertices) {
            ctx.reset(vertex, registry);
        }
        self.remaining.store(graph.len(), Ordering::Release);
        *lock(&self.run) = None;
    }
}

/// Execution state for one run of any graph in a cluster
pub(crate) struct GraphClusterContext {
    name: String,
    cluster: Arc<GraphCluster>,
    registry: Arc<OperatorRegistry>,
    graphs: Vec<GraphContext>,
    /// Absolute deadline in µs since the epoch, 0 for none
    deadline: AtomicI64,
    timed_out: AtomicBool,
}

impl GraphClusterContext {
    /// Build a context with one operator instance per vertex
    pub(crate) fn new(
        name: impl Into<String>,
        cluster: Arc<GraphCluster>,
        registry: Arc<OperatorRegistry>,
    ) -> Result<Self, OperatorError> {
        let graphs = cluster
            .graphs()
            .iter()
            .map(|g| GraphContext::new(g, &registry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.into(),
            cluster,
            registry,
            graphs,
            deadline: AtomicI64::new(0),
            timed_out: AtomicBool::new(false),
        })
    }

    fn deadline_passed(&self) -> bool {
        let deadline = self.deadline.load(Ordering::Acquire);
        deadline != 0 && now_micros() > deadline
    }

    fn reset(&self, graph: usize) {
        self.graphs[graph].reset(&self.cluster.graphs()[graph], &self.registry);
        self.deadline.store(0, Ordering::Release);
        self.timed_out.store(false, Ordering::Release);
    }

    /// Start graph `graph` and return once its entry vertices are queued.
    ///
    /// `on_finish` runs exactly once, from whichever task resolves the last
    /// vertex. Fails without touching any state if `executor` is stopped.
    pub(crate) async fn start(
        self: Arc<Self>,
        graph: usize,
        ctx: Arc<RunContext>,
        executor: Arc<dyn TaskExecutor>,
        timeout_ms: u64,
        on_finish: OnFinish,
    ) -> Result<(), DagError> {
        if executor.is_stopped() {
            return Err(DagError::ExecutorStopped);
        }

        let info = RunInfo {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
        };
        // Offsets past the i64 microsecond range mean no deadline
        let offset = i64::try_from(timeout_ms)
            .ok()
            .and_then(|ms| ms.checked_mul(1000));
        if let Some(offset) = offset.filter(|us| *us > 0) {
            let deadline = info.started_at.timestamp_micros().saturating_add(offset);
            self.deadline.store(deadline, Ordering::Release);
        }
        tracing::debug!(
            "Starting run {} of graph {} in cluster {}",
            info.id,
            self.cluster.graphs()[graph].name(),
            self.name
        );
        *lock(&self.graphs[graph].run) = Some(info);
        *lock(&self.graphs[graph].done) = Some(on_finish);

        let entries: Vec<usize> = self.cluster.graphs()[graph]
            .entry_vertices()
            .map(|v| v.index())
            .collect();
        let run = Run {
            cluster: self,
            graph,
            ctx,
            executor: executor.clone(),
        };
        for idx in entries {
            if let Err(e) = executor.submit(run.clone().task(idx)).await {
                tracing::warn!("Running entry vertex outside the executor: {}", e);
                tokio::spawn(run.clone().task(idx));
            }
        }
        Ok(())
    }
}

/// Handle captured by every vertex task of one run
#[derive(Clone)]
struct Run {
    cluster: Arc<GraphClusterContext>,
    graph: usize,
    ctx: Arc<RunContext>,
    executor: Arc<dyn TaskExecutor>,
}

impl Run {
    fn graph(&self) -> &Graph {
        &self.cluster.cluster.graphs()[self.graph]
    }

    fn state(&self) -> &GraphContext {
        &self.cluster.graphs[self.graph]
    }

    /// Execute `start` and every vertex this task becomes responsible for
    fn task(self, start: usize) -> Task {
        Box::pin(async move {
            let mut ready = vec![start];
            while let Some(idx) = ready.pop() {
                let result = self.execute_vertex(idx).await;
                self.complete(idx, result, &mut ready);
            }
        })
    }

    async fn execute_vertex(&self, idx: usize) -> VertexResult {
        let vertex = &self.graph().vertices()[idx];
        let state = &self.state().vertices[idx];

        if self.cluster.deadline_passed() {
            tracing::debug!("Vertex {} timed out before execution", vertex.id());
            return VertexResult::TimedOut;
        }

        for (dep, slot) in vertex.deps().iter().zip(&state.dep_results) {
            let actual = VertexResult::from_u8(slot.load(Ordering::Acquire));
            if !dep.expect.accepts(actual) {
                tracing::debug!(
                    "Vertex {} skipped: {} finished {}, expected {:?}",
                    vertex.id(),
                    self.graph().vertices()[dep.vertex].id(),
                    actual,
                    dep.expect
                );
                return VertexResult::Fail;
            }
        }

        let taken = lock(&state.operator).take();
        let Some(mut operator) = taken else {
            tracing::error!("Vertex {} has no operator instance", vertex.id());
            return VertexResult::Fail;
        };

        for input in vertex.inputs() {
            let producer = &self.state().vertices[input.producer];
            let injected = match producer.output(&input.producer_port) {
                Some(value) => operator.inject(&input.name, value),
                None => Err(OperatorError::MissingInput(input.data.clone())),
            };
            if let Err(e) = injected {
                tracing::warn!("Vertex {} input {} rejected: {}", vertex.id(), input.name, e);
                *lock(&state.operator) = Some(operator);
                return VertexResult::Fail;
            }
        }

        let outcome = AssertUnwindSafe(operator.execute(&self.ctx))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(output)) => {
                *lock(&state.operator) = Some(operator);
                *lock(&state.outputs) = output.outputs;
                VertexResult::Ok
            }
            Ok(Err(e)) => {
                tracing::debug!("Vertex {} failed: {}", vertex.id(), e);
                *lock(&state.operator) = Some(operator);
                VertexResult::Fail
            }
            Err(_) => {
                // dropped; reset asks the factory for a fresh instance
                tracing::error!("Operator {} panicked in vertex {}", operator.name(), vertex.id());
                VertexResult::Fail
            }
        }
    }

    fn complete(&self, idx: usize, result: VertexResult, ready: &mut Vec<usize>) {
        let state = self.state();
        state.vertices[idx]
            .result
            .store(result as u8, Ordering::Release);
        if result == VertexResult::TimedOut {
            self.cluster.timed_out.store(true, Ordering::Release);
        }

        if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
            return;
        }

        for succ in self.graph().vertices()[idx].next() {
            if state.vertices[succ.vertex].report(succ.slot, result) {
                self.dispatch(succ.vertex, ready);
            }
        }
    }

    fn dispatch(&self, idx: usize, ready: &mut Vec<usize>) {
        if let Err(e) = self.executor.try_submit(self.clone().task(idx)) {
            tracing::trace!("Running vertex inline ({})", e);
            ready.push(idx);
        }
    }

    fn finish(&self) {
        let graph = self.graph();
        let state = self.state();
        let info = lock(&state.run).take();
        let (run_id, started_at, elapsed) = match info {
            Some(info) => (info.id, info.started_at, info.started.elapsed()),
            None => (Uuid::nil(), Utc::now(), Duration::ZERO),
        };
        let report = RunReport {
            run_id,
            cluster: self.cluster.name.clone(),
            graph: graph.name().to_string(),
            results: graph
                .vertices()
                .iter()
                .zip(&state.vertices)
                .map(|(v, ctx)| (v.id().to_string(), ctx.result()))
                .collect(),
            started_at,
            elapsed,
            timed_out: self.cluster.timed_out.load(Ordering::Acquire),
        };
        tracing::debug!(
            "Run {} of graph {} finished in {:?}",
            report.run_id,
            report.graph,
            report.elapsed
        );

        let on_finish = lock(&state.done).take();
        self.cluster.reset(self.graph);
        if let Some(on_finish) = on_finish {
            on_finish(self.cluster.clone(), report);
        }
    }
}
