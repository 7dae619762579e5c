use async_trait::async_trait;
use dagcore::{
    DagError, Operator, OperatorError, OperatorOutput, RunContext, UserData, Value, Vertex,
    VertexResult,
};
use dagruntime::{
    FnFactory, GraphManager, OperatorMetadata, PortDefinition, RunReport, RuntimeConfig,
    WorkerPool,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// What operators observed during one run
#[derive(Default)]
struct Journal {
    order: Mutex<Vec<String>>,
    values: Mutex<HashMap<String, Value>>,
}

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.order.lock().unwrap().push(entry.into());
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    fn position(&self, entry: &str) -> usize {
        self.order()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} never ran", entry))
    }
}

/// Records its vertex id; `sleep_ms`, `fail` and `panic` come from config
struct Record {
    id: String,
    sleep: Option<Duration>,
    fail: bool,
    panic: bool,
}

fn record_factory(vertex: &Vertex) -> Result<Box<dyn Operator>, OperatorError> {
    let config = vertex.config();
    Ok(Box::new(Record {
        id: vertex.id().to_string(),
        sleep: config
            .get("sleep_ms")
            .and_then(Value::as_f64)
            .map(|ms| Duration::from_millis(ms as u64)),
        fail: config.get("fail").and_then(Value::as_bool).unwrap_or(false),
        panic: config.get("panic").and_then(Value::as_bool).unwrap_or(false),
    }))
}

#[async_trait]
impl Operator for Record {
    fn name(&self) -> &str {
        "record"
    }

    async fn execute(&mut self, ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        if let Some(sleep) = self.sleep {
            tokio::time::sleep(sleep).await;
        }
        if self.panic {
            panic!("vertex {} panicked", self.id);
        }
        if let Some(journal) = ctx.user_data::<Journal>() {
            journal.push(&self.id);
        }
        if self.fail {
            return Err(OperatorError::ExecutionFailed(format!("{} failed", self.id)));
        }
        Ok(OperatorOutput::new())
    }
}

/// Emits d1 and d2; with `partial` set it emits only d1
struct DataOperator1 {
    partial: bool,
}

#[async_trait]
impl Operator for DataOperator1 {
    fn name(&self) -> &str {
        "DataOperator1"
    }

    async fn execute(&mut self, _ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        let output = OperatorOutput::new().with_output("d1", 1);
        if self.partial {
            return Ok(output);
        }
        Ok(output.with_output("d2", "Hello from DataOperator1"))
    }
}

#[derive(Default)]
struct DataOperator2 {
    received: HashMap<String, Value>,
}

#[async_trait]
impl Operator for DataOperator2 {
    fn name(&self) -> &str {
        "DataOperator2"
    }

    fn inject(&mut self, name: &str, value: Value) -> Result<(), OperatorError> {
        self.received.insert(name.to_string(), value);
        Ok(())
    }

    async fn execute(&mut self, ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        if let Some(journal) = ctx.user_data::<Journal>() {
            journal.push("DataOperator2");
            journal.values.lock().unwrap().extend(self.received.drain());
        }
        Ok(OperatorOutput::new())
    }

    fn reset(&mut self) -> bool {
        self.received.clear();
        true
    }
}

/// Counts its executions since the last reset
struct Counter {
    runs: usize,
}

#[async_trait]
impl Operator for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    async fn execute(&mut self, ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        self.runs += 1;
        if let Some(journal) = ctx.user_data::<Journal>() {
            journal.push(format!("counter:{}", self.runs));
        }
        Ok(OperatorOutput::new())
    }

    fn reset(&mut self) -> bool {
        self.runs = 0;
        true
    }
}

/// Never reusable; every reset goes back to the factory
struct Disposable;

#[async_trait]
impl Operator for Disposable {
    fn name(&self) -> &str {
        "disposable"
    }

    async fn execute(&mut self, _ctx: &RunContext) -> Result<OperatorOutput, OperatorError> {
        Ok(OperatorOutput::new())
    }

    fn reset(&mut self) -> bool {
        false
    }
}

fn manager() -> GraphManager {
    let manager = GraphManager::with_config(RuntimeConfig::default());
    let registry = manager.registry();
    registry.register_fn("record", record_factory);
    registry.register(
        "DataOperator1",
        Arc::new(
            FnFactory::new(|vertex: &Vertex| {
                let partial = vertex
                    .config()
                    .get("partial")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(Box::new(DataOperator1 { partial }) as Box<dyn Operator>)
            })
            .with_metadata(OperatorMetadata {
                outputs: vec![
                    PortDefinition::required("d1", "a number"),
                    PortDefinition::required("d2", "a greeting"),
                ],
                ..OperatorMetadata::default()
            }),
        ),
    );
    registry.register(
        "DataOperator2",
        Arc::new(
            FnFactory::new(|_: &Vertex| {
                Ok(Box::new(DataOperator2::default()) as Box<dyn Operator>)
            })
            .with_metadata(OperatorMetadata {
                inputs: vec![
                    PortDefinition::required("d1", "a number"),
                    PortDefinition::required("d2", "a greeting"),
                ],
                ..OperatorMetadata::default()
            }),
        ),
    );
    registry.register_fn("counter", |_| Ok(Box::new(Counter { runs: 0 })));
    manager
}

async fn run_with(
    manager: &GraphManager,
    ctx: RunContext,
    cluster: &str,
    graph: &str,
    timeout_ms: u64,
) -> RunReport {
    let (tx, rx) = oneshot::channel();
    manager
        .execute_with_context(ctx, cluster, graph, timeout_ms, move |report| {
            let _ = tx.send(report);
        })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("run did not finish")
        .unwrap()
}

async fn run(
    manager: &GraphManager,
    journal: &Arc<Journal>,
    cluster: &str,
    graph: &str,
) -> RunReport {
    let data: UserData = journal.clone();
    run_with(manager, RunContext::new(Some(data)), cluster, graph, 0).await
}

const DIAMOND: &str = r#"
[[graph]]
name = "diamond"

[[graph.vertex]]
id = "A"
op = "record"
start = true
next = ["B", "C"]

[[graph.vertex]]
id = "B"
op = "record"
config = { sleep_ms = 20 }

[[graph.vertex]]
id = "C"
op = "record"

[[graph.vertex]]
id = "D"
op = "record"
deps = ["B", "C"]
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn diamond_joins_after_both_branches() {
    init_tracing();
    let manager = manager();
    manager.build("c", DIAMOND).await.unwrap();

    let journal = Arc::new(Journal::default());
    let report = run(&manager, &journal, "c", "diamond").await;

    assert!(report.is_success(), "{:?}", report.results);
    assert_eq!(report.results.len(), 4);
    assert!(!report.timed_out);

    let order = journal.order();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "A");
    assert_eq!(order[3], "D");
    assert!(journal.position("B") < journal.position("D"));
    assert!(journal.position("C") < journal.position("D"));
}

const ROUTING: &str = r#"
[[graph]]
name = "route"

[[graph.vertex]]
id = "check"
cond = "x > y"
start = true
next_on_ok = ["bigger"]
next_on_fail = ["smaller"]

[[graph.vertex]]
id = "bigger"
op = "record"

[[graph.vertex]]
id = "smaller"
op = "record"
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn condition_routes_by_result() {
    init_tracing();
    let manager = manager();
    manager.build("c", ROUTING).await.unwrap();

    for (x, y, taken, skipped) in [(3, 2, "bigger", "smaller"), (1, 2, "smaller", "bigger")] {
        let journal = Arc::new(Journal::default());
        let params = HashMap::from([
            ("x".to_string(), Value::from(x)),
            ("y".to_string(), Value::from(y)),
        ]);
        let data: UserData = journal.clone();
        let ctx = RunContext::with_params(params, Some(data));
        let report = run_with(&manager, ctx, "c", "route", 0).await;

        assert_eq!(report.result(taken), Some(VertexResult::Ok));
        assert_eq!(report.result(skipped), Some(VertexResult::Fail));
        assert_eq!(journal.order(), vec![taken.to_string()]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn condition_on_missing_variable_fails() {
    init_tracing();
    let manager = manager();
    manager.build("c", ROUTING).await.unwrap();

    let journal = Arc::new(Journal::default());
    let report = run(&manager, &journal, "c", "route").await;
    assert_eq!(report.result("check"), Some(VertexResult::Fail));
    assert_eq!(journal.order(), vec!["smaller".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn data_flows_from_producer_to_consumer() {
    init_tracing();
    let manager = manager();
    manager
        .build(
            "c",
            r#"
            [[graph]]
            name = "data"

            [[graph.vertex]]
            op = "DataOperator1"

            [[graph.vertex]]
            op = "DataOperator2"
            "#,
        )
        .await
        .unwrap();

    let journal = Arc::new(Journal::default());
    let report = run(&manager, &journal, "c", "data").await;
    assert!(report.is_success());

    let values = journal.values.lock().unwrap().clone();
    assert_eq!(values["d1"].as_f64(), Some(1.0));
    assert_eq!(values["d2"].as_str(), Some("Hello from DataOperator1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_fails_without_its_inputs() {
    init_tracing();
    let manager = manager();
    manager
        .build(
            "c",
            r#"
            [[graph]]
            name = "skipped"

            [[graph.vertex]]
            id = "gate"
            cond = "enabled"
            start = true
            next_on_ok = ["DataOperator1"]

            [[graph.vertex]]
            op = "DataOperator1"

            [[graph.vertex]]
            op = "DataOperator2"

            [[graph]]
            name = "partial"

            [[graph.vertex]]
            op = "DataOperator1"
            config = { partial = true }

            [[graph.vertex]]
            op = "DataOperator2"
            "#,
        )
        .await
        .unwrap();

    let journal = Arc::new(Journal::default());
    let params = HashMap::from([("enabled".to_string(), Value::Bool(false))]);
    let data: UserData = journal.clone();
    let ctx = RunContext::with_params(params, Some(data));
    let report = run_with(&manager, ctx, "c", "skipped", 0).await;
    assert_eq!(report.result("DataOperator1"), Some(VertexResult::Fail));
    assert_eq!(report.result("DataOperator2"), Some(VertexResult::Fail));

    let report = run(&manager, &journal, "c", "partial").await;
    assert_eq!(report.result("DataOperator1"), Some(VertexResult::Ok));
    assert_eq!(report.result("DataOperator2"), Some(VertexResult::Fail));
    assert!(journal.order().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_runs_reuse_a_clean_context() {
    init_tracing();
    let manager = manager();
    let created = Arc::new(AtomicUsize::new(0));
    let counted = created.clone();
    manager.registry().register_fn("disposable", move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Disposable))
    });
    manager
        .build(
            "c",
            r#"
            [[graph]]
            name = "reuse"

            [[graph.vertex]]
            op = "counter"
            start = true
            next = ["disposable"]

            [[graph.vertex]]
            op = "disposable"
            "#,
        )
        .await
        .unwrap();

    const RUNS: usize = 10;
    for _ in 0..RUNS {
        let journal = Arc::new(Journal::default());
        let report = run(&manager, &journal, "c", "reuse").await;
        assert!(report.is_success());
        assert_eq!(journal.order(), vec!["counter:1".to_string()]);
        assert_eq!(manager.idle_contexts("c").await.unwrap(), 1);
    }
    assert_eq!(created.load(Ordering::SeqCst), RUNS + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_times_out_remaining_vertices() {
    init_tracing();
    let manager = manager();
    manager
        .build(
            "c",
            r#"
            [[graph]]
            name = "slow"

            [[graph.vertex]]
            id = "a"
            op = "record"
            start = true
            next = ["b"]
            config = { sleep_ms = 100 }

            [[graph.vertex]]
            id = "b"
            op = "record"
            next = ["c"]
            config = { sleep_ms = 100 }

            [[graph.vertex]]
            id = "c"
            op = "record"
            config = { sleep_ms = 100 }
            "#,
        )
        .await
        .unwrap();

    let journal = Arc::new(Journal::default());
    let data: UserData = journal.clone();
    let report = run_with(&manager, RunContext::new(Some(data)), "c", "slow", 1).await;

    assert!(report.timed_out);
    assert_eq!(report.result("b"), Some(VertexResult::TimedOut));
    assert_eq!(report.result("c"), Some(VertexResult::TimedOut));
    assert!(!journal.order().contains(&"c".to_string()));

    // the deadline does not leak into the next run
    let report = run(&manager, &journal, "c", "slow").await;
    assert!(!report.timed_out);
    assert!(report.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn huge_timeouts_leave_runs_without_deadline() {
    init_tracing();
    let manager = manager();
    manager
        .build(
            "c",
            r#"
            [[graph]]
            name = "single"

            [[graph.vertex]]
            id = "only"
            op = "record"
            start = true
            "#,
        )
        .await
        .unwrap();

    for timeout_ms in [u64::MAX, 10_000_000_000_000_000, i64::MAX as u64] {
        let journal = Arc::new(Journal::default());
        let data: UserData = journal.clone();
        let ctx = RunContext::new(Some(data));
        let report = run_with(&manager, ctx, "c", "single", timeout_ms).await;

        assert!(!report.timed_out, "timeout {} expired", timeout_ms);
        assert_eq!(report.result("only"), Some(VertexResult::Ok));
        assert_eq!(journal.order(), vec!["only".to_string()]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_edge_reports_once() {
    init_tracing();
    let manager = manager();
    manager
        .build(
            "c",
            r#"
            [[graph]]
            name = "twice"

            [[graph.vertex]]
            id = "a"
            op = "record"
            start = true
            next_on_ok = ["b"]
            config = { fail = true }

            [[graph.vertex]]
            id = "b"
            op = "record"
            deps = ["a"]
            next = ["c"]

            [[graph.vertex]]
            id = "c"
            op = "record"
            deps = ["b"]
            "#,
        )
        .await
        .unwrap();

    for _ in 0..5 {
        let journal = Arc::new(Journal::default());
        let report = run(&manager, &journal, "c", "twice").await;

        // the wildcard declared on b replaces a's Ok-only edge
        assert_eq!(report.result("a"), Some(VertexResult::Fail));
        assert_eq!(report.result("b"), Some(VertexResult::Ok));
        assert_eq!(report.result("c"), Some(VertexResult::Ok));
        assert_eq!(journal.order(), vec!["a", "b", "c"]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_fires_once_per_concurrent_run() {
    init_tracing();
    let manager = manager();
    manager
        .build(
            "c",
            r#"
            [[graph]]
            name = "mixed"

            [[graph.vertex]]
            id = "a"
            op = "record"
            start = true
            next = ["boom", "fails"]

            [[graph.vertex]]
            id = "boom"
            op = "record"
            config = { panic = true }
            next_on_fail = ["recover"]

            [[graph.vertex]]
            id = "fails"
            op = "record"
            config = { fail = true }
            next_on_ok = ["never"]

            [[graph.vertex]]
            id = "recover"
            op = "record"

            [[graph.vertex]]
            id = "never"
            op = "record"
            "#,
        )
        .await
        .unwrap();

    const RUNS: usize = 50;
    let fired = Arc::new(AtomicUsize::new(0));
    let mut pending = Vec::new();
    for _ in 0..RUNS {
        let (tx, rx) = oneshot::channel();
        let fired = fired.clone();
        manager
            .execute(None, "c", "mixed", 0, move |report| {
                fired.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(report);
            })
            .await
            .unwrap();
        pending.push(rx);
    }

    for rx in pending {
        let report = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("run did not finish")
            .unwrap();
        assert_eq!(report.result("boom"), Some(VertexResult::Fail));
        assert_eq!(report.result("recover"), Some(VertexResult::Ok));
        assert_eq!(report.result("fails"), Some(VertexResult::Fail));
        assert_eq!(report.result("never"), Some(VertexResult::Fail));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), RUNS);
    let idle = manager.idle_contexts("c").await.unwrap();
    assert!((1..=RUNS).contains(&idle));
}

#[tokio::test]
async fn failed_rebuild_keeps_previous_cluster() {
    init_tracing();
    let manager = manager();
    manager.build("c", DIAMOND).await.unwrap();

    let cyclic = r#"
        [[graph]]
        name = "loop"

        [[graph.vertex]]
        id = "a"
        op = "record"
        next = ["b"]

        [[graph.vertex]]
        id = "b"
        op = "record"
        next = ["a"]
    "#;
    assert!(matches!(
        manager.build("c", cyclic).await,
        Err(DagError::Build(dagcore::BuildError::Cycle { .. }))
    ));
    assert!(matches!(manager.build("c", "[[graph]").await, Err(DagError::Decode(_))));
    assert_eq!(manager.graph_names("c").await.unwrap(), vec!["diamond".to_string()]);

    manager.build("c", ROUTING).await.unwrap();
    assert_eq!(manager.graph_names("c").await.unwrap(), vec!["route".to_string()]);
    assert_eq!(manager.cluster_names().await, vec!["c".to_string()]);
    assert!(manager.dump_dot("c").await.unwrap().contains("\"route_check\""));
}

#[tokio::test]
async fn unknown_targets_are_rejected_before_running() {
    init_tracing();
    let manager = manager();
    manager.build("c", DIAMOND).await.unwrap();

    let result = manager.execute(None, "missing", "diamond", 0, |_| {}).await;
    assert!(matches!(result, Err(DagError::ClusterNotFound(name)) if name == "missing"));

    let result = manager.execute(None, "c", "missing", 0, |_| {}).await;
    assert!(matches!(result, Err(DagError::GraphNotFound { graph, .. }) if graph == "missing"));

    assert!(matches!(manager.graph_names("missing").await, Err(DagError::ClusterNotFound(_))));
    assert_eq!(manager.idle_contexts("c").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reregistered_operator_applies_to_later_builds() {
    init_tracing();
    let manager = manager();
    let single = r#"
        [[graph]]
        name = "g"

        [[graph.vertex]]
        op = "tagged"
        start = true
    "#;

    manager.registry().register_fn("tagged", |_| {
        Ok(Box::new(Record {
            id: "v1".into(),
            sleep: None,
            fail: false,
            panic: false,
        }))
    });
    manager.build("c", single).await.unwrap();
    let journal = Arc::new(Journal::default());
    run(&manager, &journal, "c", "g").await;

    manager.registry().register_fn("tagged", |_| {
        Ok(Box::new(Record {
            id: "v2".into(),
            sleep: None,
            fail: false,
            panic: false,
        }))
    });
    assert!(manager.is_operator_registered("tagged"));
    manager.build("c", single).await.unwrap();
    run(&manager, &journal, "c", "g").await;

    assert_eq!(journal.order(), vec!["v1".to_string(), "v2".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_executor_refuses_runs_until_replaced() {
    init_tracing();
    let manager = manager();
    manager.build("c", DIAMOND).await.unwrap();

    let journal = Arc::new(Journal::default());
    run(&manager, &journal, "c", "diamond").await;

    manager.stop().await;
    let result = manager.execute(None, "c", "diamond", 0, |_| {}).await;
    assert!(matches!(result, Err(DagError::ExecutorStopped)));
    assert_eq!(manager.idle_contexts("c").await.unwrap(), 1);

    manager.replace_executor(Arc::new(WorkerPool::new(64, 2))).await;
    let journal = Arc::new(Journal::default());
    let report = run(&manager, &journal, "c", "diamond").await;
    assert!(report.is_success());
    assert_eq!(journal.order().len(), 4);
}
