use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dagcore::{ClusterSpec, GraphCluster, RunContext, Value};
use dagruntime::{GraphManager, OperatorRegistry, RuntimeConfig};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dag")]
#[command(about = "DAG Engine CLI", long_about = None)]
struct Cli {
    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one graph of a cluster file
    Run {
        /// Path to cluster TOML file
        #[arg(short, long)]
        file: PathBuf,

        /// Graph to run
        #[arg(short, long)]
        graph: String,

        /// Name to install the cluster under
        #[arg(short, long, default_value = "main")]
        cluster: String,

        /// Run deadline in milliseconds, 0 for none
        #[arg(short, long, default_value_t = 0)]
        timeout_ms: u64,

        /// Initial run parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Number of worker tasks
        #[arg(long, default_value_t = RuntimeConfig::default().workers)]
        workers: usize,

        /// Capacity of the task queue
        #[arg(long, default_value_t = RuntimeConfig::default().queue_length)]
        queue_length: usize,
    },

    /// Validate a cluster file
    Validate {
        /// Path to cluster TOML file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print a cluster file as a Graphviz DOT graph
    Dot {
        /// Path to cluster TOML file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List available operators
    Operators,

    /// Create a new example cluster file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "cluster.toml")]
        output: PathBuf,
    },
}

const EXAMPLE: &str = r#"[[graph]]
name = "example"

[[graph.vertex]]
id = "init"
op = "param.set"
start = true
next = ["check"]
config = { x = 3, y = 2 }

[[graph.vertex]]
id = "check"
cond = "x > y"
next_on_ok = ["greet"]
next_on_fail = ["complain"]

[[graph.vertex]]
id = "greet"
op = "debug.log"
config = { message = "x is bigger" }

[[graph.vertex]]
id = "complain"
op = "debug.log"
config = { message = "x is not bigger" }
"#;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            file,
            graph,
            cluster,
            timeout_ms,
            params,
            workers,
            queue_length,
        } => {
            let config = RuntimeConfig {
                queue_length,
                workers,
            };
            run_graph(&file, &cluster, &graph, timeout_ms, params, config).await?;
        }

        Commands::Validate { file } => {
            validate_cluster(&file)?;
        }

        Commands::Dot { file } => {
            print!("{}", load_cluster(&file)?.to_dot());
        }

        Commands::Operators => {
            list_operators();
        }

        Commands::Init { output } => {
            std::fs::write(&output, EXAMPLE)?;
            println!("Created example cluster: {}", output.display());
            println!();
            println!("Run it with:");
            println!("  dag run --file {} --graph example", output.display());
        }
    }

    Ok(())
}

fn standard_registry() -> OperatorRegistry {
    let registry = OperatorRegistry::new();
    dagnodes::register_all(&registry);
    registry
}

fn load_cluster(file: &Path) -> Result<GraphCluster> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let spec = ClusterSpec::from_toml(&source)?;
    Ok(GraphCluster::build(&spec, &standard_registry())?)
}

fn validate_cluster(file: &Path) -> Result<()> {
    println!("Validating cluster: {}", file.display());

    let cluster = load_cluster(file)?;
    tracing::debug!("Cluster has {} graphs", cluster.graphs().len());

    println!("Cluster is valid:");
    for graph in cluster.graphs() {
        let entries: Vec<&str> = graph.entry_vertices().map(|v| v.id()).collect();
        println!(
            "   Graph {}: {} vertices, entry {:?}",
            graph.name(),
            graph.len(),
            entries
        );
    }
    Ok(())
}

fn parse_params(params: Option<String>) -> Result<HashMap<String, Value>> {
    let Some(params) = params else {
        return Ok(HashMap::new());
    };
    match serde_json::from_str::<serde_json::Value>(&params)? {
        serde_json::Value::Object(obj) => Ok(obj
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect()),
        _ => bail!("Params must be a JSON object"),
    }
}

async fn run_graph(
    file: &Path,
    cluster: &str,
    graph: &str,
    timeout_ms: u64,
    params: Option<String>,
    config: RuntimeConfig,
) -> Result<()> {
    let params = parse_params(params)?;
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let manager = GraphManager::with_config(config);
    dagnodes::register_all(manager.registry());
    manager.build(cluster, &source).await?;
    tracing::info!("Built cluster {} from {}", cluster, file.display());

    let (tx, rx) = oneshot::channel();
    manager
        .execute_with_context(
            RunContext::with_params(params, None),
            cluster,
            graph,
            timeout_ms,
            move |report| {
                let _ = tx.send(report);
            },
        )
        .await?;
    let report = rx.await.context("run finished without a report")?;
    tracing::info!(
        "Run {} of graph {} finished in {:?}",
        report.run_id,
        report.graph,
        report.elapsed
    );
    manager.stop().await;

    println!();
    println!("Execution Summary:");
    println!("   Run ID: {}", report.run_id);
    println!("   Graph: {} ({})", report.graph, report.cluster);
    println!("   Elapsed: {:?}", report.elapsed);
    if report.timed_out {
        println!("   Deadline of {}ms passed", timeout_ms);
    }
    println!();
    let results: BTreeMap<_, _> = report.results.iter().collect();
    for (vertex, result) in results {
        println!("   {}: {}", vertex, result);
    }

    if report.timed_out {
        bail!("graph {} timed out", graph);
    }
    Ok(())
}

fn list_operators() {
    println!("Available Operators:");
    println!();

    let registry = standard_registry();
    for name in registry.list_operators() {
        if let Some(metadata) = registry.metadata(&name) {
            println!("  • {} ({})", name, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", name);
        }
    }
}
