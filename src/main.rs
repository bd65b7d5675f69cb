use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use futures::future::BoxFuture;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_agent::{AgentExecutor, AgentOrchestrator};
use weft_core::config::EngineConfig;
use weft_core::descriptor::{ExecutorDescriptor, NodeTypeDescriptor};
use weft_core::error::Result as WeftResult;
use weft_core::event::EventBus;
use weft_core::traits::{CheckpointStore, Executor};
use weft_core::types::{ExecutionOutcome, NodeContext, RunStatus, ValueMap};
use weft_engine::{builtin, GraphModel, NodeExecutionEngine, SqliteCheckpointStore, WorkflowGraph};
use weft_registry::PluginRegistry;
use weft_router::ExecutorRouter;

#[derive(Parser)]
#[command(name = "weft", version, about = "Workflow and agent execution kernel")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file: schema, acyclicity and binding references
    Validate {
        workflow: PathBuf,
        /// Plugin manifest directory (overrides config)
        #[arg(long)]
        plugins: Option<PathBuf>,
    },
    /// Run a workflow and print the run report as JSON
    Run {
        workflow: PathBuf,
        /// Run variables as a JSON object
        #[arg(long)]
        vars: Option<String>,
        /// Decision (JSON) used to resume every suspended review node
        #[arg(long)]
        decision: Option<String>,
        #[arg(long)]
        plugins: Option<PathBuf>,
    },
    /// List registered node types, executors and agents
    Plugins {
        #[arg(long)]
        plugins: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Completes with the node's inputs. Stands in for node types that no
/// plugin binds.
struct EchoExecutor;

const ECHO: &str = "echo";

impl Executor for EchoExecutor {
    fn id(&self) -> &str {
        ECHO
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, WeftResult<ExecutionOutcome>> {
        Box::pin(async move { Ok(ExecutionOutcome::completed(ctx.inputs_value())) })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        EngineConfig::default()
    };

    match cli.command {
        Commands::Validate { workflow, plugins } => {
            let registry = build_registry(&config, plugins.as_deref())?;
            validate(&workflow, &registry)
        }
        Commands::Run {
            workflow,
            vars,
            decision,
            plugins,
        } => {
            let registry = Arc::new(build_registry(&config, plugins.as_deref())?);
            run(config, registry, &workflow, vars, decision).await
        }
        Commands::Plugins { plugins } => {
            let registry = build_registry(&config, plugins.as_deref())?;
            list_plugins(&registry);
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn build_registry(config: &EngineConfig, override_dir: Option<&Path>) -> anyhow::Result<PluginRegistry> {
    let dir = override_dir.map(Path::to_path_buf).or_else(|| config.manifest_dir());
    match dir {
        Some(dir) => Ok(weft_registry::load_registry(&dir)?),
        None => Ok(PluginRegistry::new()),
    }
}

fn read_graph(path: &Path) -> anyhow::Result<WorkflowGraph> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
    Ok(WorkflowGraph::from_json(&content)?)
}

/// Node types in a graph and its subgraphs that neither the engine nor the
/// registry can execute.
fn unbound_types(graph: &WorkflowGraph, registry: &PluginRegistry) -> BTreeSet<String> {
    let mut unbound = BTreeSet::new();
    let mut pending = vec![graph];
    while let Some(g) = pending.pop() {
        for node in &g.nodes {
            if builtin::is_builtin(&node.node_type) {
                continue;
            }
            if registry
                .resolve_binding(&node.node_type, node.executor.as_ref())
                .is_err()
            {
                unbound.insert(node.node_type.clone());
            }
        }
        pending.extend(g.subgraphs.iter());
    }
    unbound
}

fn validate(path: &Path, registry: &PluginRegistry) -> anyhow::Result<()> {
    let graph = read_graph(path)?;
    let unbound = unbound_types(&graph, registry);
    let mut models = vec![GraphModel::new(graph.clone())?];
    for sub in &graph.subgraphs {
        models.push(GraphModel::new(sub.clone())?);
    }
    for model in &models {
        println!(
            "{}: {} nodes, {} edges, entries [{}]",
            model.id(),
            model.nodes().len(),
            model.edge_count(),
            model.entry_nodes().join(", ")
        );
    }
    if !unbound.is_empty() {
        println!(
            "warning: no executor bound for node types: {}",
            unbound.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    println!("ok");
    Ok(())
}

async fn run(
    config: EngineConfig,
    registry: Arc<PluginRegistry>,
    path: &Path,
    vars: Option<String>,
    decision: Option<String>,
) -> anyhow::Result<()> {
    let graph = read_graph(path)?;
    let variables: ValueMap = match vars {
        Some(v) => serde_json::from_str(&v)?,
        None => ValueMap::new(),
    };
    let decision: Option<serde_json::Value> = decision.map(|d| serde_json::from_str(&d)).transpose()?;

    let router = Arc::new(ExecutorRouter::new(config.router.clone()));
    let events = Arc::new(EventBus::default());

    let orchestrator = Arc::new(AgentOrchestrator::new(
        registry.clone(),
        router.clone(),
        events.clone(),
        config.orchestrator.clone(),
    ));
    AgentExecutor::install(&orchestrator).await?;

    let unbound = unbound_types(&graph, &registry);
    if !unbound.is_empty() {
        registry.register_executor(ExecutorDescriptor::inproc(ECHO))?;
        router.register_executor(Arc::new(EchoExecutor)).await?;
        for node_type in unbound {
            warn!(node_type = %node_type, "No executor bound, echoing inputs");
            let mut desc = NodeTypeDescriptor::builtin(&node_type, false);
            desc.default_executor = Some(ECHO.to_string());
            registry.register_node_type(desc)?;
        }
    }

    let mut builder = NodeExecutionEngine::builder()
        .with_config(config.clone())
        .with_registry(registry)
        .with_router(router)
        .with_event_bus(events);
    if let Some(path) = config.checkpoint_path() {
        let store: Arc<dyn CheckpointStore> = Arc::new(SqliteCheckpointStore::open(&path)?);
        builder = builder.with_checkpoint_store(store);
    }
    let engine = builder.build();

    let handle = engine.start(graph, variables)?;
    info!(run_id = %handle.run_id(), "Run started");

    while handle.wait_idle().await == RunStatus::Suspended {
        let parked = handle.suspended();
        match &decision {
            Some(d) => {
                for node in parked {
                    info!(node_id = %node.node_id, "Resuming with supplied decision");
                    handle.resume(node.token, d.clone()).await?;
                }
            }
            None => {
                for node in &parked {
                    eprintln!(
                        "node {} awaiting review: {}",
                        node.node_id,
                        serde_json::to_string(&node.awaiting)?
                    );
                }
                eprintln!("pass --decision to resume suspended nodes; cancelling run");
                handle.cancel();
                break;
            }
        }
    }

    let report = handle.wait().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status != RunStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

fn list_plugins(registry: &PluginRegistry) {
    let snapshot = registry.snapshot();
    println!("Plugins:");
    for plugin in snapshot.plugins() {
        println!("  {} {}", plugin.id, plugin.version);
    }
    println!("Node types:");
    for nt in snapshot.node_types() {
        println!(
            "  {:<24} executor={} checkpointable={}",
            nt.node_type,
            nt.default_executor.as_deref().unwrap_or("-"),
            nt.checkpointable
        );
    }
    println!("Executors:");
    for ex in snapshot.executors() {
        println!("  {:<24} {} {:?} {}", ex.id, ex.executor_type, ex.mode, ex.protocol);
    }
    println!("Agents:");
    for agent in snapshot.agents() {
        println!(
            "  {:<24} type={} capabilities=[{}]",
            agent.agent_id,
            agent.agent_type,
            agent.capabilities.join(", ")
        );
    }
}
