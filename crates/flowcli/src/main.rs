// crates/flowcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{ExecutionEvent, NodeEvent, NodeId, NodeSettings, NodeState};
use flowruntime::{
    BatchExecutor, BatchStatus, NodeRegistry, RuntimeConfig, WorkflowManager, FORMAT_VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a saved workflow, execute all nodes and wait for them
    Run {
        /// Workflow directory
        #[arg(short, long)]
        file: PathBuf,

        /// Give up after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Save the executed workflow into this directory
        #[arg(short, long)]
        save: Option<PathBuf>,

        /// Number of node bodies running at the same time
        #[arg(short, long)]
        workers: Option<usize>,

        /// Runtime configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Load a workflow and report problems without executing it
    Validate {
        /// Workflow directory
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create an example workflow directory
    Init {
        /// Output directory
        #[arg(short, long, default_value = "example-workflow")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn registry() -> Arc<NodeRegistry> {
    Arc::new(flownodes::standard_registry())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let status = match cli.command {
        Commands::Run {
            file,
            timeout,
            save,
            workers,
            config,
        } => {
            let mut runtime_config = match config {
                Some(path) => RuntimeConfig::from_file(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None => RuntimeConfig::default(),
            };
            if let Some(workers) = workers {
                runtime_config = runtime_config.with_max_parallel_nodes(workers);
            }
            run_workflow(
                &file,
                timeout.map(Duration::from_secs),
                save.as_deref(),
                runtime_config,
            )
            .await
        }

        Commands::Validate { file } => validate_workflow(&file),

        Commands::Nodes => {
            list_nodes();
            BatchStatus::Success
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
            BatchStatus::Success
        }
    };

    if status != BatchStatus::Success {
        std::process::exit(status.code());
    }
    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::NodeStarted {
            node_id,
            node_type,
            iteration,
            ..
        } => match iteration {
            Some(i) => println!("  ⚡ Starting node: {} ({}) pass {}", node_id, node_type, i),
            None => println!("  ⚡ Starting node: {} ({})", node_id, node_type),
        },
        ExecutionEvent::NodeCompleted {
            node_id,
            duration_ms,
            ..
        } => {
            println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            NodeEvent::Progress { fraction, message } => {
                let percent = (fraction * 100.0).round();
                match message {
                    Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                    None => println!("     📊 [{}] {}%", node_id, percent),
                }
            }
        },
        _ => {}
    }
}

async fn run_workflow(
    dir: &Path,
    timeout: Option<Duration>,
    save: Option<&Path>,
    config: RuntimeConfig,
) -> BatchStatus {
    println!("🚀 Loading workflow from: {}", dir.display());

    let grace = config.cancel_poll_interval() * 20;
    let mut executor = BatchExecutor::new(registry(), config);
    let loaded = executor.load_workflow(dir);
    for entry in executor.load_entries() {
        println!("   {}", entry);
    }
    if loaded == BatchStatus::LoadFatal {
        println!("💥 Workflow could not be loaded");
        return executor.status();
    }

    let Some(manager) = executor.manager().cloned() else {
        return executor.status();
    };
    println!("📋 Workflow: {}", manager.name());
    let mut events = manager.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    if let Err(e) = executor.execute_all() {
        tracing::error!("Execution request failed: {}", e);
    }
    let outcome = executor.wait_until_done(timeout).await;
    if let Some(target) = save {
        match executor.save(target) {
            Ok(()) => println!("💾 Saved to {}", target.display()),
            Err(e) => tracing::error!("Saving to {} failed: {}", target.display(), e),
        }
    }
    if !executor.shutdown(grace).await {
        tracing::warn!("Workers did not stop within {:?}", grace);
    }
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    print_tree(&manager, &manager.root_id(), 1);
    for (node, message) in executor.failures() {
        println!("   {}: {}", node, message);
    }
    match outcome {
        BatchStatus::Success => println!("✨ Workflow completed successfully"),
        BatchStatus::Timeout => println!("⏱️  Workflow timed out"),
        _ => println!("💥 Workflow did not execute completely"),
    }
    executor.status()
}

fn print_tree(manager: &WorkflowManager, graph: &NodeId, depth: usize) {
    for id in manager.node_ids(graph) {
        let name = manager.node_name(&id).unwrap_or_default();
        let state = manager.node_state(&id).unwrap_or(NodeState::Idle);
        println!("{}{} {} [{}]", "   ".repeat(depth), id, name, state);
        if let Some(value) = manager.output(&id, 0) {
            println!("{}  -> {:?}", "   ".repeat(depth), value);
        }
        if manager.is_workflow(&id) {
            print_tree(manager, &id, depth + 1);
        }
    }
}

fn validate_workflow(dir: &Path) -> BatchStatus {
    println!("🔍 Validating workflow: {}", dir.display());

    let mut executor = BatchExecutor::new(registry(), RuntimeConfig::default());
    let status = executor.load_workflow(dir);
    for entry in executor.load_entries() {
        println!("   {}", entry);
    }
    if let Some(manager) = executor.manager() {
        println!("✅ Loaded {} (format version {})", manager.name(), FORMAT_VERSION);
        print_tree(manager, &manager.root_id(), 1);
    }
    status
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
    }
}

/// constant -> count loop [map] -> collect -> sum -> debug
fn create_example_workflow(output: &Path) -> Result<()> {
    let manager = WorkflowManager::with_name("Example loop", registry(), RuntimeConfig::default());
    let root = manager.root_id();

    let source = manager.add_named_node(
        &root,
        "source.constant",
        "Start value",
        NodeSettings::new().with("value", 1.0),
    )?;
    let start = manager.add_named_node(
        &root,
        "loop.count_start",
        "Repeat 5 times",
        NodeSettings::new().with("count", 5i64),
    )?;
    let map = manager.add_named_node(
        &root,
        "math.map",
        "Scale",
        NodeSettings::new().with("factor", 10.0).with("offset", 1.0),
    )?;
    let end = manager.add_named_node(&root, "loop.collect_end", "Collect", NodeSettings::new())?;
    let sum = manager.add_named_node(&root, "math.sum", "Total", NodeSettings::new())?;
    let log = manager.add_named_node(&root, "debug.log", "Log total", NodeSettings::new())?;

    manager.add_connection(&source, 0, &start, 0)?;
    manager.add_connection(&start, 1, &map, 0)?;
    manager.add_connection(&map, 0, &end, 0)?;
    manager.add_connection(&end, 0, &sum, 0)?;
    manager.add_connection(&sum, 0, &log, 0)?;

    manager.save(output)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  flow run --file {}", output.display());

    Ok(())
}
