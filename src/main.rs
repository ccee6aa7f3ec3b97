//! GitScale - Replicating Git Smart-HTTP Front End
//!
//! Serves one Git endpoint over HTTP and replicates every push to a fixed
//! set of repository replicas.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gitscale::api::HttpServer;
use gitscale::config::GitScaleConfig;
use gitscale::executor::{GitExecutor, RepositoryExecutor};
use gitscale::replication::{ResyncOutcome, Resyncer};
use gitscale::state::{MarkerStore, ReplicaNode};

/// GitScale - Replicating Git Smart-HTTP Front End
#[derive(Parser)]
#[command(name = "gitscale")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gitscale.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP front end
    Start,

    /// Heal out-of-sync nodes from their recorded peers
    Resync {
        /// Only heal this node (repository path from cluster.nodes)
        #[arg(short, long)]
        node: Option<PathBuf>,
    },

    /// Check that a server is up
    Status {
        /// Server address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Show node health as reported by a running server
    Nodes {
        /// Server address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "gitscale.toml")]
        output: PathBuf,

        /// Repository directories, one per replica node
        #[arg(long, num_args = 1.., default_values = ["/srv/git/node1.git", "/srv/git/node2.git", "/srv/git/node3.git"])]
        nodes: Vec<PathBuf>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(&cli.config, cli.log_level.as_deref())?;
            run_start(config).await
        }
        Commands::Resync { node } => {
            let config = load_config(&cli.config, cli.log_level.as_deref())?;
            run_resync(config, node).await
        }
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_status(address).await
        }
        Commands::Nodes { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_nodes(address).await
        }
        Commands::Init { output, nodes } => run_init(output, nodes),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the configuration, then start logging as it asks
fn load_config(path: &Path, level: Option<&str>) -> anyhow::Result<GitScaleConfig> {
    let config = GitScaleConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    init_logging(level.unwrap_or(&config.logging.level), &config.logging.format);
    Ok(config)
}

fn executor(config: &GitScaleConfig) -> Arc<dyn RepositoryExecutor> {
    Arc::new(GitExecutor::new(&config.executor.git_binary))
}

/// Start the HTTP front end
async fn run_start(config: GitScaleConfig) -> anyhow::Result<()> {
    tracing::info!("Starting GitScale...");
    for node in config.nodes() {
        if !node.path().is_dir() {
            tracing::warn!(node = %node, "Node repository directory does not exist");
        }
    }
    tracing::info!(
        advertise = %config.advertise_node(),
        upload = %config.upload_node(),
        "Serving {} replica nodes",
        config.cluster.nodes.len()
    );

    let server = HttpServer::new(config.clone(), executor(&config));
    server.start().await?;
    Ok(())
}

/// Run a healing pass without a server
async fn run_resync(config: GitScaleConfig, node: Option<PathBuf>) -> anyhow::Result<()> {
    let nodes: Vec<ReplicaNode> = match node {
        Some(path) => {
            let path = std::path::absolute(&path)?;
            if !config.cluster.nodes.contains(&path) {
                anyhow::bail!("{} is not listed in cluster.nodes", path.display());
            }
            vec![ReplicaNode::new(path)]
        }
        None => config.nodes(),
    };

    let resyncer = Resyncer::new(executor(&config), MarkerStore::new(), config.resync_timeout())
        .with_reconcile(config.resync.reconcile);

    let mut failed = 0;
    for report in resyncer.resync_all(&nodes).await {
        match &report.outcome {
            ResyncOutcome::NotNeeded => println!("  {}: in sync", report.node),
            ResyncOutcome::Healed { peer } => println!("✓ {}: healed from {}", report.node, peer),
            ResyncOutcome::AlreadyCurrent { peer } => {
                println!("✓ {}: already matched {}, marker cleared", report.node, peer)
            }
            ResyncOutcome::Failed { stage, error } => {
                failed += 1;
                println!("✗ {}: failed at {}: {}", report.node, stage, error);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} node(s) are still out of sync", failed);
    }
    Ok(())
}

async fn run_status(address: String) -> anyhow::Result<()> {
    let url = format!("http://{}/status", address);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to get status from {}", address))?;

    let status = response.status();
    let body = response.text().await?;
    println!("{} {}", status, body.trim());
    if !status.is_success() {
        anyhow::bail!("server at {} is not healthy", address);
    }
    Ok(())
}

async fn run_nodes(address: String) -> anyhow::Result<()> {
    let url = format!("http://{}/nodes", address);
    let nodes: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to get nodes from {}", address))?
        .error_for_status()?
        .json()
        .await?;

    println!("{}", serde_json::to_string_pretty(&nodes)?);
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, nodes: Vec<PathBuf>) -> anyhow::Result<()> {
    let mut absolute = Vec::with_capacity(nodes.len());
    for node in &nodes {
        absolute.push(
            std::path::absolute(node)
                .with_context(|| format!("Failed to resolve {}", node.display()))?,
        );
    }
    let config_content = render_config(&absolute)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list your replica repositories.");
    println!("Then start with: gitscale start --config {}", output.display());

    Ok(())
}

/// Configuration template listing `nodes`
fn render_config(nodes: &[PathBuf]) -> anyhow::Result<String> {
    let node_list = toml::Value::Array(
        nodes
            .iter()
            .map(|n| toml::Value::String(n.display().to_string()))
            .collect(),
    );

    let config_content = format!(r#"# GitScale Configuration
# Generated configuration file

[server]
bind_address = "0.0.0.0:8080"

[cluster]
# Repository directories, one per replica node
nodes = {node_list}
# advertise_node = "/srv/git/node1.git"   # answers ref advertisements (default: first)
# upload_node = "/srv/git/node1.git"      # serves fetch/clone (default: first)
# resync_node = "/srv/git/node3.git"      # healed before advertising (default: last)

[services]
upload_pack = true
receive_pack = true
env = []
# env = ["GIT_CONFIG_NOSYSTEM=1"]

[executor]
git_binary = "git"

[resync]
timeout_secs = 30
# Requests that heal nodes before being served
triggers = ["advertise", "upload_pack", "receive_pack"]
# Compare refs with the healthy peer before fetching
reconcile = true

[logging]
level = "info"
format = "pretty"
"#);

    // Make sure the generated file is one we accept
    GitScaleConfig::from_str(&config_content)?;
    Ok(config_content)
}

fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match GitScaleConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Bind Address: {}", config.server.bind_address);
            println!("  Nodes: {}", config.cluster.nodes.len());
            for node in config.nodes() {
                println!("    {}", node);
            }
            println!("  Advertise Node: {}", config.advertise_node());
            println!("  Upload Node: {}", config.upload_node());
            println!("  Resync Node: {}", config.resync_node());
            println!("  Resync Triggers: {:?}", config.resync.triggers);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
