//! sqlmux - MySQL Protocol Proxy
//!
//! Accepts MySQL client connections, authenticates them against the
//! configured users and relays their statements over pooled backend
//! connections.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use sqlmux::api::HttpServer;
use sqlmux::backend::MySqlConnector;
use sqlmux::config::{GlobalConfig, ProxyConfig};
use sqlmux::error::Result;
use sqlmux::proxy::ProxyServer;
use sqlmux::reload::ConfigStore;
use sqlmux::router::ClusterRouter;
use sqlmux::tuning;

/// sqlmux - MySQL Protocol Proxy
#[derive(Parser)]
#[command(name = "sqlmux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sqlmux.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides global.log_level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "sqlmux.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show configuration summary
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the file when it parses; errors surface later
    let global = ProxyConfig::from_file(&cli.config).ok().map(|c| c.global);
    let level = cli
        .log_level
        .clone()
        .or_else(|| global.as_ref().map(|g| g.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let log_file = match &cli.command {
        Commands::Start => global.as_ref().and_then(|g| g.log_filename.clone()),
        _ => None,
    };
    init_logging(&level, log_file.as_deref());

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, force } => run_init(output, force),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            ),
            Err(e) => {
                eprintln!("Cannot open log file {}: {}", path.display(), e);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}

/// Start the proxy
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting sqlmux {}...", env!("CARGO_PKG_VERSION"));

    let store = match ConfigStore::load(&config_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    let snapshot = store.snapshot().await;
    let global: GlobalConfig = snapshot.global.clone();
    tracing::info!(
        clusters = snapshot.clusters.len(),
        users = snapshot.users.len(),
        "Loaded configuration from {}",
        config_path.display()
    );

    let shards = tuning::pool_shard_count();
    let router = Arc::new(ClusterRouter::new(
        Arc::clone(&store),
        Arc::new(MySqlConnector::new()),
        shards,
    ));
    tracing::info!(shards, "Connection pools use one idle shard per CPU core");

    let proxy = Arc::new(ProxyServer::new(Arc::clone(&router), global.max_connections));
    let http_server = HttpServer::new(Arc::clone(&store), Arc::clone(&router), Arc::clone(&proxy));

    let watcher = Arc::clone(&store).spawn_watcher().await;
    let pruner = Arc::clone(&router).spawn_pruner();

    let warm_router = Arc::clone(&router);
    tokio::spawn(async move { warm_router.warm_up().await });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_address = global.manage_address();
    let api_shutdown = shutdown_rx.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start(&api_address, api_shutdown).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let listen_address = global.listen_address();
    tokio::select! {
        result = Arc::clone(&proxy).start(&listen_address, shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!("Proxy error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(handle) = watcher {
        handle.abort();
    }
    pruner.abort();
    let _ = api_handle.await;
    router.close_all().await;

    tracing::info!("sqlmux shutdown complete");
    Ok(())
}

/// Write a starter configuration file
fn run_init(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        eprintln!("{} already exists (use --force to overwrite)", output.display());
        return Err(sqlmux::Error::Config(format!("{} already exists", output.display())));
    }

    std::fs::write(&output, ProxyConfig::sample())?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your clusters and users.");
    println!("Then start with: sqlmux --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ProxyConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Listen:     {}", config.global.listen_address());
            println!("  Management: {}", config.global.manage_address());
            println!("  Clusters:   {}", config.clusters.len());
            println!("  Users:      {}", config.users.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show configuration summary
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = ProxyConfig::from_file(&config_path)?;

    println!("sqlmux Configuration");
    println!("====================");
    println!();
    println!("Listen Address:   {}", config.global.listen_address());
    println!("Management API:   {}", config.global.manage_address());
    println!("Max Connections:  {}", config.global.max_connections);
    println!("Client Timeout:   {} s", config.global.client_timeout);
    println!("Server Timeout:   {} s", config.global.server_timeout);
    println!("Default Charset:  {}", config.global.default_charset);
    println!(
        "Autoload:         {} (every {} s)",
        config.global.conf_autoload, config.global.conf_reload_interval
    );
    println!("Pool Shards:      {}", tuning::pool_shard_count());
    println!();

    let mut clusters: Vec<_> = config.clusters.iter().collect();
    clusters.sort_by(|a, b| a.0.cmp(b.0));
    println!("Clusters:");
    for (name, cluster) in clusters {
        println!("  {}:", name);
        if let Some(master) = &cluster.master {
            println!(
                "    master  {} (db {}, idle pool {})",
                master.addr(),
                master.db_name,
                master.max_connection_pool_size
            );
        }
        for slave in &cluster.slaves {
            println!("    slave   {} (db {})", slave.addr(), slave.db_name);
        }
    }
    println!();

    let mut users: Vec<_> = config.users.values().collect();
    users.sort_by(|a, b| a.username.cmp(&b.username));
    println!("Users:");
    for user in users {
        println!(
            "  {:<16} db {:<16} cluster {}",
            user.username, user.db_name, user.cluster_name
        );
    }

    Ok(())
}
