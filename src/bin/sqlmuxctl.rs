//! sqlmuxctl - Command line tool for managing a running sqlmux proxy
//!
//! Usage:
//!   sqlmuxctl status         - Show proxy status
//!   sqlmuxctl pools          - Show backend connection pools
//!   sqlmuxctl clusters       - Show configured clusters
//!   sqlmuxctl reload         - Reload the configuration file
//!   sqlmuxctl ping           - Ping every backend pool
//!   sqlmuxctl check-config   - Validate a configuration file offline

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

use sqlmux::config::ProxyConfig;

/// sqlmux Control Tool
#[derive(Parser)]
#[command(name = "sqlmuxctl")]
#[command(about = "Control and monitor a sqlmux proxy", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/sqlmux/sqlmux.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show proxy status
    Status,
    /// Show backend connection pools
    Pools,
    /// Show configured clusters
    Clusters,
    /// Reload the configuration file on the running proxy
    Reload,
    /// Ping every backend pool
    Ping,
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: i64,
    #[serde(default)]
    config_path: Option<String>,
    config_generation: u64,
    active_sessions: usize,
    max_sessions: usize,
    pools: usize,
    writes_routed: u64,
    reads_routed: u64,
}

#[derive(Debug, Deserialize)]
struct PoolStats {
    address: String,
    #[serde(default)]
    schema: String,
    live: i64,
    idle: usize,
    shards: usize,
    max_idle_per_shard: usize,
}

#[derive(Debug, Deserialize)]
struct ClusterStats {
    name: String,
    master: Option<String>,
    #[serde(default)]
    slaves: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReloadResponse {
    success: bool,
    generation: u64,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PingResult {
    node: String,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:3307";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Determine API endpoint
    let endpoint = match &cli.endpoint {
        Some(e) => e.trim_end_matches('/').to_string(),
        None => match ProxyConfig::from_file(&cli.config) {
            Ok(config) => format!("http://127.0.0.1:{}", config.global.manage_port),
            Err(_) => DEFAULT_ENDPOINT.to_string(),
        },
    };

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Pools => show_pools(&endpoint).await,
        Commands::Clusters => show_clusters(&endpoint).await,
        Commands::Reload => reload(&endpoint).await,
        Commands::Ping => ping(&endpoint).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(url: &str) -> Result<T, Box<dyn std::error::Error>> {
    let response = reqwest::Client::new().get(url).send().await?;
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }
    Ok(response.json().await?)
}

async fn show_status(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let status: StatusResponse = get_json(&format!("{}/status", endpoint)).await?;

    println!();
    println!("Proxy Status");
    println!("============");
    println!();
    println!("Version:      {}", status.version);
    println!("Uptime:       {}", format_duration(status.uptime_seconds));
    println!("Sessions:     {} / {}", status.active_sessions, status.max_sessions);
    println!("Pools:        {}", status.pools);
    println!("Routed:       {} writes, {} reads", status.writes_routed, status.reads_routed);
    println!(
        "Config:       {} (generation {})",
        status.config_path.as_deref().unwrap_or("(none)"),
        status.config_generation
    );
    println!();

    Ok(())
}

async fn show_pools(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let pools: Vec<PoolStats> = get_json(&format!("{}/pools", endpoint)).await?;

    if pools.is_empty() {
        println!("No backend pools yet");
        return Ok(());
    }

    println!();
    println!("{:<24} {:<16} {:>6} {:>6} {:>7} {:>9}", "ADDRESS", "SCHEMA", "LIVE", "IDLE", "SHARDS", "IDLE/SHD");
    println!("{}", "-".repeat(73));
    for pool in pools {
        println!(
            "{:<24} {:<16} {:>6} {:>6} {:>7} {:>9}",
            pool.address, pool.schema, pool.live, pool.idle, pool.shards, pool.max_idle_per_shard
        );
    }
    println!();

    Ok(())
}

async fn show_clusters(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let clusters: Vec<ClusterStats> = get_json(&format!("{}/clusters", endpoint)).await?;

    println!();
    for cluster in clusters {
        println!("{}", cluster.name);
        println!("  master  {}", cluster.master.as_deref().unwrap_or("(none)"));
        for slave in &cluster.slaves {
            println!("  slave   {}", slave);
        }
    }
    println!();

    Ok(())
}

async fn reload(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/admin/reload", endpoint);
    let response = reqwest::Client::new().post(&url).send().await?;
    let status = response.status();
    let body: ReloadResponse = response.json().await?;

    if body.success {
        println!("✓ Configuration reloaded (generation {})", body.generation);
        Ok(())
    } else {
        Err(format!(
            "reload rejected ({}): {}",
            status,
            body.message.unwrap_or_default()
        )
        .into())
    }
}

async fn ping(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/admin/ping", endpoint);
    let response = reqwest::Client::new().post(&url).send().await?;
    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }
    let results: Vec<PingResult> = response.json().await?;

    if results.is_empty() {
        println!("No backend pools yet");
        return Ok(());
    }

    let mut failed = 0;
    for result in &results {
        if result.ok {
            println!("✓ {}", result.node);
        } else {
            failed += 1;
            println!("✗ {}: {}", result.node, result.error.as_deref().unwrap_or("unknown error"));
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} pools failed", failed, results.len()).into());
    }
    Ok(())
}

fn check_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("config file not found: {}", path.display()).into());
    }
    println!("✓ Config file: {}", path.display());

    let config = ProxyConfig::from_file(path)?;
    println!("✓ Configuration is valid");

    let mut warnings = Vec::new();
    for (name, cluster) in &config.clusters {
        if let Some(master) = &cluster.master {
            if master.max_connection_pool_size == 0 {
                warnings.push(format!("cluster {}: idle pooling disabled (max_connection_pool_size = 0)", name));
            }
            if master.password.is_empty() {
                warnings.push(format!("cluster {}: master has an empty password", name));
            }
        }
    }
    for user in config.users.values() {
        if user.password.is_empty() {
            warnings.push(format!("user {}: empty password", user.username));
        }
        if user.db_name.is_empty() {
            warnings.push(format!("user {}: no db_name", user.username));
        }
    }
    if config.global.auth_ips.is_empty() {
        warnings.push("global.auth_ips is empty: management API is open to every host".to_string());
    }

    for warning in &warnings {
        println!("⚠ {}", warning);
    }
    println!();
    println!(
        "{} cluster(s), {} user(s), {} warning(s)",
        config.clusters.len(),
        config.users.len(),
        warnings.len()
    );
    Ok(())
}

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else {
        format!("{}m {}s", minutes, seconds)
    }
}
