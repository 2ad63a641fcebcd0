//! WolfMeshCtl - Command line tool for a running WolfMesh server
//!
//! Usage:
//!   wolfmeshctl status        - Show pool and peer counters
//!   wolfmeshctl peers         - List registered peers
//!   wolfmeshctl remove <pub>  - Remove a peer and free its address
//!   wolfmeshctl health        - Check that the server answers

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use wolfmesh::api::{ErrorResponse, HealthResponse, PeerEntry, PeersResponse, StatusResponse};
use wolfmesh::config::ApiConfig;
use wolfmesh::error::{Error, Result};
use wolfmesh::identity::Identity;

/// WolfMesh Control Tool
#[derive(Parser)]
#[command(name = "wolfmeshctl")]
#[command(about = "Inspect and manage a WolfMesh server", long_about = None)]
struct Cli {
    /// Path to server config file (used to find the API address)
    #[arg(short, long, default_value = "/etc/wolfmesh/wolfmesh.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pool and peer counters
    Status,
    /// List registered peers
    Peers,
    /// Remove a peer and free its address
    Remove {
        /// Public key (base64 or hex)
        key: String,
    },
    /// Check that the server answers
    Health,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080";

/// API base URL from the server config; wildcard binds become loopback
fn endpoint_from_config(path: &Path) -> String {
    let config = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok());

    match config {
        Some(config) => {
            let addr = config.api.bind_address;
            match addr.strip_prefix("0.0.0.0:") {
                Some(port) => format!("http://127.0.0.1:{}", port),
                None => format!("http://{}", addr),
            }
        }
        None => DEFAULT_ENDPOINT.to_string(),
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = match &cli.endpoint {
        Some(e) => e.trim_end_matches('/').to_string(),
        None => endpoint_from_config(&cli.config),
    };

    let client = reqwest::Client::new();
    let result = match &cli.command {
        Commands::Status => show_status(&client, &endpoint).await,
        Commands::Peers => list_peers(&client, &endpoint).await,
        Commands::Remove { key } => remove_peer(&client, &endpoint, key).await,
        Commands::Health => check_health(&client, &endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

/// Turn a non-2xx response into an error carrying the server's message
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| format!("{} ({})", e.error, e.code))
        .unwrap_or(body);
    Err(Error::Network(format!("API error {}: {}", status, message)))
}

async fn show_status(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = check(client.get(format!("{}/status", endpoint)).send().await?).await?;
    let status: StatusResponse = response.json().await?;

    println!();
    println!("WolfMesh Server Status (wolfmeshctl v{})", env!("CARGO_PKG_VERSION"));
    println!("==========================================");
    println!();
    println!("Mesh Range:     {}", status.cidr);
    println!("Peers:          {}", status.peers);
    println!(
        "Addresses:      {} allocated, {} free of {}",
        status.allocated, status.free, status.capacity
    );
    match &status.server_peer {
        Some(server) => println!("Server Peer:    {} ({})", server.ip, server.public_key),
        None => println!("Server Peer:    (none)"),
    }
    println!("Uptime:         {}", format_uptime(status.uptime_seconds));
    println!();

    Ok(())
}

async fn list_peers(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = check(client.get(format!("{}/peers", endpoint)).send().await?).await?;
    let list: PeersResponse = response.json().await?;

    println!();
    println!("{:<16} {:<46} {:<21}", "ADDRESS", "PUBLIC KEY", "LAST SEEN");
    println!("{}", "-".repeat(83));

    for peer in &list.peers {
        let last_seen = match peer.last_seen {
            Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "server".to_string(),
        };
        println!("{:<16} {:<46} {:<21}", peer.ip, peer.public_key, last_seen);
    }
    println!();
    println!("{} peer(s)", list.peers.len());

    Ok(())
}

async fn remove_peer(client: &reqwest::Client, endpoint: &str, key: &str) -> Result<()> {
    // Hex keeps base64's '/' and '+' out of the path
    let identity = Identity::parse(key)?;
    let url = format!("{}/peers/{}", endpoint, hex::encode(identity.as_bytes()));

    let response = check(client.delete(&url).send().await?).await?;
    let removed: PeerEntry = response.json().await?;
    println!("Removed {} ({})", removed.public_key, removed.ip);

    Ok(())
}

async fn check_health(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = check(client.get(format!("{}/health", endpoint)).send().await?).await?;
    let health: HealthResponse = response.json().await?;

    if health.healthy {
        println!("\x1b[32m✓\x1b[0m {} is healthy ({} peers)", endpoint, health.peers);
        Ok(())
    } else {
        Err(Error::Network(format!("{} reports unhealthy", endpoint)))
    }
}

fn format_uptime(seconds: u64) -> String {
    let (days, rest) = (seconds / 86_400, seconds % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let minutes = rest / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, seconds % 60)
    }
}
