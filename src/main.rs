//! WolfMesh - Control plane for a small private mesh network
//!
//! One binary for both ends of the mesh: `server` runs the registration
//! API, the rendezvous relay and the data-plane announcer; `up` runs the
//! client session on a peer.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmesh::api::HttpServer;
use wolfmesh::config::{ClientConfig, LoggingConfig, RelayServerConfig, ServerConfig};
use wolfmesh::error::{Error, Result};
use wolfmesh::identity::{Identity, KeyPair};
use wolfmesh::pool::AddressPool;
use wolfmesh::registry::{PeerEvent, PeerRegistry, PeerStore, EVENT_CHANNEL_CAPACITY};
use wolfmesh::relay::{RelayClient, RelayReport, RelayServer};
use wolfmesh::session::{ControlPlaneClient, Orchestrator, SessionSettings};
use wolfmesh::tunnel::{self, IpRouteConfigurator, WgDataPlane, WgTunnel};

/// WolfMesh - Control plane for a small private mesh network
#[derive(Parser)]
#[command(name = "wolfmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging] level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane: registration API, relay and data-plane announcer
    Server,

    /// Run only the rendezvous relay
    Relay {
        /// Address to listen on (overrides [relay] bind_address)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Join the mesh as a client (config file is a client config)
    Up,

    /// Generate a private key and print it (base64)
    Genkey {
        /// Write the key to this file (mode 0600) instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Read a private key on stdin and print its public key
    Pubkey,

    /// Print the relay node id for a public key
    NodeId {
        /// Public key (base64 or hex); read from stdin if omitted
        key: Option<String>,
    },

    /// Initialize a new server configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmesh.toml")]
        output: PathBuf,

        /// Mesh address range
        #[arg(long, default_value = "10.100.0.0/24")]
        cidr: String,
    },

    /// Initialize a new client configuration file
    InitClient {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmesh-client.toml")]
        output: PathBuf,

        /// Control-plane URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        control_url: String,
    },

    /// Validate configuration file
    Validate {
        /// Treat the file as a client configuration
        #[arg(long)]
        client: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server => {
            let config = ServerConfig::from_file(&cli.config)?;
            init_logging(cli.log_level.as_deref(), &config.logging);
            run_server(config).await
        }
        Commands::Relay { bind } => {
            let mut config = if cli.config.exists() {
                RelayServerConfig::from_file(&cli.config)?
            } else {
                RelayServerConfig::default()
            };
            if let Some(bind) = bind {
                config.relay.bind_address = bind;
            }
            init_logging(cli.log_level.as_deref(), &config.logging);
            run_relay(config).await
        }
        Commands::Up => {
            let config = ClientConfig::from_file(&cli.config)?;
            init_logging(cli.log_level.as_deref(), &config.logging);
            run_up(config).await
        }
        Commands::Genkey { output } => run_genkey(output),
        Commands::Pubkey => run_pubkey(),
        Commands::NodeId { key } => run_node_id(key),
        Commands::Init { output, cidr } => run_init(output, cidr),
        Commands::InitClient {
            output,
            control_url,
        } => run_init_client(output, control_url),
        Commands::Validate { client } => run_validate(cli.config, client),
    }
}

/// Initialize logging. `RUST_LOG` wins over the flag, the flag over the file.
fn init_logging(flag: Option<&str>, config: &LoggingConfig) {
    let level = flag.unwrap_or(&config.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn warn_if_not_root(what: &str) {
    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("Not running as root; {} will likely fail", what);
    }
}

/// Run the control plane
async fn run_server(config: ServerConfig) -> Result<()> {
    tracing::info!("Starting WolfMesh server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Mesh range: {}", config.pool.cidr);
    tracing::info!("Data directory: {:?}", config.data_dir());

    // Data-plane announcer first, so recovered peers are not dropped
    let (events, announcer) = if config.dataplane.enabled {
        warn_if_not_root("data-plane updates");
        let (tx, rx) = mpsc::channel::<PeerEvent>(EVENT_CHANNEL_CAPACITY);
        let plane = Arc::new(WgDataPlane::new(config.dataplane.interface.clone()));
        let handle = tokio::spawn(tunnel::run_announcer(
            plane,
            config.dataplane.keepalive_secs,
            rx,
        ));
        (Some(tx), Some(handle))
    } else {
        tracing::info!("Data plane disabled");
        (None, None)
    };

    let pool = AddressPool::new(config.pool_cidr()?, &config.reserved_addresses()?)?;
    let store = PeerStore::open(&config.store_path())?;
    let (registry, report) = PeerRegistry::recover(store, pool, events)?;
    let registry = Arc::new(registry);
    tracing::info!(
        "Registry ready: {} peers, {} addresses allocated",
        report.peers,
        report.allocated.len()
    );

    let server_peer = config.server_peer()?;
    if let Some((identity, address)) = &server_peer {
        tracing::info!("Server peer {} at {}", identity.short(), address);
    }

    let relay = if config.relay.enabled {
        let relay = Arc::new(RelayServer::bind(&config.relay).await?);
        let handle = spawn_relay(Arc::clone(&relay));
        Some((relay, handle))
    } else {
        tracing::info!("Relay disabled");
        None
    };

    let api = HttpServer::new(config.api.clone(), Arc::clone(&registry), server_peer);
    let api_enabled = config.api.enabled;
    let serve_api = async {
        if api_enabled {
            api.start().await
        } else {
            std::future::pending().await
        }
    };

    tokio::select! {
        result = serve_api => {
            if let Err(e) = &result {
                tracing::error!("API server error: {}", e);
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    if let Some((relay, handle)) = relay {
        relay.stop();
        let _ = handle.await;
    }

    // Dropping the last sender ends the announcer
    drop(api);
    drop(registry);
    if let Some(handle) = announcer {
        if tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            tracing::warn!("Data-plane announcer did not stop in time");
        }
    }

    tracing::info!("WolfMesh server stopped");
    Ok(())
}

/// Run the relay only
async fn run_relay(config: RelayServerConfig) -> Result<()> {
    tracing::info!("Starting WolfMesh relay v{}", env!("CARGO_PKG_VERSION"));

    let relay = Arc::new(RelayServer::bind(&config.relay).await?);
    let handle = spawn_relay(Arc::clone(&relay));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    relay.stop();
    let _ = handle.await;
    Ok(())
}

/// Start the relay with a supervisor that logs its reports
fn spawn_relay(relay: Arc<RelayServer>) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel::<RelayReport>(16);

    tokio::spawn(async move {
        while let Some(report) = rx.recv().await {
            if report.dropped() > 0 {
                tracing::warn!(
                    "Relay: {} received, {} forwarded, {} echoed, {} dropped ({} malformed, {} unknown tag, {} no route), {} sessions",
                    report.received,
                    report.forwarded,
                    report.echoed,
                    report.dropped(),
                    report.dropped_malformed,
                    report.dropped_unknown_tag,
                    report.dropped_no_route,
                    report.sessions
                );
            } else {
                tracing::info!(
                    "Relay: {} received, {} forwarded, {} echoed, {} sessions ({} purged)",
                    report.received,
                    report.forwarded,
                    report.echoed,
                    report.sessions,
                    report.purged
                );
            }
        }
    });

    tokio::spawn(async move {
        if let Err(e) = relay.start(Some(tx)).await {
            tracing::error!("Relay error: {}", e);
        }
    })
}

/// Join the mesh and supervise the tunnel until shutdown or failure
async fn run_up(config: ClientConfig) -> Result<()> {
    tracing::info!("Starting WolfMesh client v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Control plane: {}", config.client.control_url);
    warn_if_not_root("tunnel configuration");

    let keypair = KeyPair::load_or_generate(&config.client.private_key_file)?;
    let identity = keypair.identity();
    tracing::info!("Identity: {} (node id {})", identity, identity.node_id());

    let (stop_tx, stop_rx) = watch::channel(false);
    let announcer = match &config.client.relay_address {
        Some(relay) => {
            let client = Arc::new(RelayClient::connect(relay, identity.node_id()).await?);
            Some(tokio::spawn(
                client.run_announcer(config.relay_announce_interval(), stop_rx),
            ))
        }
        None => None,
    };

    let orchestrator = Orchestrator::new(
        SessionSettings::from_config(&config)?,
        keypair,
        Arc::new(ControlPlaneClient::from_config(&config)?),
        Arc::new(WgTunnel::new(config.client.interface.clone())),
        Arc::new(IpRouteConfigurator),
    );

    let result = orchestrator
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Received shutdown signal");
        })
        .await;

    let _ = stop_tx.send(true);
    if let Some(handle) = announcer {
        let _ = handle.await;
    }

    match &result {
        Ok(()) => tracing::info!("WolfMesh client stopped"),
        Err(e) => tracing::error!("WolfMesh client failed: {}", e),
    }
    result
}

/// Generate a private key
fn run_genkey(output: Option<PathBuf>) -> Result<()> {
    let keypair = KeyPair::generate();
    match output {
        Some(path) => {
            keypair.save(&path)?;
            println!("Private key written to {}", path.display());
            println!("Public key: {}", keypair.identity());
        }
        None => println!("{}", keypair.private_key_base64()),
    }
    Ok(())
}

/// Derive the public key from a private key on stdin
fn run_pubkey() -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let keypair = KeyPair::from_base64(&input)?;
    println!("{}", keypair.identity());
    Ok(())
}

/// Print the relay node id of a public key
fn run_node_id(key: Option<String>) -> Result<()> {
    let key = match key {
        Some(key) => key,
        None => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            input
        }
    };
    let identity = Identity::parse(&key)?;
    println!("{}", identity.node_id());
    Ok(())
}

/// Initialize a server configuration file
fn run_init(output: PathBuf, cidr: String) -> Result<()> {
    let net: ipnet::Ipv4Net = cidr
        .parse()
        .map_err(|e| Error::Config(format!("invalid cidr '{}': {}", cidr, e)))?;
    let first = net
        .hosts()
        .next()
        .ok_or_else(|| Error::Config(format!("{} has no host addresses", net)))?;

    let config_content = format!(r#"# WolfMesh Server Configuration
# Generated configuration file

[server]
data_dir = "/var/lib/wolfmesh"

[pool]
cidr = "{cidr}"
# Addresses never handed to peers (network and broadcast are always reserved)
reserved = ["{first}"]

[api]
enabled = true
bind_address = "0.0.0.0:8080"
request_timeout_secs = 10
cors_enabled = false

[relay]
enabled = true
bind_address = "0.0.0.0:3478"
workers = 1
# 0 = sessions never expire
session_ttl_secs = 120
report_interval_secs = 60
max_datagram = 2048

[dataplane]
# Install accepted peers on the server's own WireGuard interface
enabled = false
interface = "wg0"
keepalive_secs = 5
# Listed first in every peer list when both are set
# server_public_key = "<output of: wolfmesh pubkey < /etc/wolfmesh/private.key>"
# server_address = "{first}"

[logging]
level = "info"
format = "pretty"
"#, cidr = net, first = first);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the mesh range and data plane.");
    println!("Then start with: wolfmesh --config {} server", output.display());

    Ok(())
}

/// Initialize a client configuration file
fn run_init_client(output: PathBuf, control_url: String) -> Result<()> {
    let config_content = format!(r#"# WolfMesh Client Configuration
# Generated configuration file

[client]
control_url = "{control_url}"
interface = "wg0"
# Created on first start if missing
private_key_file = "/etc/wolfmesh/private.key"
keepalive_secs = 25
# listen_port = 51820

# Required: the server's tunnel identity and endpoint. All mesh traffic is
# routed through it.
server_public_key = "<output of: wolfmesh pubkey < server private key>"
server_endpoint = "vpn.example.com:51820"

request_timeout_secs = 10
register_attempts = 3
retry_backoff_ms = 1000

# Liveness supervision
poll_interval_secs = 5
liveness_timeout_secs = 180
handshake_grace_secs = 30

# Rendezvous relay keepalive
# relay_address = "vpn.example.com:3478"
relay_announce_interval_secs = 25

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nSet server_public_key and server_endpoint before starting.");
    println!("Then start with: wolfmesh --config {} up", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf, client: bool) -> Result<()> {
    if client {
        return match ClientConfig::from_file(&config_path) {
            Ok(config) => {
                println!("✓ Client configuration is valid");
                println!("  Control Plane: {}", config.client.control_url);
                println!("  Interface: {}", config.client.interface);
                println!(
                    "  Server: {} at {}",
                    config.client.server_public_key.as_deref().unwrap_or_default(),
                    config.client.server_endpoint.as_deref().unwrap_or_default()
                );
                println!("  Private Key: {}", config.client.private_key_file.display());
                println!(
                    "  Relay: {}",
                    config.client.relay_address.as_deref().unwrap_or("(none)")
                );
                println!(
                    "  Liveness: {}s timeout, {}s grace",
                    config.client.liveness_timeout_secs, config.client.handshake_grace_secs
                );
                Ok(())
            }
            Err(e) => {
                eprintln!("✗ Configuration error: {}", e);
                Err(e)
            }
        };
    }

    let summary = ServerConfig::from_file(&config_path).and_then(|config| {
        let pool = AddressPool::new(config.pool_cidr()?, &config.reserved_addresses()?)?;
        Ok((config, pool))
    });
    match summary {
        Ok((config, pool)) => {
            println!("✓ Configuration is valid");
            println!("  Mesh Range: {}", pool.network());
            println!("  Assignable Addresses: {}", pool.capacity());
            println!("  Data Directory: {}", config.data_dir().display());
            if config.api.enabled {
                println!("  API: {}", config.api.bind_address);
            }
            if config.relay.enabled {
                println!("  Relay: {}", config.relay.bind_address);
            }
            if config.dataplane.enabled {
                println!("  Data Plane: {}", config.dataplane.interface);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
