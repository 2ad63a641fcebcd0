//! Tunnel collaborators
//!
//! The secure-tunnel engine, the OS network configurator and the server-side
//! data plane are external programs. This module defines the narrow traits
//! the rest of the crate talks to, and implementations that drive `wg` and
//! `ip`.

pub mod dataplane;
pub mod netconf;
pub mod wg;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::identity::Identity;

pub use dataplane::{run_announcer, DataPlane, WgDataPlane};
pub use netconf::{IpRouteConfigurator, NetworkConfigurator};
pub use wg::WgTunnel;

/// One peer as handed to the tunnel engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPeer {
    pub identity: Identity,
    /// Inner addresses routed to this peer
    pub allowed_ips: Vec<Ipv4Net>,
    /// Outer host:port, if known
    pub endpoint: Option<String>,
    /// Persistent keepalive in seconds (0 = off)
    pub keepalive: u16,
}

/// Full engine configuration for one interface
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub interface: String,
    /// Base64 private key
    pub private_key: String,
    pub listen_port: Option<u16>,
    pub peers: Vec<TunnelPeer>,
}

/// Last completed handshake with one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    pub identity: Identity,
    /// `None` until the first handshake completes
    pub last_handshake: Option<DateTime<Utc>>,
}

/// The external secure-tunnel engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Create the interface if needed and replace its configuration
    async fn configure(&self, config: &TunnelConfig) -> Result<()>;

    /// Handshake ages for every configured peer
    async fn handshakes(&self) -> Result<Vec<PeerHandshake>>;

    /// Remove the interface
    async fn teardown(&self) -> Result<()>;
}

/// Run a command and return its stdout; a non-zero exit is a tunnel error
pub(crate) async fn run_command(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    tracing::debug!("Running {} {}", program, args.join(" "));

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Tunnel(format!("failed to run {}: {}", program, e)))?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes()).await?;
            // Dropping the pipe sends EOF
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::Tunnel(format!(
            "{} {} failed ({}): {}",
            program,
            args.first().copied().unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
