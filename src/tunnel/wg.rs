//! WireGuard engine driven through `ip` and `wg`

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use super::{run_command, PeerHandshake, TunnelConfig, TunnelEngine};
use crate::error::{Error, Result};
use crate::identity::Identity;

/// Kernel WireGuard interface
pub struct WgTunnel {
    interface: String,
}

impl WgTunnel {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    async fn exists(&self) -> bool {
        run_command("ip", &["link", "show", "dev", &self.interface], None)
            .await
            .is_ok()
    }
}

#[async_trait]
impl TunnelEngine for WgTunnel {
    async fn configure(&self, config: &TunnelConfig) -> Result<()> {
        if config.interface != self.interface {
            return Err(Error::Tunnel(format!(
                "config for {} handed to engine for {}",
                config.interface, self.interface
            )));
        }

        if !self.exists().await {
            run_command(
                "ip",
                &["link", "add", "dev", &self.interface, "type", "wireguard"],
                None,
            )
            .await?;
            tracing::info!("Created interface {}", self.interface);
        }

        let text = render_config(config);
        run_command("wg", &["setconf", &self.interface, "/dev/stdin"], Some(&text)).await?;
        tracing::info!(
            "Configured {} with {} peer(s)",
            self.interface,
            config.peers.len()
        );
        Ok(())
    }

    async fn handshakes(&self) -> Result<Vec<PeerHandshake>> {
        let out = run_command("wg", &["show", &self.interface, "latest-handshakes"], None).await?;
        parse_latest_handshakes(&out)
    }

    async fn teardown(&self) -> Result<()> {
        if self.exists().await {
            run_command("ip", &["link", "del", "dev", &self.interface], None).await?;
            tracing::info!("Removed interface {}", self.interface);
        }
        Ok(())
    }
}

/// Render a `wg setconf` configuration
pub fn render_config(config: &TunnelConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", config.private_key);
    if let Some(port) = config.listen_port {
        let _ = writeln!(out, "ListenPort = {}", port);
    }

    for peer in &config.peers {
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", peer.identity);
        let allowed: Vec<String> = peer.allowed_ips.iter().map(|n| n.to_string()).collect();
        let _ = writeln!(out, "AllowedIPs = {}", allowed.join(", "));
        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if peer.keepalive > 0 {
            let _ = writeln!(out, "PersistentKeepalive = {}", peer.keepalive);
        }
    }
    out
}

/// Parse `wg show <iface> latest-handshakes`: `<pub>\t<unix secs>` per line,
/// with 0 meaning no handshake yet
pub fn parse_latest_handshakes(output: &str) -> Result<Vec<PeerHandshake>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut fields = line.split_whitespace();
            let (key, secs) = match (fields.next(), fields.next()) {
                (Some(k), Some(s)) => (k, s),
                _ => return Err(Error::Tunnel(format!("unexpected handshake line '{}'", line))),
            };
            let identity = Identity::parse(key)?;
            let secs: i64 = secs
                .parse()
                .map_err(|e| Error::Tunnel(format!("bad handshake time '{}': {}", secs, e)))?;
            let last_handshake = match secs {
                0 => None,
                s => Utc.timestamp_opt(s, 0).single(),
            };
            Ok(PeerHandshake {
                identity,
                last_handshake,
            })
        })
        .collect()
}
