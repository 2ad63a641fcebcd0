//! Server-side data plane
//!
//! Mirrors registry changes into the server's tunnel interface so accepted
//! peers are reachable without a restart. Failures here are logged and never
//! reach the registration path.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::run_command;
use crate::error::Result;
use crate::identity::Identity;
use crate::registry::PeerEvent;

#[async_trait]
pub trait DataPlane: Send + Sync {
    async fn add_peer(&self, identity: &Identity, address: Ipv4Addr, keepalive: u16) -> Result<()>;
    async fn remove_peer(&self, identity: &Identity) -> Result<()>;
}

/// `wg set` on an existing interface
pub struct WgDataPlane {
    interface: String,
}

impl WgDataPlane {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

#[async_trait]
impl DataPlane for WgDataPlane {
    async fn add_peer(&self, identity: &Identity, address: Ipv4Addr, keepalive: u16) -> Result<()> {
        let key = identity.to_base64();
        let allowed = format!("{}/32", address);
        let keepalive = keepalive.to_string();
        run_command(
            "wg",
            &[
                "set",
                &self.interface,
                "peer",
                &key,
                "allowed-ips",
                &allowed,
                "persistent-keepalive",
                &keepalive,
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove_peer(&self, identity: &Identity) -> Result<()> {
        let key = identity.to_base64();
        run_command("wg", &["set", &self.interface, "peer", &key, "remove"], None).await?;
        Ok(())
    }
}

/// Drain registry events into the data plane until the channel closes
pub async fn run_announcer(
    plane: Arc<dyn DataPlane>,
    keepalive: u16,
    mut events: mpsc::Receiver<PeerEvent>,
) {
    tracing::info!("Data-plane announcer started");
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::Announce { identity, address } => {
                match plane.add_peer(&identity, address, keepalive).await {
                    Ok(()) => tracing::debug!("Data plane: added {} at {}", identity.short(), address),
                    Err(e) => tracing::error!(
                        "Data plane: failed to add {} at {}: {}",
                        identity.short(),
                        address,
                        e
                    ),
                }
            }
            PeerEvent::Remove { identity, address } => {
                match plane.remove_peer(&identity).await {
                    Ok(()) => tracing::debug!("Data plane: removed {} ({})", identity.short(), address),
                    Err(e) => tracing::error!("Data plane: failed to remove {}: {}", identity.short(), e),
                }
            }
        }
    }
    tracing::info!("Data-plane announcer stopped");
}
