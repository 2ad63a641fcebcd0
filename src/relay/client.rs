//! Relay client
//!
//! Keeps this node's session on the relay fresh and sends or receives
//! payloads through it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::wire::{build_announce, build_forward};
use crate::error::{Error, Result};
use crate::identity::NodeId;

pub struct RelayClient {
    socket: UdpSocket,
    node_id: NodeId,
    relay: SocketAddr,
}

impl RelayClient {
    /// Bind an ephemeral socket and point it at `relay` (host:port)
    pub async fn connect(relay: &str, node_id: NodeId) -> Result<Self> {
        let relay_addr = tokio::net::lookup_host(relay)
            .await
            .map_err(|e| Error::Network(format!("resolve relay {}: {}", relay, e)))?
            .next()
            .ok_or_else(|| Error::Network(format!("relay {} did not resolve", relay)))?;

        let bind: SocketAddr = if relay_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(relay_addr).await?;

        Ok(Self {
            socket,
            node_id,
            relay: relay_addr,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Bare announce; refreshes the session (and any NAT mapping)
    pub async fn announce(&self) -> Result<()> {
        self.socket.send(&build_announce(&self.node_id, &[])).await?;
        Ok(())
    }

    /// Announce carrying a payload, which the relay echoes back
    pub async fn send_envelope(&self, payload: &[u8]) -> Result<()> {
        self.socket.send(&build_announce(&self.node_id, payload)).await?;
        Ok(())
    }

    /// Send `payload` to the peer with relay id `dst`
    pub async fn forward(&self, dst: &NodeId, payload: &[u8]) -> Result<()> {
        self.socket
            .send(&build_forward(&self.node_id, dst, payload))
            .await?;
        Ok(())
    }

    /// Receive one relayed payload
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.socket.recv(buf).await?)
    }

    /// Announce every `interval` until shutdown. Send failures are logged
    /// and retried on the next tick.
    pub async fn run_announcer(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "Announcing {} to relay {} every {}s",
            self.node_id,
            self.relay,
            interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.announce().await {
                        tracing::warn!("Relay announce failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Relay announcer stopped");
    }
}
