//! Session Orchestrator
//!
//! Client-side state machine:
//!
//! ```text
//! Registering -> Configuring -> Connected <-> Degraded
//!                                   \           /
//!                                    Disconnected (terminal)
//! ```
//!
//! Losing every peer is fatal: the tunnel is torn down and `run` returns
//! `Error::TunnelDead`. Getting back online takes a process restart.

pub mod control;
pub mod liveness;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::identity::{Identity, KeyPair};
use crate::tunnel::{NetworkConfigurator, TunnelConfig, TunnelEngine, TunnelPeer};

pub use control::{ControlPlaneClient, Registrar, Registration};
pub use liveness::{run_monitor, LivenessPolicy, LivenessReport};

/// Where the session is
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Registering,
    Configuring,
    Connected { peers: usize },
    Degraded { stale: usize, peers: usize },
    Disconnected { reason: String },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected { .. })
    }
}

/// Orchestrator settings, usually taken from `ClientConfig`
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub interface: String,
    pub keepalive: u16,
    pub listen_port: Option<u16>,
    /// Hub peer that routes the whole mesh range
    pub server_identity: Identity,
    pub server_endpoint: String,
    pub poll_interval: Duration,
    pub policy: LivenessPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            interface: config.client.interface.clone(),
            keepalive: config.client.keepalive_secs,
            listen_port: config.client.listen_port,
            server_identity: config.server_identity()?,
            server_endpoint: config.server_endpoint()?.to_string(),
            poll_interval: config.poll_interval(),
            policy: LivenessPolicy {
                timeout: config.liveness_timeout(),
                grace: config.handshake_grace(),
            },
        })
    }
}

/// Classify one liveness sample
pub fn classify(total: usize, stale: usize) -> SessionState {
    if total == 0 || stale == 0 {
        SessionState::Connected { peers: total }
    } else if stale < total {
        SessionState::Degraded { stale, peers: total }
    } else {
        SessionState::Disconnected {
            reason: format!("all {} peer(s) stale", total),
        }
    }
}

pub struct Orchestrator {
    settings: SessionSettings,
    keypair: KeyPair,
    registrar: Arc<dyn Registrar>,
    engine: Arc<dyn TunnelEngine>,
    network: Arc<dyn NetworkConfigurator>,
    state: watch::Sender<SessionState>,
}

impl Orchestrator {
    pub fn new(
        settings: SessionSettings,
        keypair: KeyPair,
        registrar: Arc<dyn Registrar>,
        engine: Arc<dyn TunnelEngine>,
        network: Arc<dyn NetworkConfigurator>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Registering);
        Self {
            settings,
            keypair,
            registrar,
            engine,
            network,
            state,
        }
    }

    /// Follow state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn set_state(&self, next: SessionState) {
        let changed = *self.state.borrow() != next;
        if changed {
            match &next {
                SessionState::Degraded { stale, peers } => {
                    tracing::warn!("Session degraded: {}/{} peer(s) stale", stale, peers)
                }
                SessionState::Disconnected { reason } => {
                    tracing::error!("Session disconnected: {}", reason)
                }
                other => tracing::info!("Session state: {:?}", other),
            }
        }
        self.state.send_replace(next);
    }

    /// Tunnel configuration for a registration result.
    ///
    /// Only the server is installed: it carries the whole mesh range and
    /// forwards to every other peer, so the listed peers need no entry (and
    /// an endpoint-less /32 would shadow the mesh route).
    pub fn tunnel_config(&self, registration: &Registration) -> Result<TunnelConfig> {
        let own = self.keypair.identity();
        let server = self.settings.server_identity;
        if server == own {
            return Err(Error::Config(
                "client.server_public_key is this node's own key".into(),
            ));
        }

        for entry in &registration.peers {
            let identity = Identity::parse(&entry.public_key)?;
            if identity != own && identity != server {
                tracing::debug!("Peer {} at {} reachable via server", identity.short(), entry.ip);
            }
        }

        Ok(TunnelConfig {
            interface: self.settings.interface.clone(),
            private_key: self.keypair.private_key_base64(),
            listen_port: self.settings.listen_port,
            peers: vec![TunnelPeer {
                identity: server,
                allowed_ips: vec![registration.mesh()],
                endpoint: Some(self.settings.server_endpoint.clone()),
                keepalive: self.settings.keepalive,
            }],
        })
    }

    /// Register, configure, then supervise until the tunnel dies or
    /// `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let identity = self.keypair.identity();

        self.set_state(SessionState::Registering);
        tracing::info!("Registering {} with control plane", identity);
        let registration = match self.registrar.register(&identity).await {
            Ok(reg) => reg,
            Err(e) => {
                self.set_state(SessionState::Disconnected {
                    reason: format!("registration failed: {}", e),
                });
                return Err(e);
            }
        };
        tracing::info!(
            "Assigned {} with {} peer(s)",
            registration.address,
            registration.peers.len()
        );

        self.set_state(SessionState::Configuring);
        let installed = match self.configure(&registration).await {
            Ok(installed) => installed,
            Err(e) => {
                self.shutdown_tunnel().await;
                self.set_state(SessionState::Disconnected {
                    reason: format!("configuration failed: {}", e),
                });
                return Err(e);
            }
        };
        let configured_at = Utc::now();
        self.set_state(SessionState::Connected { peers: installed });

        let (report_tx, mut reports) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = tokio::spawn(run_monitor(
            self.engine.clone(),
            self.settings.policy,
            self.settings.poll_interval,
            configured_at,
            report_tx,
            stop_rx,
        ));

        tokio::pin!(shutdown);
        let mut last_good = tokio::time::Instant::now();
        let outcome = loop {
            tokio::select! {
                report = reports.recv() => {
                    match report {
                        Some(LivenessReport::Sample { total, stale, .. }) => {
                            last_good = tokio::time::Instant::now();
                            for peer in &stale {
                                tracing::debug!("Peer {} stale", peer.short());
                            }
                            let next = classify(total, stale.len());
                            let dead = next.is_terminal();
                            self.set_state(next);
                            if dead {
                                break Err(Error::TunnelDead(format!(
                                    "all {} peer(s) stale",
                                    total
                                )));
                            }
                        }
                        Some(LivenessReport::QueryFailed { error, .. }) => {
                            tracing::warn!("Handshake query failed: {}", error);
                            if last_good.elapsed() > self.settings.policy.timeout {
                                self.set_state(SessionState::Disconnected {
                                    reason: format!("tunnel engine unreachable: {}", error),
                                });
                                break Err(Error::TunnelDead(error));
                            }
                        }
                        None => {
                            self.set_state(SessionState::Disconnected {
                                reason: "liveness monitor stopped".into(),
                            });
                            break Err(Error::TunnelDead("liveness monitor stopped".into()));
                        }
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutting down session");
                    self.set_state(SessionState::Disconnected {
                        reason: "shutdown".into(),
                    });
                    break Ok(());
                }
            }
        };

        let _ = stop_tx.send(true);
        let _ = monitor.await;
        self.shutdown_tunnel().await;
        outcome
    }

    /// Returns the number of tunnel peers installed
    async fn configure(&self, registration: &Registration) -> Result<usize> {
        let config = self.tunnel_config(registration)?;
        self.engine.configure(&config).await?;
        self.network
            .assign(&self.settings.interface, registration.address, registration.mesh())
            .await?;
        Ok(config.peers.len())
    }

    async fn shutdown_tunnel(&self) {
        if let Err(e) = self.engine.teardown().await {
            tracing::error!("Tunnel teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use async_trait::async_trait;
    use ipnet::Ipv4Net;

    use crate::api::PeerEntry;
    use crate::tunnel::testing::{FakeNetwork, FakeTunnel};
    use crate::tunnel::PeerHandshake;

    struct FakeRegistrar {
        result: std::sync::Mutex<Option<Result<Registration>>>,
    }

    impl FakeRegistrar {
        fn ok(address: &str, peers: Vec<PeerEntry>) -> Arc<Self> {
            Arc::new(Self {
                result: std::sync::Mutex::new(Some(Ok(Registration {
                    address: address.parse().unwrap(),
                    peers,
                }))),
            })
        }

        fn err(e: Error) -> Arc<Self> {
            Arc::new(Self {
                result: std::sync::Mutex::new(Some(Err(e))),
            })
        }
    }

    #[async_trait]
    impl Registrar for FakeRegistrar {
        async fn register(&self, _identity: &Identity) -> Result<Registration> {
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(Error::Internal("registered twice".into())))
        }
    }

    fn id(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    fn entry(n: u8, ip: [u8; 4]) -> PeerEntry {
        PeerEntry {
            public_key: id(n).to_base64(),
            ip: Ipv4Addr::from(ip),
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            interface: "wg9".into(),
            keepalive: 25,
            listen_port: None,
            server_identity: id(1),
            server_endpoint: "vpn.example.com:51820".into(),
            poll_interval: Duration::from_millis(10),
            policy: LivenessPolicy {
                timeout: Duration::from_secs(60),
                grace: Duration::from_secs(60),
            },
        }
    }

    fn fresh(n: u8) -> PeerHandshake {
        PeerHandshake {
            identity: id(n),
            last_handshake: Some(Utc::now()),
        }
    }

    fn stale(n: u8) -> PeerHandshake {
        PeerHandshake {
            identity: id(n),
            last_handshake: Some(Utc::now() - chrono::Duration::hours(1)),
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<SessionState>,
        pred: impl Fn(&SessionState) -> bool,
    ) -> SessionState {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if pred(&*rx.borrow_and_update()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("state not reached")
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0, 0), SessionState::Connected { peers: 0 });
        assert_eq!(classify(3, 0), SessionState::Connected { peers: 3 });
        assert_eq!(classify(3, 1), SessionState::Degraded { stale: 1, peers: 3 });
        assert!(classify(3, 3).is_terminal());
    }

    #[test]
    fn test_tunnel_config_routes_mesh_via_server() {
        let orch = Orchestrator::new(
            settings(),
            KeyPair::generate(),
            FakeRegistrar::ok("10.0.0.3/24", vec![]),
            Arc::new(FakeTunnel::default()),
            Arc::new(FakeNetwork::default()),
        );
        let reg = Registration {
            address: "10.0.0.3/24".parse().unwrap(),
            peers: vec![entry(1, [10, 0, 0, 1]), entry(2, [10, 0, 0, 2]), entry(4, [10, 0, 0, 4])],
        };

        let config = orch.tunnel_config(&reg).unwrap();
        assert_eq!(config.interface, "wg9");
        assert_eq!(config.peers.len(), 1);
        let hub = &config.peers[0];
        assert_eq!(hub.identity, id(1));
        assert_eq!(hub.allowed_ips, vec!["10.0.0.0/24".parse::<Ipv4Net>().unwrap()]);
        assert_eq!(hub.endpoint.as_deref(), Some("vpn.example.com:51820"));
        assert_eq!(hub.keepalive, 25);

        // Every installed peer is reachable, and nothing narrower shadows the mesh route
        assert!(config.peers.iter().all(|p| p.endpoint.is_some()));
        assert!(config
            .peers
            .iter()
            .flat_map(|p| p.allowed_ips.iter())
            .all(|net| net.prefix_len() == 24));
    }

    #[test]
    fn test_tunnel_config_installs_server_even_when_unlisted() {
        let orch = Orchestrator::new(
            settings(),
            KeyPair::generate(),
            FakeRegistrar::ok("10.0.0.2/24", vec![]),
            Arc::new(FakeTunnel::default()),
            Arc::new(FakeNetwork::default()),
        );
        let reg = Registration {
            address: "10.0.0.2/24".parse().unwrap(),
            peers: vec![],
        };

        let config = orch.tunnel_config(&reg).unwrap();
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].identity, id(1));
    }

    #[tokio::test]
    async fn test_degraded_then_dead() {
        let engine = Arc::new(FakeTunnel::default());
        engine.set_handshakes(vec![fresh(1), fresh(2)]);
        let network = Arc::new(FakeNetwork::default());

        let orch = Arc::new(Orchestrator::new(
            settings(),
            KeyPair::generate(),
            FakeRegistrar::ok("10.0.0.3/24", vec![entry(1, [10, 0, 0, 1]), entry(2, [10, 0, 0, 2])]),
            engine.clone(),
            network.clone(),
        ));
        let mut states = orch.subscribe();
        let runner = orch.clone();
        let task = tokio::spawn(async move { runner.run(std::future::pending()).await });

        wait_for_state(&mut states, |s| matches!(s, SessionState::Connected { peers: 2 })).await;
        assert_eq!(engine.configured.lock().unwrap().len(), 1);
        assert_eq!(engine.configured.lock().unwrap()[0].peers.len(), 1);
        assert_eq!(
            network.assigned.lock().unwrap()[0],
            (
                "wg9".to_string(),
                "10.0.0.3/24".parse().unwrap(),
                "10.0.0.0/24".parse().unwrap()
            )
        );

        engine.set_handshakes(vec![fresh(1), stale(2)]);
        wait_for_state(&mut states, |s| matches!(s, SessionState::Degraded { stale: 1, peers: 2 })).await;

        // Recovers
        engine.set_handshakes(vec![fresh(1), fresh(2)]);
        wait_for_state(&mut states, |s| matches!(s, SessionState::Connected { .. })).await;

        engine.set_handshakes(vec![stale(1), stale(2)]);
        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::TunnelDead(_))));
        assert!(orch.state().is_terminal());
        assert!(*engine.torn_down.lock().unwrap());
    }

    #[tokio::test]
    async fn test_no_peers_stays_connected_until_shutdown() {
        let engine = Arc::new(FakeTunnel::default());
        let orch = Orchestrator::new(
            settings(),
            KeyPair::generate(),
            FakeRegistrar::ok("10.0.0.2/24", vec![]),
            engine.clone(),
            Arc::new(FakeNetwork::default()),
        );

        let result = orch
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await;
        assert!(result.is_ok());
        assert!(*engine.torn_down.lock().unwrap());
        assert_eq!(
            orch.state(),
            SessionState::Disconnected { reason: "shutdown".into() }
        );
    }

    #[tokio::test]
    async fn test_rejected_registration_never_configures() {
        let engine = Arc::new(FakeTunnel::default());
        let orch = Orchestrator::new(
            settings(),
            KeyPair::generate(),
            FakeRegistrar::err(Error::RegistrationRejected {
                status: 400,
                message: "bad key".into(),
            }),
            engine.clone(),
            Arc::new(FakeNetwork::default()),
        );

        let result = orch.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::RegistrationRejected { status: 400, .. })));
        assert!(engine.configured.lock().unwrap().is_empty());
        assert!(orch.state().is_terminal());
    }

    #[tokio::test]
    async fn test_configure_failure_tears_down() {
        let engine = Arc::new(FakeTunnel {
            fail_configure: true,
            ..FakeTunnel::default()
        });
        let orch = Orchestrator::new(
            settings(),
            KeyPair::generate(),
            FakeRegistrar::ok("10.0.0.2/24", vec![]),
            engine.clone(),
            Arc::new(FakeNetwork::default()),
        );

        let result = orch.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Tunnel(_))));
        assert!(*engine.torn_down.lock().unwrap());
    }
}
