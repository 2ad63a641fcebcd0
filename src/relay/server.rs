//! Relay server
//!
//! UDP receive loops sharing one socket. Each datagram updates the sender's
//! session from the network-observed source address, then is echoed
//! (announce) or routed to a destination session (forward). Nothing is ever
//! sent back to report a problem; bad datagrams only bump a counter.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::session::SessionTable;
use super::wire::{self, Frame, Reject};
use crate::config::RelayConfig;
use crate::error::{Error, Result};

/// Relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    pub received: AtomicU64,
    pub announced: AtomicU64,
    pub forwarded: AtomicU64,
    pub echoed: AtomicU64,
    /// Too short, or larger than `max_datagram`
    pub dropped_malformed: AtomicU64,
    pub dropped_unknown_tag: AtomicU64,
    pub dropped_no_route: AtomicU64,
    pub send_errors: AtomicU64,
    pub recv_errors: AtomicU64,
}

impl RelayStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Total datagrams discarded
    pub fn dropped(&self) -> u64 {
        self.dropped_malformed.load(Ordering::Relaxed)
            + self.dropped_unknown_tag.load(Ordering::Relaxed)
            + self.dropped_no_route.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the counters
    pub fn report(&self, sessions: usize, purged: usize) -> RelayReport {
        RelayReport {
            at: Utc::now(),
            received: self.received.load(Ordering::Relaxed),
            announced: self.announced.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            echoed: self.echoed.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_unknown_tag: self.dropped_unknown_tag.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            sessions,
            purged,
        }
    }
}

/// Snapshot sent to the supervisor on every report tick
#[derive(Debug, Clone, Serialize)]
pub struct RelayReport {
    pub at: DateTime<Utc>,
    pub received: u64,
    pub announced: u64,
    pub forwarded: u64,
    pub echoed: u64,
    pub dropped_malformed: u64,
    pub dropped_unknown_tag: u64,
    pub dropped_no_route: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    /// Live sessions after purging
    pub sessions: usize,
    /// Sessions expired on this tick
    pub purged: usize,
}

impl RelayReport {
    pub fn dropped(&self) -> u64 {
        self.dropped_malformed + self.dropped_unknown_tag + self.dropped_no_route
    }
}

/// State shared by all workers
struct Shared {
    socket: UdpSocket,
    sessions: SessionTable,
    stats: RelayStats,
    max_datagram: usize,
}

/// Rendezvous relay
pub struct RelayServer {
    shared: Arc<Shared>,
    workers: usize,
    report_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Bind the relay socket described by `config`
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(&config.bind_address).await.map_err(|e| {
            Error::Network(format!("relay bind {}: {}", config.bind_address, e))
        })?;
        Ok(Self::from_socket(socket, config))
    }

    /// Wrap an already bound socket
    pub fn from_socket(socket: UdpSocket, config: &RelayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                socket,
                sessions: SessionTable::new(config.session_ttl()),
                stats: RelayStats::default(),
                max_datagram: config.max_datagram,
            }),
            workers: config.workers.max(1),
            report_interval: config.report_interval(),
            shutdown,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.shared.sessions
    }

    pub fn stats(&self) -> &RelayStats {
        &self.shared.stats
    }

    /// Run the receive loops (and the reporter, if `reports` is given)
    /// until `stop` is called.
    pub async fn start(&self, reports: Option<mpsc::Sender<RelayReport>>) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(Error::ShuttingDown);
        }
        tracing::info!(
            "Relay listening on {} ({} worker(s), session ttl {})",
            self.local_addr()?,
            self.workers,
            match self.shared.sessions.ttl() {
                Some(ttl) => format!("{}s", ttl.as_secs()),
                None => "none".to_string(),
            }
        );

        let mut handles: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|n| {
                let shared = self.shared.clone();
                let shutdown = self.shutdown.subscribe();
                tokio::spawn(worker(n, shared, shutdown))
            })
            .collect();

        if let Some(tx) = reports {
            let shared = self.shared.clone();
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(reporter(
                shared,
                self.report_interval,
                tx,
                shutdown,
            )));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Relay task failed: {}", e);
            }
        }

        tracing::info!("Relay stopped");
        Ok(())
    }

    /// Stop all loops
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Process one datagram received from `src`
    pub async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        handle_datagram(&self.shared, data, src).await
    }
}

/// Pause after a failed receive
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// One receive loop
async fn worker(n: usize, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    // One spare byte tells an oversized datagram from one that fits exactly
    let mut buf = vec![0u8; shared.max_datagram + 1];
    loop {
        tokio::select! {
            result = shared.socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) if len > shared.max_datagram => {
                        RelayStats::bump(&shared.stats.received);
                        RelayStats::bump(&shared.stats.dropped_malformed);
                        tracing::trace!("Dropped oversized datagram from {}", src);
                    }
                    Ok((len, src)) => handle_datagram(&shared, &buf[..len], src).await,
                    Err(e) => recv_failed(&shared, n, &e).await,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Relay worker {} stopped", n);
}

/// Periodic statistics and session purging
async fn reporter(
    shared: Arc<Shared>,
    interval: Duration,
    tx: mpsc::Sender<RelayReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = shared.sessions.purge_expired().await;
                let report = shared.stats.report(shared.sessions.len().await, purged);
                if tx.send(report).await.is_err() {
                    tracing::debug!("Relay report channel closed");
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Count a receive error and back off so a persistent failure cannot spin
async fn recv_failed(shared: &Shared, worker: usize, error: &std::io::Error) {
    // ICMP errors from earlier sends surface here on some platforms
    RelayStats::bump(&shared.stats.recv_errors);
    tracing::debug!("Relay worker {} recv error: {}", worker, error);
    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
}

async fn handle_datagram(shared: &Shared, data: &[u8], src: SocketAddr) {
    let stats = &shared.stats;
    RelayStats::bump(&stats.received);

    match wire::parse(data) {
        Err(Reject::TooShort) => {
            RelayStats::bump(&stats.dropped_malformed);
            tracing::trace!("Dropped {}-byte datagram from {}", data.len(), src);
        }
        Err(Reject::UnknownTag(tag)) => {
            RelayStats::bump(&stats.dropped_unknown_tag);
            tracing::trace!("Dropped datagram with tag {} from {}", tag, src);
        }
        Ok(Frame::Announce { peer, payload }) => {
            if let Some(previous) = shared.sessions.upsert(peer, src).await {
                tracing::debug!("Peer {} moved {} -> {}", peer, previous, src);
            }
            RelayStats::bump(&stats.announced);
            if !payload.is_empty() {
                match shared.socket.send_to(payload, src).await {
                    Ok(_) => RelayStats::bump(&stats.echoed),
                    Err(e) => {
                        RelayStats::bump(&stats.send_errors);
                        tracing::debug!("Echo to {} failed: {}", src, e);
                    }
                }
            }
        }
        Ok(Frame::Forward {
            src: src_id,
            dst,
            payload,
        }) => {
            if let Some(previous) = shared.sessions.upsert(src_id, src).await {
                tracing::debug!("Peer {} moved {} -> {}", src_id, previous, src);
            }
            if payload.is_empty() {
                RelayStats::bump(&stats.announced);
                return;
            }
            match shared.sessions.lookup(&dst).await {
                Some(endpoint) => match shared.socket.send_to(payload, endpoint).await {
                    Ok(_) => {
                        RelayStats::bump(&stats.forwarded);
                        tracing::trace!("Forwarded {} bytes {} -> {}", payload.len(), src_id, dst);
                    }
                    Err(e) => {
                        RelayStats::bump(&stats.send_errors);
                        tracing::debug!("Forward to {} failed: {}", endpoint, e);
                    }
                },
                None => {
                    RelayStats::bump(&stats.dropped_no_route);
                    tracing::trace!("No session for {}, dropping forward from {}", dst, src_id);
                }
            }
        }
    }
}
