//! Liveness monitor
//!
//! Polls the tunnel engine for handshake ages and reports which peers have
//! gone stale. The monitor only observes; the orchestrator decides.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::identity::Identity;
use crate::tunnel::{PeerHandshake, TunnelEngine};

/// When a peer counts as stale
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    /// Maximum handshake age
    pub timeout: Duration,
    /// Time allowed for a first handshake after configuration
    pub grace: Duration,
}

impl LivenessPolicy {
    pub fn is_stale(
        &self,
        handshake: &PeerHandshake,
        configured_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let (since, limit) = match handshake.last_handshake {
            Some(at) => (at, self.timeout),
            None => (configured_at, self.grace),
        };
        match (now - since).to_std() {
            Ok(age) => age > limit,
            // In the future: clock skew, treat as fresh
            Err(_) => false,
        }
    }

    /// Judge one sample of handshakes
    pub fn evaluate(
        &self,
        handshakes: &[PeerHandshake],
        configured_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> LivenessReport {
        let stale = handshakes
            .iter()
            .filter(|h| self.is_stale(h, configured_at, now))
            .map(|h| h.identity)
            .collect();
        LivenessReport::Sample {
            at: now,
            total: handshakes.len(),
            stale,
        }
    }
}

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessReport {
    Sample {
        at: DateTime<Utc>,
        total: usize,
        stale: Vec<Identity>,
    },
    /// The engine could not be queried
    QueryFailed { at: DateTime<Utc>, error: String },
}

/// Poll `engine` every `interval`, sending a report each time, until the
/// receiver goes away or shutdown is signalled
pub async fn run_monitor(
    engine: Arc<dyn TunnelEngine>,
    policy: LivenessPolicy,
    interval: Duration,
    configured_at: DateTime<Utc>,
    tx: mpsc::Sender<LivenessReport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = match engine.handshakes().await {
                    Ok(hs) => policy.evaluate(&hs, configured_at, Utc::now()),
                    Err(e) => LivenessReport::QueryFailed {
                        at: Utc::now(),
                        error: e.to_string(),
                    },
                };
                if tx.send(report).await.is_err() {
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
    tracing::debug!("Liveness monitor stopped");
}
