//! Relay session table
//!
//! Maps a peer id to the endpoint it was last seen sending from.
//! Last writer wins. Sessions older than the TTL are evicted lazily when
//! looked up, and in bulk by `purge_expired`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::identity::NodeId;

/// Last observed location of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub endpoint: SocketAddr,
    pub last_seen: Instant,
}

impl Session {
    fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match ttl {
            Some(ttl) => now.saturating_duration_since(self.last_seen) > ttl,
            None => false,
        }
    }
}

/// Concurrent session table
pub struct SessionTable {
    sessions: RwLock<HashMap<NodeId, Session>>,
    ttl: Option<Duration>,
}

impl SessionTable {
    /// `ttl` of `None` keeps sessions forever
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Record `endpoint` as the current location of `peer`.
    /// Returns the previous endpoint if it differs.
    pub async fn upsert(&self, peer: NodeId, endpoint: SocketAddr) -> Option<SocketAddr> {
        self.upsert_at(peer, endpoint, Instant::now()).await
    }

    async fn upsert_at(&self, peer: NodeId, endpoint: SocketAddr, now: Instant) -> Option<SocketAddr> {
        let previous = self.sessions.write().await.insert(
            peer,
            Session {
                endpoint,
                last_seen: now,
            },
        );
        previous
            .map(|s| s.endpoint)
            .filter(|prev| *prev != endpoint)
    }

    /// Endpoint of a live session; an expired one is evicted
    pub async fn lookup(&self, peer: &NodeId) -> Option<SocketAddr> {
        self.lookup_at(peer, Instant::now()).await
    }

    async fn lookup_at(&self, peer: &NodeId, now: Instant) -> Option<SocketAddr> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(peer) {
                None => return None,
                Some(s) if !s.is_expired(self.ttl, now) => return Some(s.endpoint),
                Some(_) => {}
            }
        }

        let mut sessions = self.sessions.write().await;
        // Re-check: a fresh upsert may have landed between the two locks
        match sessions.get(peer) {
            Some(s) if !s.is_expired(self.ttl, now) => Some(s.endpoint),
            Some(_) => {
                sessions.remove(peer);
                None
            }
            None => None,
        }
    }

    /// Drop every expired session, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now()).await
    }

    async fn purge_expired_at(&self, now: Instant) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(self.ttl, now));
        before - sessions.len()
    }

    pub async fn get(&self, peer: &NodeId) -> Option<Session> {
        self.sessions.read().await.get(peer).copied()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}
