//! Peer Registry
//!
//! Durable mapping from peer identity to mesh address. The registry is the
//! only writer of both the peer store and the address pool; every mutation
//! goes through one mutex that spans exactly find-or-allocate-and-persist.
//! Listing peers reads a snapshot that is swapped after each commit and never
//! touches that mutex.

pub mod store;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::Utc;
use ipnet::Ipv4Net;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::pool::AddressPool;

pub use store::{PeerRecord, PeerStore};

/// Capacity of the peer event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Change notifications for the data plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Peer accepted (new, or recovered at startup)
    Announce { identity: Identity, address: Ipv4Addr },
    /// Peer removed by an operator
    Remove { identity: Identity, address: Ipv4Addr },
}

/// Outcome of the startup recovery procedure
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Records loaded from the store
    pub peers: usize,
    /// Pool allocated set after recovery, ascending
    pub allocated: Vec<Ipv4Addr>,
}

/// Result of a registration
#[derive(Debug, Clone)]
pub struct Registration {
    /// Assigned address with the pool prefix
    pub address: Ipv4Net,
    /// False when the identity was already registered
    pub created: bool,
    /// Every other known peer, sorted by address
    pub peers: Vec<PeerRecord>,
}

/// Registry counters
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub cidr: String,
    pub peers: usize,
    pub capacity: usize,
    pub allocated: usize,
    pub free: usize,
}

/// State guarded by the registry lock
struct Inner {
    store: PeerStore,
    pool: AddressPool,
    peers: BTreeMap<Identity, PeerRecord>,
}

impl Inner {
    fn sorted_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.address);
        peers
    }
}

/// The peer registry
pub struct PeerRegistry {
    inner: Mutex<Inner>,
    snapshot: RwLock<Arc<Vec<PeerRecord>>>,
    prefix_len: u8,
    events: Option<mpsc::Sender<PeerEvent>>,
}

impl PeerRegistry {
    /// Startup recovery: rebuild the pool from every persisted record.
    ///
    /// `pool` must be freshly constructed (nothing allocated). Fails if a
    /// record lies outside the pool, on a reserved address, or shares an
    /// address with another record. Every recovered peer is announced on
    /// `events` so the data plane can reinstall it.
    pub fn recover(
        store: PeerStore,
        mut pool: AddressPool,
        events: Option<mpsc::Sender<PeerEvent>>,
    ) -> Result<(Self, RecoveryReport)> {
        if pool.allocated_count() != 0 {
            return Err(Error::Recovery(
                "address pool must be empty before recovery".into(),
            ));
        }

        let records = store.list_all()?;
        let mut peers = BTreeMap::new();
        for record in records {
            pool.mark_allocated(record.address)?;
            debug!("Recovered peer {} at {}", record.identity.short(), record.address);
            peers.insert(record.identity, record);
        }

        let report = RecoveryReport {
            peers: peers.len(),
            allocated: pool.allocated(),
        };
        info!(
            "Recovered {} peers from store ({} of {} addresses free in {})",
            report.peers,
            pool.free_count(),
            pool.capacity(),
            pool.network()
        );

        let inner = Inner {
            store,
            pool,
            peers,
        };
        let snapshot = inner.sorted_peers();
        let registry = Self {
            prefix_len: inner.pool.prefix_len(),
            inner: Mutex::new(inner),
            snapshot: RwLock::new(Arc::new(snapshot.clone())),
            events,
        };

        for record in &snapshot {
            registry.emit(PeerEvent::Announce {
                identity: record.identity,
                address: record.address,
            });
        }

        Ok((registry, report))
    }

    /// Register `identity`, allocating an address on first contact.
    ///
    /// Re-registration returns the recorded address unchanged and only
    /// refreshes `last_seen`. A failure leaves no trace in the pool or store.
    pub async fn register(&self, identity: Identity) -> Result<Registration> {
        let (registration, event) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let now = Utc::now();

            let (record, created) = match inner.peers.get(&identity).cloned() {
                Some(mut existing) => {
                    inner.store.touch(&identity, now)?;
                    existing.last_seen = now;
                    inner.peers.insert(identity, existing.clone());
                    (existing, false)
                }
                None => {
                    let address = inner.pool.allocate()?;
                    let record = PeerRecord::new(identity, address, now);
                    match inner.store.insert_if_absent(&record) {
                        Ok(None) => {}
                        Ok(Some(existing)) => {
                            inner.pool.release(address);
                            return Err(Error::Internal(format!(
                                "peer {} exists in store at {} but not in registry",
                                identity.short(),
                                existing.address
                            )));
                        }
                        Err(e) => {
                            inner.pool.release(address);
                            return Err(e);
                        }
                    }
                    inner.peers.insert(identity, record.clone());
                    (record, true)
                }
            };

            let all = inner.sorted_peers();
            let others: Vec<PeerRecord> = all
                .iter()
                .filter(|p| p.identity != identity)
                .cloned()
                .collect();

            *self.snapshot.write().await = Arc::new(all);

            let event = created.then_some(PeerEvent::Announce {
                identity,
                address: record.address,
            });
            let registration = Registration {
                address: self.with_prefix(record.address),
                created,
                peers: others,
            };
            (registration, event)
        };

        if registration.created {
            info!("Registered new peer {} at {}", identity.short(), registration.address);
        } else {
            debug!("Peer {} re-registered at {}", identity.short(), registration.address);
        }
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(registration)
    }

    /// Consistent list of every peer, sorted by address
    pub async fn peers(&self) -> Arc<Vec<PeerRecord>> {
        self.snapshot.read().await.clone()
    }

    /// Look up one peer in the snapshot
    pub async fn find(&self, identity: &Identity) -> Option<PeerRecord> {
        self.snapshot
            .read()
            .await
            .iter()
            .find(|p| p.identity == *identity)
            .cloned()
    }

    /// Remove a peer and free its address (operator action)
    pub async fn remove(&self, identity: &Identity) -> Result<PeerRecord> {
        let record = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;

            let record = inner
                .peers
                .get(identity)
                .cloned()
                .ok_or_else(|| Error::PeerNotFound(identity.to_base64()))?;

            inner.store.delete(identity)?;
            inner.pool.release(record.address);
            inner.peers.remove(identity);

            let all = inner.sorted_peers();
            *self.snapshot.write().await = Arc::new(all);
            record
        };

        info!("Removed peer {} (freed {})", identity.short(), record.address);
        self.emit(PeerEvent::Remove {
            identity: record.identity,
            address: record.address,
        });
        Ok(record)
    }

    /// Peer and pool counters
    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats {
            cidr: inner.pool.network().to_string(),
            peers: inner.peers.len(),
            capacity: inner.pool.capacity(),
            allocated: inner.pool.allocated_count(),
            free: inner.pool.free_count(),
        }
    }

    /// Pool allocated set, ascending
    pub async fn allocated(&self) -> Vec<Ipv4Addr> {
        self.inner.lock().await.pool.allocated()
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// An address with the pool prefix
    pub fn with_prefix(&self, addr: Ipv4Addr) -> Ipv4Net {
        Ipv4Net::new(addr, self.prefix_len).unwrap_or_else(|_| Ipv4Net::from(addr))
    }

    fn emit(&self, event: PeerEvent) {
        let tx = match &self.events {
            Some(tx) => tx,
            None => return,
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Peer event channel full, dropping {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Peer event channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    fn pool(cidr: &str) -> AddressPool {
        let net: Ipv4Net = cidr.parse().unwrap();
        let first = Ipv4Addr::from(u32::from(net.network()) + 1);
        AddressPool::new(net, &[first]).unwrap()
    }

    fn registry(cidr: &str) -> PeerRegistry {
        let store = PeerStore::open_in_memory().unwrap();
        PeerRegistry::recover(store, pool(cidr), None).unwrap().0
    }

    #[tokio::test]
    async fn test_end_to_end_example() {
        let reg = registry("10.0.0.0/24");

        let r1 = reg.register(id(1)).await.unwrap();
        assert_eq!(r1.address.to_string(), "10.0.0.2/24");
        assert!(r1.created);
        assert!(r1.peers.is_empty());

        let r2 = reg.register(id(2)).await.unwrap();
        assert_eq!(r2.address.to_string(), "10.0.0.3/24");
        assert_eq!(r2.peers.len(), 1);
        assert_eq!(r2.peers[0].identity, id(1));
        assert_eq!(r2.peers[0].address, Ipv4Addr::new(10, 0, 0, 2));

        let again = reg.register(id(1)).await.unwrap();
        assert_eq!(again.address.to_string(), "10.0.0.2/24");
        assert!(!again.created);
        assert_eq!(again.peers.len(), 1);
        assert_eq!(again.peers[0].identity, id(2));
        assert_eq!(again.peers[0].address, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[tokio::test]
    async fn test_concurrent_distinct_identities_unique() {
        let reg = Arc::new(registry("10.0.0.0/24"));

        let handles: Vec<_> = (1..=60u8)
            .map(|n| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.register(id(n)).await.unwrap().address.addr() })
            })
            .collect();

        let mut addrs = Vec::new();
        for h in handles {
            addrs.push(h.await.unwrap());
        }
        let total = addrs.len();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), total);
        assert_eq!(reg.peers().await.len(), 60);
        assert_eq!(reg.stats().await.allocated, 60);
    }

    #[tokio::test]
    async fn test_concurrent_same_identity_single_record() {
        let reg = Arc::new(registry("10.0.0.0/24"));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.register(id(7)).await.unwrap() })
            })
            .collect();

        let mut created = 0;
        let mut addrs = Vec::new();
        for h in handles {
            let r = h.await.unwrap();
            if r.created {
                created += 1;
            }
            addrs.push(r.address);
        }
        assert_eq!(created, 1);
        assert!(addrs.iter().all(|a| *a == addrs[0]));
        assert_eq!(reg.peers().await.len(), 1);
        assert_eq!(reg.stats().await.allocated, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_leaves_no_record() {
        // /29 with .1 reserved: 5 usable addresses
        let reg = registry("10.9.0.0/29");
        for n in 1..=5u8 {
            reg.register(id(n)).await.unwrap();
        }

        let err = reg.register(id(6)).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert!(err.is_retryable());
        assert!(reg.find(&id(6)).await.is_none());
        assert_eq!(reg.peers().await.len(), 5);

        // Known peers still re-register fine when the pool is full
        assert_eq!(reg.register(id(3)).await.unwrap().address.addr(), Ipv4Addr::new(10, 9, 0, 4));
    }

    #[tokio::test]
    async fn test_restart_consistency() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peers.db");

        let first_run: Vec<Ipv4Addr> = {
            let store = PeerStore::open(&path).unwrap();
            let (reg, _) = PeerRegistry::recover(store, pool("10.0.0.0/24"), None).unwrap();
            let mut addrs = Vec::new();
            for n in 1..=4u8 {
                addrs.push(reg.register(id(n)).await.unwrap().address.addr());
            }
            // Free a slot in the middle so the rebuild has a gap
            reg.remove(&id(2)).await.unwrap();
            addrs.remove(1);
            addrs
        };

        let (tx, mut rx) = mpsc::channel(16);
        let store = PeerStore::open(&path).unwrap();
        let (reg, report) = PeerRegistry::recover(store, pool("10.0.0.0/24"), Some(tx)).unwrap();

        assert_eq!(report.peers, 3);
        assert_eq!(report.allocated, first_run);
        assert_eq!(reg.allocated().await, first_run);

        // Every recovered peer is re-announced
        let mut announced = Vec::new();
        while let Ok(PeerEvent::Announce { address, .. }) = rx.try_recv() {
            announced.push(address);
        }
        assert_eq!(announced, first_run);

        // Same identity, same address after restart
        let again = reg.register(id(4)).await.unwrap();
        assert_eq!(again.address.addr(), first_run[2]);
        assert!(!again.created);

        // A new identity lands outside the recovered set
        let fresh = reg.register(id(9)).await.unwrap().address.addr();
        assert!(!first_run.contains(&fresh));
    }

    #[tokio::test]
    async fn test_recover_rejects_out_of_range_record() {
        let mut store = PeerStore::open_in_memory().unwrap();
        store
            .insert_if_absent(&PeerRecord::new(id(1), Ipv4Addr::new(192, 168, 1, 5), Utc::now()))
            .unwrap();

        let result = PeerRegistry::recover(store, pool("10.0.0.0/24"), None);
        assert!(matches!(result, Err(Error::Recovery(_))));
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_allocation() {
        let mut store = PeerStore::open_in_memory().unwrap();
        // A row the registry does not know about occupies 10.0.0.2 after recovery
        let (reg, _) = PeerRegistry::recover(
            PeerStore::open_in_memory().unwrap(),
            pool("10.0.0.0/24"),
            None,
        )
        .unwrap();
        store
            .insert_if_absent(&PeerRecord::new(id(99), Ipv4Addr::new(10, 0, 0, 2), Utc::now()))
            .unwrap();
        {
            let mut inner = reg.inner.lock().await;
            inner.store = store;
        }

        let err = reg.register(id(1)).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert!(reg.allocated().await.is_empty());
        assert!(reg.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_frees_address_and_emits_event() {
        let (tx, mut rx) = mpsc::channel(16);
        let (reg, _) =
            PeerRegistry::recover(PeerStore::open_in_memory().unwrap(), pool("10.0.0.0/24"), Some(tx))
                .unwrap();

        reg.register(id(1)).await.unwrap();
        reg.register(id(2)).await.unwrap();
        let removed = reg.remove(&id(1)).await.unwrap();
        assert_eq!(removed.address, Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(reg.remove(&id(1)).await, Err(Error::PeerNotFound(_))));

        // Freed address goes to the next newcomer
        assert_eq!(reg.register(id(3)).await.unwrap().address.addr(), Ipv4Addr::new(10, 0, 0, 2));

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![
                PeerEvent::Announce { identity: id(1), address: Ipv4Addr::new(10, 0, 0, 2) },
                PeerEvent::Announce { identity: id(2), address: Ipv4Addr::new(10, 0, 0, 3) },
                PeerEvent::Remove { identity: id(1), address: Ipv4Addr::new(10, 0, 0, 2) },
                PeerEvent::Announce { identity: id(3), address: Ipv4Addr::new(10, 0, 0, 2) },
            ]
        );
    }

    #[tokio::test]
    async fn test_peers_snapshot_sorted_by_address() {
        let reg = registry("10.0.0.0/24");
        for n in [5u8, 3, 9, 1] {
            reg.register(id(n)).await.unwrap();
        }
        reg.remove(&id(3)).await.unwrap();
        reg.register(id(4)).await.unwrap();

        let peers = reg.peers().await;
        let addrs: Vec<_> = peers.iter().map(|p| p.address).collect();
        let mut sorted = addrs.clone();
        sorted.sort();
        assert_eq!(addrs, sorted);
        assert_eq!(peers.len(), 4);
    }
}
