//! Address Pool
//!
//! Tracks which addresses of the mesh range are handed out. The range is
//! split into reserved (network, broadcast and configured extras), allocated
//! and free. Allocation always returns the lowest free address, so results
//! are reproducible and released addresses are reused before fresh ones.
//!
//! The pool does no I/O; the peer registry owns it and keeps it in step with
//! the durable store.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Allocation state for one CIDR range
#[derive(Debug, Clone)]
pub struct AddressPool {
    /// The configured range
    network: Ipv4Net,
    /// Never handed out
    reserved: BTreeSet<u32>,
    /// Currently assigned to a peer
    allocated: BTreeSet<u32>,
}

impl AddressPool {
    /// Create a pool over `network`; network and broadcast are always reserved
    pub fn new(network: Ipv4Net, extra_reserved: &[Ipv4Addr]) -> Result<Self> {
        let network = network.trunc();
        let mut reserved = BTreeSet::new();
        reserved.insert(u32::from(network.network()));
        reserved.insert(u32::from(network.broadcast()));

        for addr in extra_reserved {
            if !network.contains(addr) {
                return Err(Error::Config(format!(
                    "reserved address {} is outside {}",
                    addr, network
                )));
            }
            reserved.insert(u32::from(*addr));
        }

        Ok(Self {
            network,
            reserved,
            allocated: BTreeSet::new(),
        })
    }

    /// Hand out the lowest free address
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let start = u32::from(self.network.network());
        let end = u32::from(self.network.broadcast());

        let free = (start..=end)
            .find(|n| !self.reserved.contains(n) && !self.allocated.contains(n))
            .ok_or_else(|| Error::PoolExhausted {
                cidr: self.network.to_string(),
            })?;

        self.allocated.insert(free);
        Ok(Ipv4Addr::from(free))
    }

    /// Return an address to the free set; unknown addresses are ignored
    pub fn release(&mut self, addr: Ipv4Addr) -> bool {
        self.allocated.remove(&u32::from(addr))
    }

    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        self.allocated.contains(&u32::from(addr))
    }

    /// Record an address that is already in use (recovery from the store)
    pub fn mark_allocated(&mut self, addr: Ipv4Addr) -> Result<()> {
        if !self.network.contains(&addr) {
            return Err(Error::Recovery(format!(
                "address {} is outside pool {}",
                addr, self.network
            )));
        }
        if self.is_reserved(addr) {
            return Err(Error::Recovery(format!(
                "address {} is reserved in pool {}",
                addr, self.network
            )));
        }
        if !self.allocated.insert(u32::from(addr)) {
            return Err(Error::Recovery(format!(
                "address {} is assigned more than once",
                addr
            )));
        }
        Ok(())
    }

    pub fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        self.reserved.contains(&u32::from(addr))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }

    /// Addresses that can ever be allocated
    pub fn capacity(&self) -> usize {
        let total = 1u64 << (32 - u32::from(self.network.prefix_len()));
        (total as usize).saturating_sub(self.reserved.len())
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.allocated.len()
    }

    /// Allocated addresses in ascending order
    pub fn allocated(&self) -> Vec<Ipv4Addr> {
        self.allocated.iter().map(|n| Ipv4Addr::from(*n)).collect()
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.network.prefix_len()
    }

    /// An allocated address with the pool prefix (e.g. 10.0.0.2/24)
    pub fn with_prefix(&self, addr: Ipv4Addr) -> Ipv4Net {
        // prefix_len comes from a valid Ipv4Net, so this cannot fail
        Ipv4Net::new(addr, self.network.prefix_len()).unwrap_or(self.network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_24() -> AddressPool {
        AddressPool::new("10.0.0.0/24".parse().unwrap(), &[Ipv4Addr::new(10, 0, 0, 1)]).unwrap()
    }

    #[test]
    fn test_allocates_lowest_free_in_order() {
        let mut pool = pool_24();
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(pool.allocated_count(), 3);
    }

    #[test]
    fn test_released_address_is_reused_first() {
        let mut pool = pool_24();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let _c = pool.allocate().unwrap();

        assert!(pool.release(a));
        assert!(!pool.is_allocated(a));
        assert_eq!(pool.allocate().unwrap(), a);

        assert!(pool.release(b));
        assert!(!pool.release(b));
        assert_eq!(pool.allocate().unwrap(), b);
    }

    #[test]
    fn test_exhaustion() {
        // /29: 8 addresses, minus network, broadcast and .1 = 5 usable
        let mut pool =
            AddressPool::new("10.9.0.0/29".parse().unwrap(), &[Ipv4Addr::new(10, 9, 0, 1)]).unwrap();
        assert_eq!(pool.capacity(), 5);

        let got: Vec<_> = (0..5).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(got.first(), Some(&Ipv4Addr::new(10, 9, 0, 2)));
        assert_eq!(got.last(), Some(&Ipv4Addr::new(10, 9, 0, 6)));

        assert!(matches!(pool.allocate(), Err(Error::PoolExhausted { .. })));
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.allocated_count(), 5);
    }

    #[test]
    fn test_reserved_never_allocated() {
        let mut pool = pool_24();
        let all: Vec<_> = std::iter::from_fn(|| pool.allocate().ok()).collect();
        assert_eq!(all.len(), 253);
        assert!(!all.contains(&Ipv4Addr::new(10, 0, 0, 0)));
        assert!(!all.contains(&Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!all.contains(&Ipv4Addr::new(10, 0, 0, 255)));
    }

    #[test]
    fn test_mark_allocated_rebuilds_state() {
        let mut pool = pool_24();
        pool.mark_allocated(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        pool.mark_allocated(Ipv4Addr::new(10, 0, 0, 4)).unwrap();

        assert_eq!(
            pool.allocated(),
            vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 4)]
        );
        // The gap is filled first
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(pool.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn test_mark_allocated_rejects_bad_addresses() {
        let mut pool = pool_24();
        assert!(matches!(
            pool.mark_allocated(Ipv4Addr::new(10, 0, 1, 2)),
            Err(Error::Recovery(_))
        ));
        assert!(matches!(
            pool.mark_allocated(Ipv4Addr::new(10, 0, 0, 1)),
            Err(Error::Recovery(_))
        ));
        pool.mark_allocated(Ipv4Addr::new(10, 0, 0, 9)).unwrap();
        assert!(matches!(
            pool.mark_allocated(Ipv4Addr::new(10, 0, 0, 9)),
            Err(Error::Recovery(_))
        ));
    }

    #[test]
    fn test_partition_invariant() {
        let mut pool = pool_24();
        for _ in 0..10 {
            pool.allocate().unwrap();
        }
        pool.release(Ipv4Addr::new(10, 0, 0, 5));

        let total = 256;
        let reserved = (0..=255u8)
            .filter(|n| pool.is_reserved(Ipv4Addr::new(10, 0, 0, *n)))
            .count();
        assert_eq!(reserved + pool.allocated_count() + pool.free_count(), total);
        assert!(pool
            .allocated()
            .iter()
            .all(|a| pool.contains(*a) && !pool.is_reserved(*a)));
    }

    #[test]
    fn test_with_prefix() {
        let pool = pool_24();
        assert_eq!(pool.with_prefix(Ipv4Addr::new(10, 0, 0, 2)).to_string(), "10.0.0.2/24");
    }
}
