use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use rand::Rng;
use tracing::debug;

use crate::error::{NetError, NetResult};
use crate::messages::NetworkAddress;
use crate::settings::Subnet;

struct HostEntry {
    address: NetworkAddress,
    contacted: bool,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<SocketAddr, HostEntry>,
    // Recency order, least-recently-seen at the front.
    order: VecDeque<SocketAddr>,
}

/// Bounded, authority-deduplicated store of known peer addresses.
/// Capacity 0 disables the pool entirely.
pub struct HostPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl HostPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity as usize,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn store(&self, address: NetworkAddress) {
        if self.capacity == 0 || address.is_unspecified() || address.port == 0 {
            return;
        }
        let authority = address.to_socket_addr();
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(entry) = inner.entries.get_mut(&authority) {
            entry.address.timestamp = address.timestamp;
            entry.address.services |= address.services;
            inner.order.retain(|known| known != &authority);
            inner.order.push_back(authority);
            return;
        }
        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        inner.entries.insert(
            authority,
            HostEntry {
                address,
                contacted: false,
            },
        );
        inner.order.push_back(authority);
    }

    /// Stores a gossiped batch, returning how many authorities were new.
    pub fn store_many(&self, addresses: &[NetworkAddress]) -> usize {
        let before = self.count();
        for address in addresses {
            self.store(*address);
        }
        let after = self.count();
        let inserted = after.saturating_sub(before);
        if inserted > 0 {
            debug!(inserted, total = after, "stored gossiped addresses");
        }
        inserted
    }

    pub fn remove(&self, authority: &SocketAddr) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.remove(authority);
            inner.order.retain(|known| known != authority);
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    /// A random entry that has not been handed out yet, or `NotFound`.
    pub fn fetch_one(&self) -> NetResult<NetworkAddress> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(NetError::NotFound);
        };
        let candidates: Vec<SocketAddr> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.contacted)
            .map(|(authority, _)| *authority)
            .collect();
        if candidates.is_empty() {
            return Err(NetError::NotFound);
        }
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        let Some(entry) = inner.entries.get_mut(&pick) else {
            return Err(NetError::NotFound);
        };
        entry.contacted = true;
        Ok(entry.address)
    }

    /// Returns an authority to the uncontacted set, e.g. after its channel
    /// stopped without misbehaving.
    pub fn release(&self, authority: &SocketAddr) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(entry) = inner.entries.get_mut(authority) {
                entry.contacted = false;
            }
        }
    }

    /// A sample of stored addresses for `getaddr` replies.
    pub fn sample(&self, limit: usize) -> Vec<NetworkAddress> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|authority| inner.entries.get(authority))
            .map(|entry| entry.address)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<NetworkAddress> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .order
            .iter()
            .filter_map(|authority| inner.entries.get(authority))
            .map(|entry| entry.address)
            .collect()
    }

    /// Seeds the pool from a persisted snapshot; returns the number loaded.
    pub fn load(&self, addresses: Vec<NetworkAddress>) -> usize {
        let before = self.count();
        for address in addresses {
            self.store(address);
        }
        self.count().saturating_sub(before)
    }
}

/// Authorities banned for misbehavior plus the configured CIDR blacklist.
pub struct BanList {
    banned: Mutex<HashSet<SocketAddr>>,
    blacklist: Vec<Subnet>,
}

impl BanList {
    pub fn new(blacklist: Vec<Subnet>) -> Self {
        Self {
            banned: Mutex::new(HashSet::new()),
            blacklist,
        }
    }

    pub fn ban(&self, authority: SocketAddr) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(authority);
        }
    }

    pub fn is_banned(&self, authority: &SocketAddr) -> bool {
        self.banned
            .lock()
            .map(|banned| banned.contains(authority))
            .unwrap_or(false)
    }

    pub fn blacklisted(&self, ip: &IpAddr) -> bool {
        self.blacklist.iter().any(|subnet| subnet.contains(ip))
    }

    /// True when a dial or accept for this authority must fail
    /// `AddressBlocked` without touching a socket.
    pub fn blocked(&self, authority: &SocketAddr) -> bool {
        self.is_banned(authority) || self.blacklisted(&authority.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::NODE_NETWORK;

    fn addr(last_octet: u8, port: u16, timestamp: u32) -> NetworkAddress {
        NetworkAddress::from_socket_addr(
            SocketAddr::from(([192, 0, 2, last_octet], port)),
            NODE_NETWORK,
            timestamp,
        )
    }

    #[test]
    fn store_is_idempotent_on_authority() {
        let pool = HostPool::new(10);
        pool.store(addr(1, 5251, 100));
        pool.store(addr(1, 5251, 200));
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.snapshot()[0].timestamp, 200);
    }

    #[test]
    fn capacity_evicts_least_recently_seen() {
        let pool = HostPool::new(2);
        pool.store(addr(1, 5251, 100));
        pool.store(addr(2, 5251, 101));
        // Refresh the first entry so the second becomes the oldest.
        pool.store(addr(1, 5251, 102));
        pool.store(addr(3, 5251, 103));
        assert_eq!(pool.count(), 2);
        let authorities: Vec<SocketAddr> = pool
            .snapshot()
            .iter()
            .map(NetworkAddress::to_socket_addr)
            .collect();
        assert!(authorities.contains(&SocketAddr::from(([192, 0, 2, 1], 5251))));
        assert!(authorities.contains(&SocketAddr::from(([192, 0, 2, 3], 5251))));
    }

    #[test]
    fn zero_capacity_disables_storage() {
        let pool = HostPool::new(0);
        pool.store(addr(1, 5251, 100));
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.fetch_one(), Err(NetError::NotFound));
    }

    #[test]
    fn fetch_one_hands_out_each_entry_once() {
        let pool = HostPool::new(10);
        pool.store(addr(1, 5251, 100));
        pool.store(addr(2, 5251, 100));
        let first = pool.fetch_one().expect("first");
        let second = pool.fetch_one().expect("second");
        assert_ne!(first.to_socket_addr(), second.to_socket_addr());
        assert_eq!(pool.fetch_one(), Err(NetError::NotFound));

        pool.release(&first.to_socket_addr());
        assert_eq!(
            pool.fetch_one().expect("released").to_socket_addr(),
            first.to_socket_addr()
        );
    }

    #[test]
    fn unspecified_addresses_are_ignored() {
        let pool = HostPool::new(10);
        pool.store(NetworkAddress::unspecified());
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn ban_list_blocks_banned_and_blacklisted() {
        let bans = BanList::new(vec!["10.0.0.0/8".parse().unwrap()]);
        let banned: SocketAddr = "192.0.2.9:5251".parse().unwrap();
        assert!(!bans.blocked(&banned));
        bans.ban(banned);
        assert!(bans.blocked(&banned));
        assert!(bans.blocked(&"10.20.30.40:5251".parse().unwrap()));
        assert!(!bans.blocked(&"192.0.2.10:5251".parse().unwrap()));
    }
}
