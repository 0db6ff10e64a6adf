//! Address table of announced peers
//!
//! Fixed number of buckets keyed by `(address, port)`. Colliding keys are
//! chained through nodes kept in a [`Pool`], so freed nodes are recycled.

use std::net::SocketAddrV4;

use tent_core::message::addr_to_wire;
use tent_core::{Handle, Pool};

// ============================================================================
// Constants
// ============================================================================

/// Number of hash buckets
pub const TABLE_SIZE: usize = 1024;

// ============================================================================
// Keys
// ============================================================================

/// Transport address identifying a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub address: u32,
    pub port: u16,
}

impl PeerKey {
    #[cfg(test)]
    pub fn new(address: u32, port: u16) -> Self {
        PeerKey { address, port }
    }

    /// `address << 32 | port`
    pub fn hash(&self) -> u64 {
        ((self.address as u64) << 32) | self.port as u64
    }

    fn bucket(&self) -> usize {
        (self.hash() % TABLE_SIZE as u64) as usize
    }
}

impl From<SocketAddrV4> for PeerKey {
    fn from(addr: SocketAddrV4) -> Self {
        let (address, port) = addr_to_wire(addr);
        PeerKey { address, port }
    }
}

#[derive(Debug)]
struct Node {
    key: PeerKey,
    peer: Handle,
    next: Option<Handle>,
}

// ============================================================================
// Table
// ============================================================================

/// Chained hash table from peer address to registry handle
#[derive(Debug)]
pub struct AddressTable {
    buckets: Vec<Option<Handle>>,
    nodes: Pool<Node>,
}

impl AddressTable {
    pub fn new() -> Self {
        AddressTable {
            buckets: vec![None; TABLE_SIZE],
            nodes: Pool::new(),
        }
    }

    fn find_node(&self, key: &PeerKey) -> Option<&Node> {
        let mut cursor = self.buckets[key.bucket()];
        while let Some(handle) = cursor {
            let node = self.nodes.get(handle)?;
            if node.key == *key {
                return Some(node);
            }
            cursor = node.next;
        }
        None
    }

    pub fn get(&self, key: &PeerKey) -> Option<Handle> {
        self.find_node(key).map(|node| node.peer)
    }

    pub fn contains(&self, key: &PeerKey) -> bool {
        self.find_node(key).is_some()
    }

    /// Add `key`; returns false (and changes nothing) if it is already present
    pub fn insert(&mut self, key: PeerKey, peer: Handle) -> bool {
        if self.contains(&key) {
            return false;
        }

        let bucket = key.bucket();
        let node = self.nodes.insert(Node {
            key,
            peer,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(node);
        true
    }

    /// Unlink `key`, promoting the rest of its chain
    pub fn remove(&mut self, key: &PeerKey) -> Option<Handle> {
        let bucket = key.bucket();
        let mut prev: Option<Handle> = None;
        let mut cursor = self.buckets[bucket];

        while let Some(handle) = cursor {
            let node = self.nodes.get(handle)?;
            let next = node.next;

            if node.key == *key {
                match prev {
                    Some(prev) => {
                        if let Some(prev_node) = self.nodes.get_mut(prev) {
                            prev_node.next = next;
                        }
                    }
                    None => self.buckets[bucket] = next,
                }
                return self.nodes.remove(handle).map(|node| node.peer);
            }

            prev = Some(handle);
            cursor = next;
        }

        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Length of the chain `key` hashes into
    #[cfg(test)]
    pub fn chain_len(&self, key: &PeerKey) -> usize {
        let mut count = 0;
        let mut cursor = self.buckets[key.bucket()];
        while let Some(node) = cursor.and_then(|handle| self.nodes.get(handle)) {
            count += 1;
            cursor = node.next;
        }
        count
    }

    /// Chain nodes ever allocated (live + recycled)
    #[cfg(test)]
    pub fn node_capacity(&self) -> usize {
        self.nodes.capacity()
    }
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peers(n: usize) -> Vec<Handle> {
        let mut pool = Pool::new();
        (0..n).map(|i| pool.insert(i)).collect()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let handles = peers(2);
        let mut table = AddressTable::new();
        let key = PeerKey::new(0xC0A8_0001, 40000);

        assert!(table.insert(key, handles[0]));
        assert!(!table.insert(key, handles[1]));
        assert_eq!(table.len(), 1);
        assert_eq!(table.chain_len(&key), 1);
        // First registration wins
        assert_eq!(table.get(&key), Some(handles[0]));
    }

    #[test]
    fn test_hash_layout() {
        let key = PeerKey::from(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 40000));
        assert_eq!(key.address, 0xCB00_7105);
        assert_eq!(key.hash(), 0xCB00_7105_0000_9C40);
    }

    #[test]
    fn test_colliding_keys_share_a_chain() {
        let handles = peers(3);
        let mut table = AddressTable::new();
        let a = PeerKey::new(0x0A00_0001, 1);
        let b = PeerKey::new(0x0A00_0001, 1 + TABLE_SIZE as u16);
        let c = PeerKey::new(0x0A00_0002, 1 + 2 * TABLE_SIZE as u16);

        table.insert(a, handles[0]);
        table.insert(b, handles[1]);
        table.insert(c, handles[2]);

        assert_eq!(table.chain_len(&a), 3);
        assert_eq!(table.get(&a), Some(handles[0]));
        assert_eq!(table.get(&b), Some(handles[1]));
        assert_eq!(table.get(&c), Some(handles[2]));
    }

    #[test]
    fn test_remove_chain_head_keeps_rest_reachable() {
        let handles = peers(2);
        let mut table = AddressTable::new();
        let first = PeerKey::new(0x0A00_0001, 7);
        let second = PeerKey::new(0x0A00_0001, 7 + TABLE_SIZE as u16);

        table.insert(first, handles[0]);
        table.insert(second, handles[1]);

        // `second` was inserted last, so it heads the chain
        assert_eq!(table.remove(&second), Some(handles[1]));
        assert_eq!(table.get(&first), Some(handles[0]));
        assert!(!table.contains(&second));

        assert_eq!(table.remove(&first), Some(handles[0]));
        assert!(table.is_empty());
        assert_eq!(table.chain_len(&first), 0);
    }

    #[test]
    fn test_remove_middle_of_chain() {
        let handles = peers(3);
        let mut table = AddressTable::new();
        let keys: Vec<_> = (0..3)
            .map(|i| PeerKey::new(0x0A00_0001, 3 + (i * TABLE_SIZE) as u16))
            .collect();
        for (key, handle) in keys.iter().zip(&handles) {
            table.insert(*key, *handle);
        }

        assert_eq!(table.remove(&keys[1]), Some(handles[1]));
        assert_eq!(table.chain_len(&keys[0]), 2);
        assert!(table.contains(&keys[0]));
        assert!(table.contains(&keys[2]));
        assert_eq!(table.remove(&keys[1]), None);
    }

    #[test]
    fn test_nodes_are_recycled() {
        let handles = peers(1);
        let mut table = AddressTable::new();

        for port in 0..10u16 {
            let key = PeerKey::new(0x7F00_0001, port);
            table.insert(key, handles[0]);
            table.remove(&key);
        }
        assert_eq!(table.node_capacity(), 1);
    }
}
