//! Peer registry and peer-list fan-out
//!
//! The registry owns every attached [`Peer`], the address table of peers
//! that have announced themselves, and the pool backing all queued outbound
//! messages. A queued message lives in exactly one peer queue until it is
//! popped for writing or released on disconnect.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use tent_core::message::as_v4;
use tent_core::{Deadline, Handle, Message, PeerConnected, Pool, StreamChannel, MAX_PEERS_PER_FRAME};

use crate::peer::Peer;
use crate::peer_table::{AddressTable, PeerKey};

// ============================================================================
// Registry Structure
// ============================================================================

/// Registry of attached peers
pub struct Registry<S> {
    /// Attached peers in accept order
    peers: Pool<Peer<S>>,
    /// Control addresses of announced peers
    table: AddressTable,
    /// Backing store for queued outbound messages
    messages: Pool<Message>,
}

impl<S: Read + Write> Registry<S> {
    /// Create a new empty registry
    pub fn new() -> Self {
        Registry {
            peers: Pool::new(),
            table: AddressTable::new(),
            messages: Pool::new(),
        }
    }

    /// Attach a freshly accepted connection
    pub fn attach(&mut self, channel: StreamChannel<S>, addr: SocketAddr, deadline: Deadline) -> Handle {
        let handle = self.peers.insert(Peer::new(channel, addr, deadline));
        log::debug!(
            "Attached peer {} as slot {} ({} attached)",
            addr,
            handle.index(),
            self.peers.len()
        );
        handle
    }

    pub fn get(&self, handle: Handle) -> Option<&Peer<S>> {
        self.peers.get(handle)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Peer<S>> {
        self.peers.get_mut(handle)
    }

    /// Handle of the peer stored at a slot index (used for token lookup)
    pub fn handle_at(&self, index: usize) -> Option<Handle> {
        self.peers.handle_at(index)
    }

    /// Snapshot of attached peers in accept order
    pub fn handles(&self) -> Vec<Handle> {
        self.peers.handles()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &Peer<S>)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Number of peers that have announced themselves
    pub fn announced_count(&self) -> usize {
        self.table.len()
    }

    /// Announced peer registered under a control address
    #[cfg(test)]
    pub fn lookup(&self, addr: SocketAddr) -> Option<Handle> {
        self.table.get(&PeerKey::from(as_v4(addr)?))
    }

    pub fn message_pool(&self) -> &Pool<Message> {
        &self.messages
    }

    // ========================================================================
    // Outbound queues
    // ========================================================================

    /// Queue `msg` for `handle`; dropped if the peer is gone
    pub fn enqueue(&mut self, handle: Handle, msg: Message) {
        let Some(peer) = self.peers.get_mut(handle) else {
            return;
        };
        let slot = self.messages.insert(msg);
        peer.outbound.push_back(slot);
    }

    /// Take the next queued message for `handle`
    pub fn pop_outbound(&mut self, handle: Handle) -> Option<Message> {
        let slot = self.peers.get_mut(handle)?.outbound.pop_front()?;
        self.messages.remove(slot)
    }

    #[cfg(test)]
    pub fn queued(&self, handle: Handle) -> usize {
        self.peers
            .get(handle)
            .map(|peer| peer.outbound.len())
            .unwrap_or(0)
    }

    /// Queued messages of `handle`, front first
    #[cfg(test)]
    pub fn queued_messages(&self, handle: Handle) -> Vec<&Message> {
        self.peers
            .get(handle)
            .map(|peer| {
                peer.outbound
                    .iter()
                    .filter_map(|slot| self.messages.get(*slot))
                    .collect()
            })
            .unwrap_or_default()
    }

    // ========================================================================
    // Announce / disconnect
    // ========================================================================

    fn is_registered(&self, handle: Handle, peer: &Peer<S>) -> bool {
        as_v4(peer.addr)
            .map(|addr| self.table.get(&PeerKey::from(addr)) == Some(handle))
            .unwrap_or(false)
    }

    /// Handle a Connect from `from`
    ///
    /// Replies to `from` with every other announced peer (possibly none) and
    /// tells each of those peers about `from`. A long reply is split into
    /// several lists so every frame fits a peer's receive buffer. Returns the number of peers
    /// notified, or `None` when the announce was ignored.
    pub fn announce(&mut self, from: Handle, entry: PeerConnected) -> Option<usize> {
        let peer = self.peers.get_mut(from)?;
        let Some(control) = as_v4(peer.addr) else {
            log::warn!("Ignoring announce over non-IPv4 connection {}", peer.addr);
            return None;
        };

        if let Some(previous) = peer.announced.replace(entry) {
            if previous != entry {
                log::info!("Peer {} re-announced: {} -> {}", peer.addr, previous, entry);
            }
        }
        if self.table.insert(PeerKey::from(control), from) {
            log::info!("Peer {} announced {}", control, entry);
        }

        let others: Vec<(Handle, PeerConnected)> = self
            .peers
            .iter()
            .filter(|(handle, peer)| *handle != from && self.is_registered(*handle, peer))
            .filter_map(|(handle, peer)| peer.announced.map(|announced| (handle, announced)))
            .collect();

        let listed: Vec<PeerConnected> = others.iter().map(|(_, announced)| *announced).collect();
        if listed.is_empty() {
            self.enqueue(from, Message::PeersToConnect(Vec::new()));
        }
        for chunk in listed.chunks(MAX_PEERS_PER_FRAME) {
            self.enqueue(from, Message::PeersToConnect(chunk.to_vec()));
        }
        for (handle, _) in &others {
            self.enqueue(*handle, Message::PeersToConnect(vec![entry]));
        }

        log::debug!(
            "Peer list of {} entries queued for {}, {} peers notified",
            others.len(),
            control,
            others.len()
        );
        Some(others.len())
    }

    /// Detach a peer, releasing its queued messages and table entry
    pub fn remove(&mut self, handle: Handle) -> Option<Peer<S>> {
        let mut peer = self.peers.remove(handle)?;

        for slot in peer.outbound.drain(..) {
            self.messages.remove(slot);
        }

        if let Some(addr) = as_v4(peer.addr) {
            let key = PeerKey::from(addr);
            if self.table.get(&key) == Some(handle) {
                self.table.remove(&key);
            }
        }

        Some(peer)
    }

    /// Peers whose inactivity timer ran out
    pub fn expired(&self, now: Instant) -> Vec<Handle> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.deadline.expired(now))
            .map(|(handle, _)| handle)
            .collect()
    }
}

impl<S: Read + Write> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use tent_core::message::{encoded_len, encode_to_vec};
    use tent_core::{FrameBuffer, RECV_BUFFER_SIZE};

    /// Stream that never has anything to read and swallows writes
    struct NullStream;

    impl Read for NullStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for NullStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn attach(registry: &mut Registry<NullStream>, n: u8) -> Handle {
        let addr = SocketAddr::from(([10, 0, 0, n], 5000 + n as u16));
        registry.attach(
            StreamChannel::new(NullStream),
            addr,
            Deadline::new(Instant::now(), None),
        )
    }

    fn entry(n: u8) -> PeerConnected {
        PeerConnected::new(
            SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, n), 40000 + n as u16),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, n), 6000 + n as u16),
        )
    }

    #[test]
    fn test_first_announce_gets_empty_list() {
        let mut registry = Registry::new();
        let p1 = attach(&mut registry, 1);

        assert_eq!(registry.announce(p1, entry(1)), Some(0));
        assert_eq!(
            registry.queued_messages(p1),
            vec![&Message::PeersToConnect(vec![])]
        );
        assert_eq!(registry.announced_count(), 1);
    }

    #[test]
    fn test_two_peers_learn_about_each_other() {
        let mut registry = Registry::new();
        let p1 = attach(&mut registry, 1);
        let p2 = attach(&mut registry, 2);

        registry.announce(p1, entry(1));
        assert_eq!(registry.announce(p2, entry(2)), Some(1));

        let to_p1 = Message::PeersToConnect(vec![entry(2)]);
        let to_p2 = Message::PeersToConnect(vec![entry(1)]);
        assert!(registry.queued_messages(p1).contains(&&to_p1));
        assert_eq!(registry.queued_messages(p2), vec![&to_p2]);
    }

    #[test]
    fn test_unannounced_peers_are_not_listed() {
        let mut registry = Registry::new();
        let quiet = attach(&mut registry, 1);
        let p2 = attach(&mut registry, 2);

        assert_eq!(registry.announce(p2, entry(2)), Some(0));
        assert_eq!(registry.queued(quiet), 0);
        assert_eq!(
            registry.queued_messages(p2),
            vec![&Message::PeersToConnect(vec![])]
        );
    }

    #[test]
    fn test_list_follows_accept_order() {
        let mut registry = Registry::new();
        let handles: Vec<_> = (1..=3).map(|n| attach(&mut registry, n)).collect();
        let late = attach(&mut registry, 4);

        for (n, handle) in (1..=3).zip(&handles) {
            registry.announce(*handle, entry(n));
        }
        assert_eq!(registry.announce(late, entry(4)), Some(3));
        assert_eq!(
            registry.queued_messages(late),
            vec![&Message::PeersToConnect(vec![entry(1), entry(2), entry(3)])]
        );
    }

    #[test]
    fn test_large_reply_is_split_to_fit_receive_buffer() {
        let mut registry = Registry::new();
        let count: u16 = 900;
        let mut announced = Vec::new();
        let mut last = None;

        for i in 0..count {
            let [hi, lo] = i.to_be_bytes();
            let handle = registry.attach(
                StreamChannel::new(NullStream),
                SocketAddr::from(([10, 1, hi, lo], 5000 + i)),
                Deadline::new(Instant::now(), None),
            );
            let peer = PeerConnected::new(
                SocketAddrV4::new(Ipv4Addr::new(198, 18, hi, lo), 40000),
                SocketAddrV4::new(Ipv4Addr::new(10, 1, hi, lo), 6000),
            );
            registry.announce(handle, peer);
            announced.push(peer);
            last = Some(handle);
        }
        let last = last.unwrap();

        let replies = registry.queued_messages(last);
        assert_eq!(replies.len(), 2);

        let mut listed = Vec::new();
        for reply in replies {
            assert!(encoded_len(reply).unwrap() <= RECV_BUFFER_SIZE);

            // The receiving side decodes each frame in one piece
            let bytes = encode_to_vec(reply).unwrap();
            let mut buffer = FrameBuffer::new(RECV_BUFFER_SIZE);
            buffer.free_tail()[..bytes.len()].copy_from_slice(&bytes);
            buffer.commit(bytes.len());
            match buffer.next_frame() {
                Some(Ok(Message::PeersToConnect(peers))) => listed.extend(peers),
                other => panic!("Expected a peer list, got {:?}", other),
            }
            assert_eq!(buffer.resyncs(), 0);
        }
        assert_eq!(listed, announced[..announced.len() - 1]);
    }

    #[test]
    fn test_repeat_announce_is_idempotent_in_table() {
        let mut registry = Registry::new();
        let p1 = attach(&mut registry, 1);

        registry.announce(p1, entry(1));
        registry.announce(p1, entry(1));
        assert_eq!(registry.announced_count(), 1);
        assert_eq!(registry.queued(p1), 2);
    }

    #[test]
    fn test_pop_outbound_is_fifo() {
        let mut registry = Registry::new();
        let p1 = attach(&mut registry, 1);

        registry.enqueue(p1, Message::KeepAlive);
        registry.enqueue(p1, Message::StunRequest);
        assert_eq!(registry.message_pool().len(), 2);

        assert_eq!(registry.pop_outbound(p1), Some(Message::KeepAlive));
        assert_eq!(registry.pop_outbound(p1), Some(Message::StunRequest));
        assert_eq!(registry.pop_outbound(p1), None);
        assert!(registry.message_pool().is_empty());
    }

    #[test]
    fn test_remove_releases_queue_and_slots() {
        let mut registry = Registry::new();
        let p1 = attach(&mut registry, 1);
        let p2 = attach(&mut registry, 2);
        registry.announce(p1, entry(1));
        registry.announce(p2, entry(2));

        let peer_slots = registry.peers.capacity();
        let message_slots = registry.message_pool().capacity();
        let queued_for_p1 = registry.queued(p1);
        assert!(queued_for_p1 > 0);

        let removed = registry.remove(p1).unwrap();
        assert!(removed.outbound.is_empty());
        assert!(registry.get(p1).is_none());
        assert_eq!(registry.lookup(removed.addr), None);
        assert_eq!(registry.announced_count(), 1);
        assert_eq!(
            registry.message_pool().free_slots(),
            queued_for_p1,
            "queued messages return to the pool"
        );

        // New arrivals reuse the freed slots
        let p3 = attach(&mut registry, 3);
        assert_eq!(p3.index(), p1.index());
        registry.announce(p3, entry(3));
        assert_eq!(registry.peers.capacity(), peer_slots);
        assert_eq!(registry.message_pool().capacity(), message_slots);
    }

    #[test]
    fn test_enqueue_to_removed_peer_is_dropped() {
        let mut registry = Registry::new();
        let p1 = attach(&mut registry, 1);
        registry.remove(p1);

        registry.enqueue(p1, Message::KeepAlive);
        assert!(registry.message_pool().is_empty());
        assert_eq!(registry.pop_outbound(p1), None);
    }

    #[test]
    fn test_expired_peers() {
        let mut registry: Registry<NullStream> = Registry::new();
        let start = Instant::now();
        let timeout = Some(Duration::from_secs(30));

        let idle = registry.attach(
            StreamChannel::new(NullStream),
            "10.0.0.1:5001".parse().unwrap(),
            Deadline::new(start, timeout),
        );
        let busy = registry.attach(
            StreamChannel::new(NullStream),
            "10.0.0.2:5002".parse().unwrap(),
            Deadline::new(start, timeout),
        );
        registry
            .get_mut(busy)
            .unwrap()
            .touch(start + Duration::from_secs(20));

        assert_eq!(registry.expired(start + Duration::from_secs(31)), vec![idle]);
    }
}
