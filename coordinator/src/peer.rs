//! Per-connection state of a peer attached to the coordinator

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use mio::Interest;
use tent_core::{Deadline, Handle, PeerConnected, Readiness, StreamChannel};

// ============================================================================
// Peer Structure
// ============================================================================

/// A peer's control connection
pub struct Peer<S> {
    /// Framed control stream
    pub channel: StreamChannel<S>,
    /// Transport address of the control connection
    pub addr: SocketAddr,
    /// Address pair from the peer's Connect, once announced
    pub announced: Option<PeerConnected>,
    /// Queued messages (handles into the registry's message pool)
    pub outbound: VecDeque<Handle>,
    /// Readiness latched from poll events
    pub readiness: Readiness,
    /// Interest currently registered with the poller
    pub interest: Interest,
    /// Inactivity timer on inbound control traffic
    pub deadline: Deadline,
}

impl<S> Peer<S> {
    pub fn new(channel: StreamChannel<S>, addr: SocketAddr, deadline: Deadline) -> Self {
        Peer {
            channel,
            addr,
            announced: None,
            outbound: VecDeque::new(),
            readiness: Readiness::default(),
            interest: Interest::READABLE,
            deadline,
        }
    }

    /// Record inbound activity
    pub fn touch(&mut self, now: Instant) {
        self.deadline.touch(now);
    }
}

impl<S: std::io::Read + std::io::Write> Peer<S> {
    /// Writable interest is needed while anything is queued or in flight
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty() || self.channel.has_pending_write()
    }
}
