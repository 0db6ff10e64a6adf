//! Peer lifecycle state machine
//!
//! Drives discovery of the peer's public address, registration with the
//! coordinator and collection of connect candidates. The session does no
//! I/O itself: outbound messages are queued for the event loop, which feeds
//! received messages and timer expiry back in.
//!
//! ```text
//! UnknownSelf ──StunRequest──► AwaitingStunResponse ──StunResponse──► KnownSelf
//!      ▲                              │ (retry timeout)                   │ Connect
//!      └──────────────────────────────┘                                   ▼
//!          Connected ◄──candidates── HasPeerList ◄──PeersToConnect── AwaitingPeerList
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use tent_core::message::addr_from_wire;
use tent_core::{Deadline, Message, PacketQueue, PeerConnected};

// ============================================================================
// Constants
// ============================================================================

/// Resend interval for an unanswered STUN request
pub const DEFAULT_STUN_RETRY: Duration = Duration::from_millis(200);

/// NAT binding refresh interval once registered
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(5);

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Public address not known; STUN request due
    UnknownSelf,
    /// STUN request sent, waiting for the reply
    AwaitingStunResponse,
    /// Public address known; announce due
    KnownSelf,
    /// Announced, waiting for the first peer list
    AwaitingPeerList,
    /// Peer list received but nobody to connect to yet
    HasPeerList,
    /// At least one connect candidate known
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::UnknownSelf => "UNKNOWN_SELF",
            SessionState::AwaitingStunResponse => "AWAITING_STUN_RESPONSE",
            SessionState::KnownSelf => "KNOWN_SELF",
            SessionState::AwaitingPeerList => "AWAITING_PEER_LIST",
            SessionState::HasPeerList => "HAS_PEER_LIST",
            SessionState::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}

/// Address this peer would punch towards for another peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectCandidate {
    /// The other peer's announced pair
    pub peer: PeerConnected,
    /// Chosen target address
    pub target: SocketAddrV4,
    /// Both peers share a public address (same NAT), so the local pair is used
    pub same_nat: bool,
}

/// Timer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub stun_retry: Duration,
    pub keepalive: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            stun_retry: DEFAULT_STUN_RETRY,
            keepalive: DEFAULT_KEEPALIVE,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug)]
pub struct PeerSession {
    state: SessionState,
    /// Coordinator's packet address (STUN replies must come from here)
    stun_addr: SocketAddr,
    /// Local IP of the control connection + port of the packet socket
    local: SocketAddrV4,
    /// Address the coordinator observed for our packet socket
    public: Option<SocketAddrV4>,
    timer: Deadline,
    timings: Timings,
    /// Every other peer announced to us, in arrival order
    directory: Vec<PeerConnected>,
    candidates: Vec<ConnectCandidate>,
    control_out: VecDeque<Message>,
    packet_out: PacketQueue,
}

impl PeerSession {
    /// New session; the first STUN request is due immediately
    pub fn new(stun_addr: SocketAddr, local: SocketAddrV4, timings: Timings, now: Instant) -> Self {
        PeerSession {
            state: SessionState::UnknownSelf,
            stun_addr,
            local,
            public: None,
            timer: Deadline::new(now, Some(Duration::ZERO)),
            timings,
            directory: Vec::new(),
            candidates: Vec::new(),
            control_out: VecDeque::new(),
            packet_out: PacketQueue::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn public_addr(&self) -> Option<SocketAddrV4> {
        self.public
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn directory(&self) -> &[PeerConnected] {
        &self.directory
    }

    pub fn candidates(&self) -> &[ConnectCandidate] {
        &self.candidates
    }

    /// Time until the state timer fires
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.timer.remaining(now)
    }

    // ========================================================================
    // Outbound queues
    // ========================================================================

    pub fn has_control_out(&self) -> bool {
        !self.control_out.is_empty()
    }

    pub fn pop_control(&mut self) -> Option<Message> {
        self.control_out.pop_front()
    }

    pub fn packet_out(&self) -> &PacketQueue {
        &self.packet_out
    }

    pub fn packet_out_mut(&mut self) -> &mut PacketQueue {
        &mut self.packet_out
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::info!("Session {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn send_stun_request(&mut self, now: Instant) {
        self.packet_out
            .push_back((Message::StunRequest, self.stun_addr));
        self.timer.set(now, Some(self.timings.stun_retry));
        self.transition(SessionState::AwaitingStunResponse);
    }

    fn send_keepalive(&mut self, now: Instant) {
        log::trace!("Refreshing NAT binding towards {}", self.stun_addr);
        self.packet_out.push_back((Message::KeepAlive, self.stun_addr));
        self.timer.set(now, Some(self.timings.keepalive));
    }

    /// Fire the state timer if it is due
    pub fn on_timeout(&mut self, now: Instant) {
        if !self.timer.expired(now) {
            return;
        }

        match self.state {
            SessionState::UnknownSelf => self.send_stun_request(now),
            SessionState::AwaitingStunResponse => {
                log::debug!("No STUN response from {}, retrying", self.stun_addr);
                self.transition(SessionState::UnknownSelf);
                self.send_stun_request(now);
            }
            SessionState::KnownSelf => self.announce(now),
            SessionState::AwaitingPeerList
            | SessionState::HasPeerList
            | SessionState::Connected => self.send_keepalive(now),
        }
    }

    fn announce(&mut self, now: Instant) {
        let Some(public) = self.public else {
            return;
        };
        let entry = PeerConnected::new(public, self.local);
        log::info!("Announcing {}", entry);
        self.control_out.push_back(Message::Connect(entry));
        self.timer.set(now, Some(self.timings.keepalive));
        self.transition(SessionState::AwaitingPeerList);
    }

    /// Handle a message received on the packet socket
    pub fn handle_packet(&mut self, msg: Message, from: SocketAddr, now: Instant) {
        match msg {
            Message::StunResponse { address, port } => {
                if from != self.stun_addr {
                    log::warn!("Ignoring STUN response from unexpected sender {}", from);
                    return;
                }
                if self.state != SessionState::AwaitingStunResponse {
                    log::debug!("Late STUN response in state {}", self.state);
                    return;
                }

                let public = addr_from_wire(address, port);
                log::info!("Public address is {} (local {})", public, self.local);
                self.public = Some(public);
                self.transition(SessionState::KnownSelf);
                self.announce(now);
            }
            other => log::warn!("Ignoring {} from {} in state {}", other, from, self.state),
        }
    }

    /// Handle a message received on the control connection
    pub fn handle_control(&mut self, msg: Message) {
        match msg {
            Message::PeersToConnect(peers) => match self.state {
                SessionState::AwaitingPeerList
                | SessionState::HasPeerList
                | SessionState::Connected => self.merge_peers(peers),
                state => log::warn!("Ignoring peer list in state {}", state),
            },
            other => log::warn!("Ignoring {} on control connection in state {}", other, self.state),
        }
    }

    fn merge_peers(&mut self, peers: Vec<PeerConnected>) {
        let Some(public) = self.public else {
            return;
        };
        let ourselves = PeerConnected::new(public, self.local);

        for peer in peers {
            if peer == ourselves || self.directory.contains(&peer) {
                continue;
            }
            self.directory.push(peer);

            let candidate = connect_candidate(public, peer);
            if self
                .candidates
                .iter()
                .any(|known| known.target == candidate.target)
            {
                continue;
            }
            log::info!(
                "Connect candidate {} for peer {}{}",
                candidate.target,
                peer,
                if candidate.same_nat { " (same NAT)" } else { "" }
            );
            self.candidates.push(candidate);
        }

        if self.candidates.is_empty() {
            log::info!("No other peers registered yet");
            self.transition(SessionState::HasPeerList);
        } else {
            self.transition(SessionState::Connected);
        }
    }
}

/// Pick the address to reach `peer` at, given our own public address
pub fn connect_candidate(our_public: SocketAddrV4, peer: PeerConnected) -> ConnectCandidate {
    let same_nat = peer.public_addr().ip() == our_public.ip();
    let target = if same_nat {
        peer.local_addr()
    } else {
        peer.public_addr()
    };
    ConnectCandidate {
        peer,
        target,
        same_nat,
    }
}
