//! Coordinator event loop
//!
//! One mio poll multiplexes the control listener, every peer control
//! stream and the STUN packet socket. Each iteration services, in order:
//! at most one accept, one read and one write per peer, then one datagram
//! in and one datagram out.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use tent_core::mux::{interest, next_timeout};
use tent_core::{
    ChannelError, Datagram, Deadline, Flush, Handle, Message, PacketChannel, PacketQueue, Pump,
    Readiness, ScratchArena, StreamChannel,
};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::stun::{self, PacketReply};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the control listener
const LISTENER_TOKEN: Token = Token(0);

/// mio token for the STUN packet socket
const STUN_TOKEN: Token = Token(1);

/// Peer tokens start here (token = base + registry slot)
const PEER_TOKEN_BASE: usize = 2;

/// Poll event capacity
const EVENTS_CAPACITY: usize = 1024;

/// Initial scratch arena size (grows on demand)
const ARENA_CAPACITY: usize = 16 * 1024;

fn peer_token(handle: Handle) -> Token {
    Token(PEER_TOKEN_BASE + handle.index())
}

// ============================================================================
// Server Structure
// ============================================================================

pub struct Server {
    /// mio poll instance
    poll: Poll,
    /// TCP control listener
    listener: TcpListener,
    /// Listener readiness latch
    listener_ready: bool,
    /// UDP STUN socket
    packets: PacketChannel<UdpSocket>,
    /// STUN socket readiness latch
    packet_ready: Readiness,
    /// Interest registered for the STUN socket
    packet_interest: Interest,
    /// Datagrams waiting to be sent
    packet_out: PacketQueue,
    /// Attached peers
    registry: Registry<TcpStream>,
    /// Per-iteration encode memory
    arena: ScratchArena,
    /// Reused buffer for frames decoded off a control stream
    inbound: Vec<Message>,
    config: Config,
    metrics: Metrics,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::bind(config.control_addr())?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut socket = UdpSocket::bind(config.stun_addr())?;
        poll.registry()
            .register(&mut socket, STUN_TOKEN, Interest::READABLE)?;

        log::info!("Control listener on {}", listener.local_addr()?);
        log::info!("STUN socket on {}", socket.local_addr()?);

        Ok(Server {
            poll,
            listener,
            listener_ready: false,
            packets: PacketChannel::new(socket),
            packet_ready: Readiness::default(),
            packet_interest: Interest::READABLE,
            packet_out: PacketQueue::new(),
            registry: Registry::new(),
            arena: ScratchArena::with_capacity(ARENA_CAPACITY),
            inbound: Vec::new(),
            config,
            metrics: Metrics::new(),
            shutdown,
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run until the shutdown flag is set or a fatal error occurs
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.shutdown.load(Ordering::Relaxed) {
            self.update_interest()?;

            let timeout = self.poll_timeout(Instant::now());
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                self.absorb(event);
            }

            let mark = self.arena.mark();
            let now = Instant::now();

            self.service_listener(now)?;
            self.service_peers(now);
            self.service_packets()?;
            self.expire_idle(Instant::now());

            self.arena.restore(mark);
        }

        if !self.registry.is_empty() {
            log::info!(
                "Shutting down with {} attached peers ({} announced, {} messages queued)",
                self.registry.len(),
                self.registry.announced_count(),
                self.registry.message_pool().len()
            );
        }
        log::info!("Metrics:\n{}", self.metrics.render());
        Ok(())
    }

    // ========================================================================
    // Poll bookkeeping
    // ========================================================================

    fn absorb(&mut self, event: &Event) {
        match event.token() {
            LISTENER_TOKEN => self.listener_ready = true,
            STUN_TOKEN => self.packet_ready.absorb(event),
            Token(n) => {
                let handle = n
                    .checked_sub(PEER_TOKEN_BASE)
                    .and_then(|index| self.registry.handle_at(index));
                match handle.and_then(|handle| self.registry.get_mut(handle)) {
                    Some(peer) => peer.readiness.absorb(event),
                    None => log::trace!("Event for stale token {}", n),
                }
            }
        }
    }

    /// Bring registrations in line with what each source needs
    fn update_interest(&mut self) -> io::Result<()> {
        let wanted = interest(!self.packet_out.is_empty());
        if wanted != self.packet_interest {
            self.poll
                .registry()
                .reregister(self.packets.get_mut(), STUN_TOKEN, wanted)?;
            self.packet_interest = wanted;
        }

        let mut failed = Vec::new();
        for handle in self.registry.handles() {
            let Some(peer) = self.registry.get_mut(handle) else {
                continue;
            };
            let wanted = interest(peer.wants_write());
            if wanted == peer.interest {
                continue;
            }
            match self.poll.registry().reregister(
                peer.channel.get_mut(),
                peer_token(handle),
                wanted,
            ) {
                Ok(()) => peer.interest = wanted,
                Err(e) => failed.push((handle, ChannelError::Io(e))),
            }
        }
        for (handle, reason) in failed {
            self.disconnect(handle, &reason);
        }

        Ok(())
    }

    /// Zero when latched readiness still has work, else the nearest deadline
    fn poll_timeout(&self, now: Instant) -> std::time::Duration {
        let packet_work = self.packet_ready.readable
            || (self.packet_ready.writable && !self.packet_out.is_empty());
        let peer_work = self.registry.iter().any(|(_, peer)| {
            peer.readiness.readable || (peer.readiness.writable && peer.wants_write())
        });

        if self.listener_ready || packet_work || peer_work {
            return std::time::Duration::ZERO;
        }

        next_timeout(
            self.config.poll_timeout,
            self.registry
                .iter()
                .map(|(_, peer)| peer.deadline.remaining(now)),
        )
    }

    // ========================================================================
    // Listener
    // ========================================================================

    fn service_listener(&mut self, now: Instant) -> io::Result<()> {
        if !self.listener_ready {
            return Ok(());
        }

        let (stream, addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.listener_ready = false;
                return Ok(());
            }
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::ConnectionAborted =>
            {
                log::debug!("Transient accept error: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let handle = self.registry.attach(
            StreamChannel::new(stream),
            addr,
            Deadline::new(now, self.config.idle_timeout),
        );

        let registered = match self.registry.get_mut(handle) {
            Some(peer) => self.poll.registry().register(
                peer.channel.get_mut(),
                peer_token(handle),
                Interest::READABLE,
            ),
            None => Ok(()),
        };
        if let Err(e) = registered {
            log::warn!("Failed to register connection from {}: {}", addr, e);
            self.registry.remove(handle);
            return Ok(());
        }

        Metrics::inc(&self.metrics.accepted_total);
        self.metrics
            .active_peers
            .store(self.registry.len() as u64, Ordering::Relaxed);
        log::info!("Accepted control connection from {}", addr);
        Ok(())
    }

    // ========================================================================
    // Peers
    // ========================================================================

    fn service_peers(&mut self, now: Instant) {
        for handle in self.registry.handles() {
            if let Err(reason) = self.service_peer(handle, now) {
                self.disconnect(handle, &reason);
            }
        }
    }

    fn service_peer(&mut self, handle: Handle, now: Instant) -> Result<(), ChannelError> {
        let Some(peer) = self.registry.get_mut(handle) else {
            return Ok(());
        };

        if peer.readiness.readable {
            let resyncs_before = peer.channel.resyncs();
            let pumped = peer.channel.pump(&mut self.inbound);
            let skipped = peer.channel.resyncs() - resyncs_before;
            if skipped > 0 {
                log::warn!("Skipped {} bytes of garbage from {}", skipped, peer.addr);
                self.metrics
                    .framing_resyncs_total
                    .fetch_add(skipped, Ordering::Relaxed);
            }

            match pumped {
                Ok(Pump::Drained) => peer.readiness.clear_read(),
                Ok(Pump::Read(n)) => {
                    log::trace!("Read {} bytes from {}", n, peer.addr);
                    peer.touch(now);
                }
                Err(e) => {
                    self.inbound.clear();
                    return Err(e);
                }
            }

            let mut frames = std::mem::take(&mut self.inbound);
            for msg in frames.drain(..) {
                self.dispatch_control(handle, msg);
            }
            self.inbound = frames;
        }

        self.service_peer_write(handle)
    }

    /// Finish the in-flight frame or send one queued message
    fn service_peer_write(&mut self, handle: Handle) -> Result<(), ChannelError> {
        let writable = match self.registry.get(handle) {
            Some(peer) => peer.readiness.writable,
            None => return Ok(()),
        };
        if !writable {
            return Ok(());
        }

        let in_flight = self
            .registry
            .get(handle)
            .map(|peer| peer.channel.has_pending_write())
            .unwrap_or(false);

        let (flush, sent) = if in_flight {
            let Some(peer) = self.registry.get_mut(handle) else {
                return Ok(());
            };
            (peer.channel.flush_pending()?, None)
        } else {
            let Some(msg) = self.registry.pop_outbound(handle) else {
                if let Some(peer) = self.registry.get_mut(handle) {
                    peer.readiness.clear_write();
                }
                return Ok(());
            };
            let Some(peer) = self.registry.get_mut(handle) else {
                return Ok(());
            };
            (peer.channel.write_message(&msg, &mut self.arena)?, Some(msg))
        };

        if let Some(peer) = self.registry.get_mut(handle) {
            if flush == Flush::Pending {
                peer.readiness.clear_write();
            }
            if let Some(msg) = sent {
                log::debug!("Sent {} to {}", msg, peer.addr);
                if matches!(msg, Message::PeersToConnect(_)) {
                    Metrics::inc(&self.metrics.peer_lists_sent_total);
                }
            }
        }

        Ok(())
    }

    fn dispatch_control(&mut self, handle: Handle, msg: Message) {
        let Some(addr) = self.registry.get(handle).map(|peer| peer.addr) else {
            return;
        };
        log::debug!("Received {} from {}", msg, addr);

        match msg {
            Message::Connect(entry) => {
                if let Some(notified) = self.registry.announce(handle, entry) {
                    Metrics::inc(&self.metrics.announces_total);
                    log::info!(
                        "Peer {} registered; {} other peers notified ({} announced)",
                        addr,
                        notified,
                        self.registry.announced_count()
                    );
                }
            }
            Message::KeepAlive => log::trace!("Keep-alive on control connection {}", addr),
            other => log::warn!("Ignoring {} on control connection {}", other, addr),
        }
    }

    fn disconnect(&mut self, handle: Handle, reason: &ChannelError) {
        let Some(mut peer) = self.registry.remove(handle) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(peer.channel.get_mut()) {
            log::debug!("Deregister of {} failed: {}", peer.addr, e);
        }

        match reason {
            ChannelError::Closed => log::info!("Peer {} disconnected", peer.addr),
            other => log::warn!("Dropping peer {}: {}", peer.addr, other),
        }

        Metrics::inc(&self.metrics.disconnects_total);
        self.metrics
            .active_peers
            .store(self.registry.len() as u64, Ordering::Relaxed);
    }

    fn expire_idle(&mut self, now: Instant) {
        for handle in self.registry.expired(now) {
            let reason = ChannelError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "idle timeout",
            ));
            self.disconnect(handle, &reason);
        }
    }

    // ========================================================================
    // STUN socket
    // ========================================================================

    fn service_packets(&mut self) -> Result<(), ChannelError> {
        if self.packet_ready.readable {
            match self.packets.recv()? {
                Datagram::Drained => self.packet_ready.clear_read(),
                Datagram::Discarded => {}
                Datagram::Message(msg, from) => self.dispatch_packet(msg, from),
            }
        }

        if self.packet_ready.writable {
            match self.packet_out.front() {
                Some((msg, to)) => match self.packets.send_to(msg, *to, &mut self.arena)? {
                    Flush::Complete => {
                        if let Some((msg, to)) = self.packet_out.pop_front() {
                            log::trace!("Sent {} to {}", msg, to);
                            if matches!(msg, Message::StunResponse { .. }) {
                                Metrics::inc(&self.metrics.stun_responses_total);
                            }
                        }
                    }
                    Flush::Pending => self.packet_ready.clear_write(),
                },
                None => self.packet_ready.clear_write(),
            }
        }

        Ok(())
    }

    fn dispatch_packet(&mut self, msg: Message, from: SocketAddr) {
        match stun::handle_packet(msg, from) {
            PacketReply::Respond(reply, to) => {
                log::debug!("STUN request from {}", from);
                self.packet_out.push_back((reply, to));
            }
            PacketReply::KeepAlive => Metrics::inc(&self.metrics.keepalives_total),
            PacketReply::Ignored => {}
        }
    }
}
