//! Peer event loop
//!
//! Multiplexes the control connection to the coordinator and the packet
//! socket used for STUN and keep-alives, feeding both into the session.
//! Any transport error on either channel ends the run.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use tent_core::message::as_v4;
use tent_core::mux::{interest, next_timeout};
use tent_core::{
    ChannelError, Datagram, Flush, Message, PacketChannel, Pump, Readiness, ScratchArena,
    StreamChannel,
};

use crate::config::Config;
use crate::session::PeerSession;

// ============================================================================
// Constants
// ============================================================================

/// mio token for the control connection
const CONTROL_TOKEN: Token = Token(0);

/// mio token for the packet socket
const PACKET_TOKEN: Token = Token(1);

/// Poll event capacity
const EVENTS_CAPACITY: usize = 64;

/// Initial scratch arena size
const ARENA_CAPACITY: usize = 4 * 1024;

// ============================================================================
// Client Structure
// ============================================================================

pub struct PeerClient {
    /// mio poll instance
    poll: Poll,
    /// Control connection to the coordinator
    control: StreamChannel<TcpStream>,
    /// Set once the non-blocking connect has completed
    connected: bool,
    control_ready: Readiness,
    control_interest: Interest,
    /// Packet socket (STUN and keep-alives)
    packets: PacketChannel<UdpSocket>,
    packet_ready: Readiness,
    packet_interest: Interest,
    session: PeerSession,
    arena: ScratchArena,
    inbound: Vec<Message>,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

impl PeerClient {
    pub fn new(config: &Config, shutdown: Arc<AtomicBool>) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;

        let control_addr = config.control_addr();
        let stun_addr = config.stun_addr();

        let mut stream = TcpStream::connect(control_addr)?;
        // Writable signals connect completion
        poll.registry().register(
            &mut stream,
            CONTROL_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let bind: SocketAddr = if stun_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let mut socket = UdpSocket::bind(bind)?;
        poll.registry()
            .register(&mut socket, PACKET_TOKEN, Interest::READABLE)?;

        let control_local = as_v4(stream.local_addr()?)
            .ok_or("control connection has no IPv4 local address")?;
        let local = SocketAddrV4::new(*control_local.ip(), socket.local_addr()?.port());

        log::info!("Control connection to {} from {}", control_addr, control_local);
        log::info!("Packet socket on {} (announced local {})", socket.local_addr()?, local);

        Ok(PeerClient {
            poll,
            control: StreamChannel::new(stream),
            connected: false,
            control_ready: Readiness::default(),
            control_interest: Interest::READABLE | Interest::WRITABLE,
            packets: PacketChannel::new(socket),
            packet_ready: Readiness::default(),
            packet_interest: Interest::READABLE,
            session: PeerSession::new(stun_addr, local, config.timings, Instant::now()),
            arena: ScratchArena::with_capacity(ARENA_CAPACITY),
            inbound: Vec::new(),
            poll_timeout: config.poll_timeout,
            shutdown,
        })
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Run until the shutdown flag is set or a channel fails
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while !self.shutdown.load(Ordering::Relaxed) {
            self.session.on_timeout(Instant::now());
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
            self.service_control()?;
            self.service_packets(Instant::now())?;
            self.arena.restore(mark);
        }

        log::info!(
            "Shutting down in state {} (public {:?}, local {}): {} peers known, {} connect candidates",
            self.session.state(),
            self.session.public_addr(),
            self.session.local_addr(),
            self.session.directory().len(),
            self.session.candidates().len()
        );
        Ok(())
    }

    // ========================================================================
    // Poll bookkeeping
    // ========================================================================

    fn absorb(&mut self, event: &Event) {
        match event.token() {
            CONTROL_TOKEN => self.control_ready.absorb(event),
            PACKET_TOKEN => self.packet_ready.absorb(event),
            Token(n) => log::trace!("Event for unknown token {}", n),
        }
    }

    fn control_wants_write(&self) -> bool {
        !self.connected || self.session.has_control_out() || self.control.has_pending_write()
    }

    fn update_interest(&mut self) -> io::Result<()> {
        let wanted = interest(self.control_wants_write());
        if wanted != self.control_interest {
            self.poll
                .registry()
                .reregister(self.control.get_mut(), CONTROL_TOKEN, wanted)?;
            self.control_interest = wanted;
        }

        let wanted = interest(!self.session.packet_out().is_empty());
        if wanted != self.packet_interest {
            self.poll
                .registry()
                .reregister(self.packets.get_mut(), PACKET_TOKEN, wanted)?;
            self.packet_interest = wanted;
        }

        Ok(())
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        let control_work = self.control_ready.readable
            || (self.control_ready.writable && self.control_wants_write());
        let packet_work = self.packet_ready.readable
            || (self.packet_ready.writable && !self.session.packet_out().is_empty());

        if control_work || packet_work {
            return Duration::ZERO;
        }
        next_timeout(self.poll_timeout, [self.session.timeout(now)])
    }

    // ========================================================================
    // Control connection
    // ========================================================================

    /// Check whether the non-blocking connect has finished
    fn finish_connect(&mut self) -> Result<bool, ChannelError> {
        if let Some(e) = self.control.get_ref().take_error()? {
            return Err(e.into());
        }
        match self.control.get_ref().peer_addr() {
            Ok(addr) => {
                log::info!("Connected to coordinator at {}", addr);
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn service_control(&mut self) -> Result<(), ChannelError> {
        if !self.connected {
            if !self.control_ready.any() {
                return Ok(());
            }
            if !self.finish_connect()? {
                self.control_ready = Readiness::default();
                return Ok(());
            }
        }

        if self.control_ready.readable {
            let resyncs_before = self.control.resyncs();
            match self.control.pump(&mut self.inbound)? {
                Pump::Drained => self.control_ready.clear_read(),
                Pump::Read(n) => log::trace!("Read {} bytes from coordinator", n),
            }
            let skipped = self.control.resyncs() - resyncs_before;
            if skipped > 0 {
                log::warn!("Skipped {} bytes of garbage from coordinator", skipped);
            }

            for msg in self.inbound.drain(..) {
                log::debug!("Received {} from coordinator", msg);
                self.session.handle_control(msg);
            }
        }

        if self.control_ready.writable {
            let flush = if self.control.has_pending_write() {
                self.control.flush_pending()?
            } else if let Some(msg) = self.session.pop_control() {
                log::debug!("Sending {} to coordinator", msg);
                self.control.write_message(&msg, &mut self.arena)?
            } else {
                self.control_ready.clear_write();
                return Ok(());
            };

            if flush == Flush::Pending {
                self.control_ready.clear_write();
            }
        }

        Ok(())
    }

    // ========================================================================
    // Packet socket
    // ========================================================================

    fn service_packets(&mut self, now: Instant) -> Result<(), ChannelError> {
        if self.packet_ready.readable {
            match self.packets.recv()? {
                Datagram::Drained => self.packet_ready.clear_read(),
                Datagram::Discarded => {}
                Datagram::Message(msg, from) => {
                    log::debug!("Received {} from {}", msg, from);
                    self.session.handle_packet(msg, from, now);
                }
            }
        }

        if self.packet_ready.writable {
            match self.session.packet_out().front() {
                Some((msg, to)) => match self.packets.send_to(msg, *to, &mut self.arena)? {
                    Flush::Complete => {
                        if let Some((msg, to)) = self.session.packet_out_mut().pop_front() {
                            log::trace!("Sent {} to {}", msg, to);
                        }
                    }
                    Flush::Pending => self.packet_ready.clear_write(),
                },
                None => self.packet_ready.clear_write(),
            }
        }

        Ok(())
    }
}
