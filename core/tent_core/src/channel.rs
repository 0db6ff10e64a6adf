//! Transport channels carrying TENT frames
//!
//! - [`StreamChannel`]: byte stream (TCP). Frames may arrive split across
//!   reads or several per read, so inbound bytes are re-framed in a
//!   [`FrameBuffer`]. Outbound frames that only partly fit the socket keep
//!   their unsent tail as the single in-flight write.
//! - [`PacketChannel`]: datagrams (UDP). One datagram carries exactly one
//!   frame; anything malformed is dropped.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use crate::error::{ChannelError, ProtocolError};
use crate::message::{self, Message, HEADER_LEN, MIN_FRAME_LEN, PEER_ENTRY_LEN};
use crate::pool::ScratchArena;

// ============================================================================
// Constants
// ============================================================================

/// Receive buffer capacity of a stream channel (bounds the largest frame)
pub const RECV_BUFFER_SIZE: usize = 10 * 1024;

/// Most entries a PeersToConnect frame can carry and still fit the receive buffer
pub const MAX_PEERS_PER_FRAME: usize = (RECV_BUFFER_SIZE - MIN_FRAME_LEN - 4) / PEER_ENTRY_LEN;

/// Largest datagram accepted or sent on a packet channel
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Outcome of one read on a stream channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// Bytes were read; complete frames were appended to the output
    Read(usize),
    /// The socket had nothing to give (wait for the next readiness edge)
    Drained,
}

/// Outcome of a write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything handed to the socket
    Complete,
    /// Socket full; retry on the next writable edge
    Pending,
}

// ============================================================================
// Re-framing
// ============================================================================

/// Fixed-capacity accumulator that cuts a byte stream into frames
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    used: usize,
    /// Total size of the frame at the head, once its header is parsed
    target: Option<usize>,
    resyncs: u64,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        FrameBuffer {
            buf: vec![0u8; capacity],
            used: 0,
            target: None,
            resyncs: 0,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes dropped while looking for a frame header
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Unused space at the end of the buffer
    pub fn free_tail(&mut self) -> &mut [u8] {
        &mut self.buf[self.used..]
    }

    /// Account for `n` bytes written into [`FrameBuffer::free_tail`]
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.used + n <= self.buf.len());
        self.used = (self.used + n).min(self.buf.len());
    }

    /// Copy as much of `bytes` as fits, returning the count taken
    #[cfg(test)]
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let tail = self.free_tail();
        let n = tail.len().min(bytes.len());
        tail[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    fn consume(&mut self, n: usize) {
        self.buf.copy_within(n..self.used, 0);
        self.used -= n;
    }

    /// Next complete frame, decoded
    ///
    /// `None` means more bytes are needed. A decode error still consumes the
    /// frame it was raised for.
    pub fn next_frame(&mut self) -> Option<Result<Message, ProtocolError>> {
        loop {
            if self.target.is_none() {
                if self.used < HEADER_LEN {
                    return None;
                }
                match message::declared_len(&self.buf[..self.used]) {
                    Some(len) if (MIN_FRAME_LEN..=self.buf.len()).contains(&len) => {
                        self.target = Some(len);
                    }
                    _ => {
                        // Not a frame start (or one that can never complete)
                        self.consume(1);
                        self.resyncs += 1;
                        continue;
                    }
                }
            }

            let target = self.target?;
            if self.used < target {
                return None;
            }

            let result = message::decode(&self.buf[..target]);
            self.consume(target);
            self.target = None;
            return Some(result);
        }
    }
}

// ============================================================================
// Stream Channel
// ============================================================================

/// Write as much of `bytes` as the stream accepts right now
///
/// Returns the number of bytes written; stops early only on `WouldBlock`.
pub fn send<W: Write>(stream: &mut W, bytes: &[u8]) -> Result<usize, ChannelError> {
    let mut sent = 0;
    while sent < bytes.len() {
        match stream.write(&bytes[sent..]) {
            Ok(0) => return Err(ChannelError::Closed),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(sent)
}

/// Framed message channel over a non-blocking byte stream
#[derive(Debug)]
pub struct StreamChannel<S> {
    stream: S,
    inbound: FrameBuffer,
    /// Unsent tail of the in-flight frame
    pending: Vec<u8>,
}

impl<S: Read + Write> StreamChannel<S> {
    pub fn new(stream: S) -> Self {
        StreamChannel {
            stream,
            inbound: FrameBuffer::new(RECV_BUFFER_SIZE),
            pending: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn resyncs(&self) -> u64 {
        self.inbound.resyncs()
    }

    /// Read once and append every complete frame to `out`
    pub fn pump(&mut self, out: &mut Vec<Message>) -> Result<Pump, ChannelError> {
        let n = loop {
            match self.stream.read(self.inbound.free_tail()) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Pump::Drained),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.inbound.commit(n);

        while let Some(frame) = self.inbound.next_frame() {
            out.push(frame?);
        }

        Ok(Pump::Read(n))
    }

    pub fn has_pending_write(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Encode `msg` through the arena and write it
    ///
    /// Must not be called while a write is pending.
    pub fn write_message(
        &mut self,
        msg: &Message,
        arena: &mut ScratchArena,
    ) -> Result<Flush, ChannelError> {
        debug_assert!(!self.has_pending_write());

        let bytes = message::encode_in(msg, arena)?;
        let sent = send(&mut self.stream, bytes)?;
        if sent == bytes.len() {
            return Ok(Flush::Complete);
        }

        self.pending.extend_from_slice(&bytes[sent..]);
        Ok(Flush::Pending)
    }

    /// Continue the in-flight write
    pub fn flush_pending(&mut self) -> Result<Flush, ChannelError> {
        if self.pending.is_empty() {
            return Ok(Flush::Complete);
        }

        let sent = send(&mut self.stream, &self.pending)?;
        self.pending.drain(..sent);

        if self.pending.is_empty() {
            Ok(Flush::Complete)
        } else {
            Ok(Flush::Pending)
        }
    }
}

// ============================================================================
// Packet Channel
// ============================================================================

/// Datagram socket operations used by [`PacketChannel`]
pub trait DatagramSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

impl DatagramSocket for mio::net::UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        mio::net::UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        mio::net::UdpSocket::send_to(self, buf, target)
    }
}

impl DatagramSocket for std::net::UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        std::net::UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        std::net::UdpSocket::send_to(self, buf, target)
    }
}

/// Result of one receive on a packet channel
#[derive(Debug, PartialEq, Eq)]
pub enum Datagram {
    Message(Message, SocketAddr),
    /// A datagram arrived but was dropped (oversized, no magic, undecodable)
    Discarded,
    /// Nothing to read
    Drained,
}

/// One-message-per-datagram channel
#[derive(Debug)]
pub struct PacketChannel<U> {
    socket: U,
    recv_buf: Vec<u8>,
}

impl<U: DatagramSocket> PacketChannel<U> {
    pub fn new(socket: U) -> Self {
        PacketChannel {
            socket,
            // One spare byte to detect oversized datagrams
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE + 1],
        }
    }

    pub fn get_ref(&self) -> &U {
        &self.socket
    }

    pub fn get_mut(&mut self) -> &mut U {
        &mut self.socket
    }

    /// Receive at most one datagram
    pub fn recv(&mut self) -> Result<Datagram, ChannelError> {
        let (len, from) = loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok(received) => break received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Datagram::Drained),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if len > MAX_DATAGRAM_SIZE {
            log::warn!("Dropping oversized datagram from {} ({}+ bytes)", from, len);
            return Ok(Datagram::Discarded);
        }

        let bytes = &self.recv_buf[..len];
        if !message::has_magic(bytes) {
            log::trace!("Dropping {} byte datagram without magic from {}", len, from);
            return Ok(Datagram::Discarded);
        }

        match message::decode(bytes) {
            Ok(msg) => Ok(Datagram::Message(msg, from)),
            Err(e) => {
                log::warn!("Dropping undecodable datagram from {}: {}", from, e);
                Ok(Datagram::Discarded)
            }
        }
    }

    /// Send `msg` as a single datagram
    ///
    /// `Pending` means the socket was full and nothing was sent.
    pub fn send_to(
        &mut self,
        msg: &Message,
        target: SocketAddr,
        arena: &mut ScratchArena,
    ) -> Result<Flush, ChannelError> {
        let bytes = message::encode_in(msg, arena)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::FrameTooLarge(bytes.len()).into());
        }

        loop {
            match self.socket.send_to(bytes, target) {
                Ok(n) => {
                    if n != bytes.len() {
                        log::warn!("Short datagram send to {}: {}/{} bytes", target, n, bytes.len());
                    }
                    return Ok(Flush::Complete);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Outbound datagrams waiting for a writable socket
pub type PacketQueue = VecDeque<(Message, SocketAddr)>;
