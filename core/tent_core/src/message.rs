//! TENT wire protocol
//!
//! # Frame Format (all integers big-endian)
//!
//! ```text
//! +--------+--------+--------+--------+
//! | Magic 'T' 'E' 'N' 'T' (4 bytes)   |
//! +--------+--------+--------+--------+
//! | Total frame length incl. header   |
//! +--------+--------+--------+--------+
//! | Type   | Payload ...
//! +--------+--------------------------
//! ```
//!
//! # Payloads
//!
//! | Type | Tag | Payload |
//! |------|-----|---------|
//! | StunRequest | 1 | empty |
//! | StunResponse | 2 | address (4) + port (2) |
//! | KeepAlive | 3 | empty |
//! | Connect | 4 | address (4) + port (2) + local address (4) + local port (2) |
//! | PeersToConnect | 5 | count (4) + count x Connect payload |
//!
//! Encoding runs one serialization routine twice: once into a byte counter
//! to size the output, once into the exactly-sized buffer.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::byteorder::{peek_u32, Counter, Reader, Sink, SliceWriter};
use crate::error::ProtocolError;
use crate::pool::ScratchArena;

// ============================================================================
// Constants
// ============================================================================

/// Frame magic: 'T' 'E' 'N' 'T'
pub const MAGIC: u32 = u32::from_be_bytes(*b"TENT");

/// Magic + length
pub const HEADER_LEN: usize = 8;

/// Smallest valid frame: header + type tag
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

/// Encoded size of one peer entry
pub const PEER_ENTRY_LEN: usize = 12;

// ============================================================================
// Message Types
// ============================================================================

/// One-byte type tag on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    StunRequest = 1,
    StunResponse = 2,
    KeepAlive = 3,
    Connect = 4,
    PeersToConnect = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(MessageType::StunRequest),
            2 => Ok(MessageType::StunResponse),
            3 => Ok(MessageType::KeepAlive),
            4 => Ok(MessageType::Connect),
            5 => Ok(MessageType::PeersToConnect),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Public and local address pair of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerConnected {
    pub address: u32,
    pub port: u16,
    pub local_address: u32,
    pub local_port: u16,
}

impl PeerConnected {
    pub fn new(public: SocketAddrV4, local: SocketAddrV4) -> Self {
        let (address, port) = addr_to_wire(public);
        let (local_address, local_port) = addr_to_wire(local);
        PeerConnected {
            address,
            port,
            local_address,
            local_port,
        }
    }

    /// Address as observed by the coordinator (outside the NAT)
    pub fn public_addr(&self) -> SocketAddrV4 {
        addr_from_wire(self.address, self.port)
    }

    /// Address as seen from inside the peer's own network
    pub fn local_addr(&self) -> SocketAddrV4 {
        addr_from_wire(self.local_address, self.local_port)
    }
}

impl fmt::Display for PeerConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (local {})", self.public_addr(), self.local_addr())
    }
}

/// A decoded TENT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask the coordinator which address it sees us at
    StunRequest,
    /// Observed address of the requester
    StunResponse { address: u32, port: u16 },
    /// NAT binding refresh, no payload
    KeepAlive,
    /// Peer announces its public and local address pair
    Connect(PeerConnected),
    /// Peers the receiver should try to reach
    PeersToConnect(Vec<PeerConnected>),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::StunRequest => MessageType::StunRequest,
            Message::StunResponse { .. } => MessageType::StunResponse,
            Message::KeepAlive => MessageType::KeepAlive,
            Message::Connect(_) => MessageType::Connect,
            Message::PeersToConnect(_) => MessageType::PeersToConnect,
        }
    }

    /// STUN response echoing the observed sender address
    pub fn stun_response(observed: SocketAddrV4) -> Self {
        let (address, port) = addr_to_wire(observed);
        Message::StunResponse { address, port }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::StunRequest => write!(f, "STUN_REQUEST"),
            Message::StunResponse { address, port } => {
                write!(f, "STUN_RESPONSE {}", addr_from_wire(*address, *port))
            }
            Message::KeepAlive => write!(f, "KEEP_ALIVE"),
            Message::Connect(peer) => write!(f, "CONNECT {}", peer),
            Message::PeersToConnect(peers) => {
                write!(f, "PEERS_TO_CONNECT count={}", peers.len())?;
                for peer in peers {
                    write!(f, " [{}]", peer)?;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Address Helpers
// ============================================================================

/// Split an IPv4 socket address into wire fields
pub fn addr_to_wire(addr: SocketAddrV4) -> (u32, u16) {
    (u32::from(*addr.ip()), addr.port())
}

/// Build an IPv4 socket address from wire fields
pub fn addr_from_wire(address: u32, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::from(address), port)
}

/// IPv4 view of a socket address (the wire format has no IPv6 encoding)
pub fn as_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn put_peer<S: Sink>(sink: &mut S, peer: &PeerConnected) {
    sink.put_u32(peer.address);
    sink.put_u16(peer.port);
    sink.put_u32(peer.local_address);
    sink.put_u16(peer.local_port);
}

fn serialize<S: Sink>(msg: &Message, frame_len: u32, sink: &mut S) -> Result<(), ProtocolError> {
    sink.put_u32(MAGIC);
    sink.put_u32(frame_len);
    sink.put_u8(msg.message_type() as u8);

    match msg {
        Message::StunRequest | Message::KeepAlive => {}
        Message::StunResponse { address, port } => {
            sink.put_u32(*address);
            sink.put_u16(*port);
        }
        Message::Connect(peer) => put_peer(sink, peer),
        Message::PeersToConnect(peers) => {
            let count =
                u32::try_from(peers.len()).map_err(|_| ProtocolError::FrameTooLarge(usize::MAX))?;
            sink.put_u32(count);
            for peer in peers {
                put_peer(sink, peer);
            }
        }
    }

    Ok(())
}

/// Size of the encoded frame (counting pass)
pub fn encoded_len(msg: &Message) -> Result<usize, ProtocolError> {
    let mut counter = Counter::new();
    serialize(msg, 0, &mut counter)?;
    Ok(counter.count())
}

/// Encode into `buf`, returning the number of bytes written
pub fn encode_into(msg: &Message, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    let len = encoded_len(msg)?;
    if buf.len() < len {
        return Err(ProtocolError::BufferTooSmall {
            needed: len,
            available: buf.len(),
        });
    }
    let frame_len = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge(len))?;

    let mut writer = SliceWriter::new(&mut buf[..len]);
    serialize(msg, frame_len, &mut writer)?;
    debug_assert!(!writer.overflowed());
    debug_assert_eq!(writer.position(), len);

    Ok(len)
}

/// Encode into a freshly allocated vector of exactly the frame size
pub fn encode_to_vec(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![0u8; encoded_len(msg)?];
    encode_into(msg, &mut buf)?;
    Ok(buf)
}

/// Encode into scratch memory; the bytes live until the arena is restored
pub fn encode_in<'a>(msg: &Message, arena: &'a mut ScratchArena) -> Result<&'a [u8], ProtocolError> {
    let len = encoded_len(msg)?;
    let range = arena.alloc(len, 8);
    encode_into(msg, arena.bytes_mut(range.clone()))?;
    Ok(arena.bytes(range))
}

// ============================================================================
// Decoding
// ============================================================================

/// True if `buf` starts with the TENT magic
pub fn has_magic(buf: &[u8]) -> bool {
    peek_u32(buf) == Some(MAGIC)
}

/// Frame length declared by a header, if `buf` holds a full header
pub fn declared_len(buf: &[u8]) -> Option<usize> {
    if !has_magic(buf) {
        return None;
    }
    peek_u32(buf.get(4..)?).map(|len| len as usize)
}

fn read_peer(reader: &mut Reader<'_>) -> Result<PeerConnected, ProtocolError> {
    Ok(PeerConnected {
        address: reader.read_u32()?,
        port: reader.read_u16()?,
        local_address: reader.read_u32()?,
        local_port: reader.read_u16()?,
    })
}

/// Decode exactly one frame occupying all of `buf`
pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
    let mut reader = Reader::new(buf);

    let magic = reader.read_u32()?;
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let declared = reader.read_u32()? as usize;
    if declared != buf.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }

    let msg = match MessageType::try_from(reader.read_u8()?)? {
        MessageType::StunRequest => Message::StunRequest,
        MessageType::KeepAlive => Message::KeepAlive,
        MessageType::StunResponse => Message::StunResponse {
            address: reader.read_u32()?,
            port: reader.read_u16()?,
        },
        MessageType::Connect => Message::Connect(read_peer(&mut reader)?),
        MessageType::PeersToConnect => {
            let count = reader.read_u32()? as usize;
            // Reject counts the frame cannot hold before allocating
            if count > reader.remaining() / PEER_ENTRY_LEN {
                return Err(ProtocolError::Truncated);
            }
            let mut peers = Vec::with_capacity(count);
            for _ in 0..count {
                peers.push(read_peer(&mut reader)?);
            }
            Message::PeersToConnect(peers)
        }
    };

    if reader.remaining() != 0 {
        return Err(ProtocolError::TrailingBytes(reader.remaining()));
    }

    Ok(msg)
}
