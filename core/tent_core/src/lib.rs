//! TENT Rendezvous Core
//!
//! Shared by the coordinator and the peer:
//! - Big-endian wire primitives and the TENT message codec
//! - Stream and datagram channels with re-framing
//! - Slab pool and scratch arena for per-iteration memory reuse
//! - Deadline and readiness helpers for the mio event loops
//! - Flag and JSON config file parsing for both binaries

// ============================================================================
// Modules
// ============================================================================

pub mod byteorder;
pub mod channel;
pub mod config;
pub mod error;
pub mod message;
pub mod mux;
pub mod pool;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{
    Datagram, DatagramSocket, Flush, FrameBuffer, PacketChannel, PacketQueue, Pump,
    StreamChannel, MAX_DATAGRAM_SIZE, MAX_PEERS_PER_FRAME, RECV_BUFFER_SIZE,
};
pub use config::ConfigError;
pub use error::{ChannelError, ProtocolError};
pub use message::{Message, MessageType, PeerConnected, MAGIC};
pub use mux::{Deadline, Readiness};
pub use pool::{Handle, Pool, ScratchArena};

// ============================================================================
// Defaults
// ============================================================================

/// Default coordinator control (TCP) port
pub const DEFAULT_CONTROL_PORT: u16 = 8080;

/// Default coordinator STUN (UDP) port
pub const DEFAULT_STUN_PORT: u16 = 8081;
