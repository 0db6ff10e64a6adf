//! Error types shared by the codec and the channels

use std::fmt;
use std::io;

// ============================================================================
// Protocol Errors
// ============================================================================

/// Errors raised while encoding or decoding a TENT frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame does not start with the TENT magic
    BadMagic(u32),
    /// Length field disagrees with the framed buffer
    LengthMismatch { declared: usize, actual: usize },
    /// Type tag outside the known message set
    UnknownType(u8),
    /// Buffer ended before the field layout was complete
    Truncated,
    /// Payload decoded but bytes were left over inside the frame
    TrailingBytes(usize),
    /// Encoded frame would not fit the 32-bit length field
    FrameTooLarge(usize),
    /// Output buffer is smaller than the encoded frame
    BufferTooSmall { needed: usize, available: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadMagic(magic) => write!(f, "bad magic 0x{:08x}", magic),
            ProtocolError::LengthMismatch { declared, actual } => write!(
                f,
                "length mismatch: header declares {} bytes, frame has {}",
                declared, actual
            ),
            ProtocolError::UnknownType(tag) => write!(f, "unknown message type {}", tag),
            ProtocolError::Truncated => write!(f, "truncated frame"),
            ProtocolError::TrailingBytes(n) => write!(f, "{} trailing bytes after payload", n),
            ProtocolError::FrameTooLarge(size) => write!(f, "frame too large: {} bytes", size),
            ProtocolError::BufferTooSmall { needed, available } => write!(
                f,
                "buffer too small: need {} bytes, have {}",
                needed, available
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ============================================================================
// Channel Errors
// ============================================================================

/// Errors that end a channel
#[derive(Debug)]
pub enum ChannelError {
    /// Remote side closed the stream (read or write returned zero)
    Closed,
    /// Hard transport error
    Io(io::Error),
    /// A correctly framed buffer failed to decode
    Protocol(ProtocolError),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "connection closed"),
            ChannelError::Io(e) => write!(f, "transport error: {}", e),
            ChannelError::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Closed => None,
            ChannelError::Io(e) => Some(e),
            ChannelError::Protocol(e) => Some(e),
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Io(e)
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        ChannelError::Protocol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        assert_eq!(
            ProtocolError::BadMagic(0xdeadbeef).to_string(),
            "bad magic 0xdeadbeef"
        );
        assert_eq!(
            ProtocolError::UnknownType(9).to_string(),
            "unknown message type 9"
        );
    }

    #[test]
    fn test_channel_error_from_io() {
        let err: ChannelError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, ChannelError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
