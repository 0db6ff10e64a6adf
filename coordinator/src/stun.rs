//! STUN-style binding over the packet socket
//!
//! A peer learns its externally-observed address by sending a StunRequest
//! to the coordinator's packet port; the reply echoes the source address the
//! coordinator saw. KeepAlives only refresh the NAT mapping on the way in.

use std::net::SocketAddr;

use tent_core::message::as_v4;
use tent_core::Message;

/// What the packet handler decided for one datagram
#[derive(Debug, PartialEq, Eq)]
pub enum PacketReply {
    /// Send this message back to the sender
    Respond(Message, SocketAddr),
    /// KeepAlive received
    KeepAlive,
    /// Nothing to do
    Ignored,
}

/// Handle one datagram received from `from`
pub fn handle_packet(msg: Message, from: SocketAddr) -> PacketReply {
    match msg {
        Message::StunRequest => match observed_address(from) {
            Some(reply) => PacketReply::Respond(reply, from),
            None => PacketReply::Ignored,
        },
        Message::KeepAlive => {
            log::trace!("Keep-alive from {}", from);
            PacketReply::KeepAlive
        }
        other => {
            log::warn!("Unexpected {} on packet socket from {}", other, from);
            PacketReply::Ignored
        }
    }
}

/// StunResponse echoing `addr`
///
/// Returns `None` for IPv6 senders (the wire format carries IPv4 only).
pub fn observed_address(addr: SocketAddr) -> Option<Message> {
    match as_v4(addr) {
        Some(v4) => Some(Message::stun_response(v4)),
        None => {
            log::warn!("IPv6 STUN not supported, skipping {}", addr);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    use tent_core::message::encode_to_vec;
    use tent_core::PeerConnected;

    #[test]
    fn test_stun_response_echoes_sender() {
        let from = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 40000));

        let reply = handle_packet(Message::StunRequest, from);
        assert_eq!(
            reply,
            PacketReply::Respond(
                Message::StunResponse {
                    address: 0xCB00_7105,
                    port: 40000
                },
                from
            )
        );
    }

    #[test]
    fn test_stun_response_wire_bytes() {
        let from = SocketAddr::from(([203, 0, 113, 5], 40000));
        let reply = observed_address(from).expect("IPv4 should return Some");
        let bytes = encode_to_vec(&reply).unwrap();

        assert_eq!(bytes.len(), 15);
        assert_eq!(bytes[8], 2); // StunResponse
        assert_eq!(bytes[9..13], [203, 0, 113, 5]);
        // Port 40000 = 0x9C40
        assert_eq!(bytes[13], 0x9C);
        assert_eq!(bytes[14], 0x40);
    }

    #[test]
    fn test_ipv6_sender_is_ignored() {
        let from = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 4433, 0, 0));
        assert!(observed_address(from).is_none());
        assert_eq!(handle_packet(Message::StunRequest, from), PacketReply::Ignored);
    }

    #[test]
    fn test_keepalive_and_unexpected() {
        let from = SocketAddr::from(([127, 0, 0, 1], 5000));
        assert_eq!(handle_packet(Message::KeepAlive, from), PacketReply::KeepAlive);

        let connect = Message::Connect(PeerConnected::new(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2),
        ));
        assert_eq!(handle_packet(connect, from), PacketReply::Ignored);
    }
}
