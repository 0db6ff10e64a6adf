//! Integration tests for the coordinator
//!
//! These tests spawn the built binary on loopback test ports and drive it
//! with plain blocking sockets.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tent_core::message::{decode, encode_to_vec};
use tent_core::{FrameBuffer, Message, PeerConnected, RECV_BUFFER_SIZE};

/// Read timeout for every test socket
const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Helper to spawn the coordinator for tests
struct ServerProcess {
    child: Child,
    control_port: u16,
    stun_port: u16,
}

impl ServerProcess {
    fn start(control_port: u16, stun_port: u16) -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_with(control_port, stun_port, &[])
    }

    fn start_with(
        control_port: u16,
        stun_port: u16,
        extra: &[&str],
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut child = Command::new(env!("CARGO_BIN_EXE_tent-coordinator"))
            .args([
                "--bind",
                "127.0.0.1",
                "--control-port",
                &control_port.to_string(),
                "--stun-port",
                &stun_port.to_string(),
                "--poll-timeout-ms",
                "100",
            ])
            .args(extra)
            .env("RUST_LOG", "debug")
            .stdout(Stdio::null())
            .spawn()?;

        // Give the coordinator time to bind
        thread::sleep(Duration::from_millis(300));

        if let Some(status) = child.try_wait()? {
            return Err(format!("coordinator exited early: {}", status).into());
        }

        Ok(ServerProcess {
            child,
            control_port,
            stun_port,
        })
    }

    fn control_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.control_port))
    }

    fn stun_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.stun_port))
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Blocking control connection that reads whole frames
struct Control {
    stream: TcpStream,
    frames: FrameBuffer,
}

impl Control {
    fn connect(addr: SocketAddr) -> Option<Self> {
        let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT).ok()?;
        stream.set_read_timeout(Some(IO_TIMEOUT)).ok()?;
        Some(Control {
            stream,
            frames: FrameBuffer::new(RECV_BUFFER_SIZE),
        })
    }

    fn send(&mut self, msg: &Message) {
        self.stream.write_all(&encode_to_vec(msg).unwrap()).unwrap();
    }

    fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(frame) = self.frames.next_frame() {
                return frame.ok();
            }
            match self.stream.read(self.frames.free_tail()) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.frames.commit(n),
            }
        }
    }
}

fn entry(n: u8) -> PeerConnected {
    PeerConnected::new(
        SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, n), 40000 + n as u16),
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, n), 50000 + n as u16),
    )
}

#[test]
fn test_stun_binding() {
    let server = match ServerProcess::start(18180, 18181) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "Failed to start coordinator (expected in some CI environments): {}",
                e
            );
            return;
        }
    };

    let socket = match UdpSocket::bind("127.0.0.1:0") {
        Ok(s) => s,
        Err(_) => {
            println!("Could not bind UDP socket, skipping test");
            return;
        }
    };
    socket.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let local = socket.local_addr().unwrap();

    let request = encode_to_vec(&Message::StunRequest).unwrap();
    let mut buf = [0u8; 2048];
    let mut response = None;

    // Retry like a peer would in case the first datagram races startup
    for _ in 0..5 {
        socket.send_to(&request, server.stun_addr()).unwrap();
        if let Ok((len, from)) = socket.recv_from(&mut buf) {
            assert_eq!(from, server.stun_addr());
            response = Some(decode(&buf[..len]).unwrap());
            break;
        }
    }

    match response {
        Some(Message::StunResponse { address, port }) => {
            assert_eq!(address, u32::from(Ipv4Addr::LOCALHOST));
            assert_eq!(port, local.port());
        }
        other => panic!("Expected STUN response, got {:?}", other),
    }

    // Garbage and keep-alives get no reply; a later request still works
    socket.send_to(b"not a frame", server.stun_addr()).unwrap();
    socket
        .send_to(&encode_to_vec(&Message::KeepAlive).unwrap(), server.stun_addr())
        .unwrap();
    socket.send_to(&request, server.stun_addr()).unwrap();
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    assert!(matches!(
        decode(&buf[..len]).unwrap(),
        Message::StunResponse { .. }
    ));
}

#[test]
fn test_peer_list_fanout() {
    let server = match ServerProcess::start(18190, 18191) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "Failed to start coordinator (expected in some CI environments): {}",
                e
            );
            return;
        }
    };

    let Some(mut p1) = Control::connect(server.control_addr()) else {
        println!("Could not connect to coordinator, skipping test");
        return;
    };

    // First peer learns there is nobody else yet
    p1.send(&Message::Connect(entry(1)));
    assert_eq!(p1.recv(), Some(Message::PeersToConnect(vec![])));

    let mut p2 = Control::connect(server.control_addr()).unwrap();
    p2.send(&Message::Connect(entry(2)));
    assert_eq!(p2.recv(), Some(Message::PeersToConnect(vec![entry(1)])));
    assert_eq!(p1.recv(), Some(Message::PeersToConnect(vec![entry(2)])));

    // Messages that are not announces are ignored on the control channel
    p2.send(&Message::StunRequest);

    // A departed peer is no longer listed
    drop(p1);
    thread::sleep(Duration::from_millis(300));

    let mut p3 = Control::connect(server.control_addr()).unwrap();
    p3.send(&Message::Connect(entry(3)));
    assert_eq!(p3.recv(), Some(Message::PeersToConnect(vec![entry(2)])));
    assert_eq!(p2.recv(), Some(Message::PeersToConnect(vec![entry(3)])));
}

#[test]
fn test_garbage_before_announce_is_skipped() {
    let server = match ServerProcess::start(18200, 18201) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "Failed to start coordinator (expected in some CI environments): {}",
                e
            );
            return;
        }
    };

    let Some(mut peer) = Control::connect(server.control_addr()) else {
        println!("Could not connect to coordinator, skipping test");
        return;
    };

    let mut bytes = vec![0xde, 0xad, 0xbe, 0xef];
    bytes.extend(encode_to_vec(&Message::Connect(entry(9))).unwrap());
    // Deliver the announce split across two writes
    peer.stream.write_all(&bytes[..10]).unwrap();
    thread::sleep(Duration::from_millis(50));
    peer.stream.write_all(&bytes[10..]).unwrap();

    assert_eq!(peer.recv(), Some(Message::PeersToConnect(vec![])));
}

#[test]
fn test_idle_peer_is_dropped() {
    let server = match ServerProcess::start_with(18210, 18211, &["--idle-timeout-secs", "1"]) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "Failed to start coordinator (expected in some CI environments): {}",
                e
            );
            return;
        }
    };

    let Some(mut p1) = Control::connect(server.control_addr()) else {
        println!("Could not connect to coordinator, skipping test");
        return;
    };
    p1.send(&Message::Connect(entry(1)));
    assert_eq!(p1.recv(), Some(Message::PeersToConnect(vec![])));

    // P1 stays silent; the coordinator closes it once the timeout runs out
    p1.stream
        .set_read_timeout(Some(Duration::from_secs(4)))
        .unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(p1.stream.read(&mut buf).unwrap(), 0);

    // The expired peer is gone from the address table
    let mut p2 = Control::connect(server.control_addr()).unwrap();
    p2.send(&Message::Connect(entry(2)));
    assert_eq!(p2.recv(), Some(Message::PeersToConnect(vec![])));
}
