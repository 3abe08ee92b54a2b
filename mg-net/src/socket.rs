//! Non-blocking UDP sockets
//!
//! One socket per address family. Construction goes through `socket2` so
//! options are set before binding: non-blocking mode always, and
//! `IPV6_V6ONLY` on IPv6 listeners so both families can share a port
//! number. I/O runs on the plain std socket.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use thiserror::Error;

use mg_protocol::{Buffer, MAX_PACKET_SIZE};

use crate::endpoint::{Endpoint, Family};

/// Errors surfaced by socket calls
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// The socket is unusable
    #[error("socket is invalid")]
    InvalidSocket,

    /// Nothing to read; ends the drain loop
    #[error("no datagram available")]
    Discard,

    /// The OS call failed
    #[error("socket call failed")]
    CallFailure,
}

/// One received or outgoing datagram
#[derive(Debug)]
pub struct Packet {
    /// Source (or destination) of the datagram
    pub remote: Endpoint,
    /// Datagram bytes
    pub payload: Buffer,
}

/// A bound, non-blocking UDP endpoint for one address family
#[derive(Debug)]
pub struct Socket {
    inner: UdpSocket,
    family: Family,
    port: u16,
}

impl Socket {
    /// Bind to the unspecified address on `port` (0 lets the OS pick)
    pub fn bind(family: Family, port: u16) -> crate::Result<Self> {
        let (domain, addr): (Domain, SocketAddr) = match family {
            Family::V4 => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, port).into()),
            Family::V6 => (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, port).into()),
        };

        let socket = RawSocket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        if family == Family::V6 {
            socket.set_only_v6(true)?;
        }
        socket.bind(&addr.into())?;

        let inner: UdpSocket = socket.into();
        let port = inner.local_addr()?.port();

        Ok(Self {
            inner,
            family,
            port,
        })
    }

    /// Address family this socket serves
    pub fn family(&self) -> Family {
        self.family
    }

    /// Port the socket is bound to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Receive one datagram.
    ///
    /// `Discard` means the OS buffer is empty; the caller ends its drain
    /// loop. No call ever blocks.
    pub fn receive(&self) -> std::result::Result<Packet, SocketError> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        match self.inner.recv_from(&mut buf) {
            Ok((len, remote)) => Ok(Packet {
                remote: Endpoint::new(remote),
                payload: Buffer::from_slice(&buf[..len]),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(SocketError::Discard),
            Err(_) => Err(SocketError::CallFailure),
        }
    }

    /// Send one datagram. Failures are reported, never retried.
    pub fn send(&self, remote: &Endpoint, payload: &[u8]) -> bool {
        if remote.family() != self.family || payload.len() > MAX_PACKET_SIZE {
            return false;
        }
        self.inner.send_to(payload, remote.addr()).is_ok()
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for Socket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let socket = Socket::bind(Family::V4, 0).unwrap();
        assert!(socket.port() > 0);
        assert_eq!(socket.family(), Family::V4);
    }

    #[test]
    fn test_receive_empty_is_discard() {
        let socket = Socket::bind(Family::V4, 0).unwrap();
        assert!(matches!(socket.receive(), Err(SocketError::Discard)));
    }

    #[test]
    fn test_send_receive_loopback() {
        let receiver = Socket::bind(Family::V4, 0).unwrap();
        let sender = Socket::bind(Family::V4, 0).unwrap();
        let target: Endpoint = format!("127.0.0.1:{}", receiver.port()).parse().unwrap();

        assert!(sender.send(&target, b"hello"));

        // loopback delivery can lag the send call
        let mut received = None;
        for _ in 0..50 {
            match receiver.receive() {
                Ok(packet) => {
                    received = Some(packet);
                    break;
                }
                Err(SocketError::Discard) => {
                    std::thread::sleep(std::time::Duration::from_millis(2))
                }
                Err(e) => panic!("receive failed: {e}"),
            }
        }

        let packet = received.expect("datagram not delivered");
        assert_eq!(packet.payload.as_slice(), b"hello");
        assert_eq!(packet.remote.port(), sender.port());
    }

    #[test]
    fn test_send_rejects_family_mismatch() {
        let socket = Socket::bind(Family::V4, 0).unwrap();
        let v6_target: Endpoint = "[::1]:9000".parse().unwrap();
        assert!(!socket.send(&v6_target, b"nope"));
    }

    #[test]
    fn test_send_rejects_oversized_datagram() {
        let socket = Socket::bind(Family::V4, 0).unwrap();
        let target: Endpoint = "127.0.0.1:9000".parse().unwrap();
        assert!(!socket.send(&target, &[0u8; MAX_PACKET_SIZE + 1]));
    }

    #[test]
    fn test_shared_port_across_families() {
        let v4 = Socket::bind(Family::V4, 0).unwrap();
        let v6 = Socket::bind(Family::V6, v4.port());
        // hosts without IPv6 cannot run this check
        if let Ok(v6) = v6 {
            assert_eq!(v4.port(), v6.port());
        }
    }
}
