//! UDP transport to the remote peer.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::Result;
use crate::net::Endpoint;

/// Largest datagram the transport will carry.
pub const MAX_DATAGRAM: usize = 65_535;

/// UDP socket connected to the remote peer of the tunnel.
///
/// Connecting the socket means datagrams from any other source are filtered
/// by the kernel.
#[derive(Debug)]
pub struct Transport {
    sock: UdpSocket,
    peer: SocketAddr,
}

impl Transport {
    /// Binds a non-blocking UDP socket to `port` on the wildcard address of
    /// the peer's address family and connects it to `peer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound, connected, or set to
    /// non-blocking.
    pub fn bind(port: u16, peer: SocketAddr) -> Result<Self> {
        let local = match peer {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        };

        Self::from_socket(UdpSocket::bind(local)?, peer)
    }

    /// Wraps an already bound socket, connecting it to `peer` and setting it
    /// to non-blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be connected or set to
    /// non-blocking.
    pub fn from_socket(sock: UdpSocket, peer: SocketAddr) -> Result<Self> {
        sock.connect(peer)?;
        sock.set_nonblocking(true)?;

        Ok(Self { sock, peer })
    }

    /// Returns the local address the socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be queried.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Returns the address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Endpoint for Transport {
    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.sock.recv(buf)?)
    }

    fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.sock.send(buf)?)
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}
