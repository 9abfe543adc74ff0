//! The single UDP socket every [`crate::session::Session`] sends and
//! receives through.

use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

/// Half of whatever the OS reports as its maximum socket receive buffer, or a
/// conservative fallback if that can't be discovered. Matches the crate's
/// "raise SO_RCVBUF where discoverable" policy; failure to raise it is not
/// fatal, just logged.
const FALLBACK_RCVBUF: usize = 1 << 20;

/// Owns the process-wide dual-stack UDP socket used by every session.
pub struct Transport {
    socket: UdpSocket,
    max_pending: usize,
}

impl Transport {
    /// Bind a dual-stack (`[::]:port`) UDP socket and attempt to raise its
    /// receive buffer.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((IpAddr::from([0u16; 8]), port))?;
        socket.set_nonblocking(true)?;

        let rcvbuf = Self::raise_rcvbuf(&socket).unwrap_or(FALLBACK_RCVBUF);
        let max_pending = (rcvbuf / 1000).max(1);

        Ok(Self {
            socket,
            max_pending,
        })
    }

    fn raise_rcvbuf(socket: &UdpSocket) -> Option<usize> {
        use nix::sys::socket::{getsockopt, setsockopt, sockopt::RcvBuf};

        let fd = socket.as_raw_fd();
        let max = match getsockopt(fd, RcvBuf) {
            Ok(current) => current.max(FALLBACK_RCVBUF),
            Err(e) => {
                log::warn!("could not read current SO_RCVBUF: {e}");
                return None;
            }
        };

        let target = max / 2;
        if let Err(e) = setsockopt(fd, RcvBuf, &target) {
            log::warn!("could not raise SO_RCVBUF to {target}: {e}");
            return None;
        }

        getsockopt(fd, RcvBuf).ok()
    }

    /// The number of in-flight submissions this transport's buffer can
    /// absorb before callers should block and let replies drain.
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Resolve `host:port` to a socket address, mapping a resolved IPv4
    /// address into v4-mapped-v6 form so it can be reached through this
    /// socket's single IPv6-bound address family.
    pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
        let resolved = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses for host"))?;

        Ok(match resolved {
            SocketAddr::V4(v4) => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            v6 => v6,
        })
    }

    pub fn send_to(&self, peer: SocketAddr, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, peer)?;
        Ok(())
    }

    /// Drain one datagram off the socket, if one is ready. `Ok(None)` means
    /// the socket would block (nothing pending right now).
    pub fn try_recv(&self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buf = [0u8; 1600];
        match self.socket.recv_from(&mut buf) {
            Ok((n, peer)) => Ok(Some((buf[..n].to_vec(), peer))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}
