//! Listening socket setup and `accept`.
//!
//! Grounded on `net.c`'s `net_listen`/`net_accept`, using `socket2` (the
//! crate `net-addresses`, the sibling binary in this same author's
//! workspace, reaches for when it needs precise control over socket
//! construction that `std::net` doesn't expose — here, `IPV6_V6ONLY` and
//! an exact backlog of 8) layered under `std::net::TcpStream` for the
//! connection itself, matching `core.rs`'s `BaseTcpServer`.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

/// Backlog used for both address families, matching `net_listen`'s
/// `listen(sockfd, 8)`.
pub const BACKLOG: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        }
    }
}

/// One bound, listening socket for a single address family.
pub struct Listener {
    socket: Socket,
    pub family: Family,
}

impl Listener {
    /// Binds `INADDR_ANY`/`in6addr_any` on `port`. IPv6 sockets are made
    /// v6-only so IPv4 and IPv6 can share the same port number via two
    /// independent sockets, per spec.md §4.1.
    pub fn bind(family: Family, port: u16) -> io::Result<Self> {
        let domain = match family {
            Family::V4 => Domain::IPV4,
            Family::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        if family == Family::V6 {
            socket.set_only_v6(true)?;
        }

        let addr: SocketAddr = match family {
            Family::V4 => (Ipv4Addr::UNSPECIFIED, port).into(),
            Family::V6 => (Ipv6Addr::UNSPECIFIED, port).into(),
        };
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;

        Ok(Self { socket, family })
    }

    /// Accepts one connection, returning the connected stream and the
    /// peer's address.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (sock, addr) = self.socket.accept()?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address"))?;
        Ok((sock.into(), addr))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// The address this socket is actually bound to — useful when binding
    /// to port 0 and needing to know which ephemeral port the kernel
    /// picked (e.g. so a test can connect back to it).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP local address"))
    }
}

/// Closes a raw fd directly, for closing the sibling family's listening
/// socket (or this worker's own, in its forked request handler) right
/// after `fork()`, matching `BaseTcpServer::close_listener`/
/// `worker.c`'s `close(sockfd)`.
pub fn close_raw(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Renders a peer address the way `request_log` does: dotted-quad for
/// IPv4, `[compressed-v6]` (bracketed) for IPv6.
pub fn format_ip_port(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(a) => format!("{}:{}", a.ip(), a.port()),
        SocketAddr::V6(a) => format!("[{}]:{}", a.ip(), a.port()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn v4_format_is_dotted_quad() {
        let addr = SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 54321);
        assert_eq!(format_ip_port(&addr), "127.0.0.1:54321");
    }

    #[test]
    fn v6_format_has_brackets() {
        let addr = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 443);
        assert_eq!(format_ip_port(&addr), "[::1]:443");
    }
}
