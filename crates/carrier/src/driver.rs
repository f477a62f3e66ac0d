use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use log::debug;

use crate::config::DriverConfig;
use crate::protocol::MAX_DATAGRAM_SIZE;

/// The OS side of the transport: an unconnected, non-blocking datagram
/// socket.
pub trait SocketDriver: Send {
    fn local_addr(&self) -> SocketAddr;

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Returns `Ok(None)` when nothing is waiting.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn max_datagram_size(&self) -> usize {
        MAX_DATAGRAM_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

pub fn broadcast_address(family: AddressFamily) -> IpAddr {
    match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::BROADCAST),
        // All-nodes link-local multicast stands in for broadcast on IPv6.
        AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)),
    }
}

/// Resolves `host` (name or literal), preferring an IPv4 result.
pub fn resolve_address(host: &str, port: u16) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}", host),
            )
        })
}

#[derive(Debug)]
pub struct UdpDriver {
    socket: UdpSocket,
    local_addr: SocketAddr,
    max_datagram_size: usize,
}

impl UdpDriver {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: &DriverConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        if config.broadcast {
            socket.set_broadcast(true)?;
        }
        if let Some(ttl) = config.ttl {
            socket.set_ttl(ttl)?;
        }

        let local_addr = socket.local_addr()?;
        debug!("udp driver bound to {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            max_datagram_size: config.max_datagram_size,
        })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

impl SocketDriver for UdpDriver {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.send_to(data, addr) {
            Ok(bytes) => Ok(bytes),
            // A full send buffer is indistinguishable from loss on the wire.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("send buffer full, dropping datagram to {}", addr);
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((size, addr)) => return Ok(Some((size, addr))),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // ICMP port unreachable from an earlier send.
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn max_datagram_size(&self) -> usize {
        self.max_datagram_size
    }
}
