//! Where an intercepted connection was headed.
//!
//! Connections arrive through a NAT `REDIRECT` rule, so the socket's local
//! address is the proxy itself. The pre-redirection destination is read
//! back from conntrack with `SO_ORIGINAL_DST` (`IP6T_SO_ORIGINAL_DST` for
//! IPv6).

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream};

use nix::sys::socket::{getsockopt, sockopt};

/// Resolves the upstream address for an accepted connection.
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, stream: &TcpStream) -> io::Result<SocketAddr>;
}

/// Reads the original destination from the kernel's redirection metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalDestination;

impl DestinationResolver for OriginalDestination {
    fn resolve(&self, stream: &TcpStream) -> io::Result<SocketAddr> {
        if stream.local_addr()?.is_ipv6() {
            let addr = getsockopt(stream, sockopt::Ip6tOriginalDst).map_err(io::Error::from)?;
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        } else {
            let addr = getsockopt(stream, sockopt::OriginalDst).map_err(io::Error::from)?;
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
    }
}

/// Sends every connection to one address, for setups without NAT.
#[derive(Debug, Clone, Copy)]
pub struct FixedDestination(pub SocketAddr);

impl DestinationResolver for FixedDestination {
    fn resolve(&self, _stream: &TcpStream) -> io::Result<SocketAddr> {
        Ok(self.0)
    }
}
