//! Peer address resolution

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use tracing::debug;

use crate::error::{Error, Result};

/// Resolve `host` (a literal IPv4/IPv6 address or a host name) to a socket
/// address on `port`.
///
/// Literal addresses never touch the resolver. Among resolved addresses
/// IPv4 is preferred.
pub fn resolve_peer(host: &str, port: u16) -> Result<SocketAddr> {
    let trimmed = host.trim();
    let literal = trimmed.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    if trimmed.is_empty() {
        return Err(Error::InvalidPeerAddress(host.to_string()));
    }

    let resolved: Vec<SocketAddr> = (trimmed, port)
        .to_socket_addrs()
        .map_err(|_| Error::InvalidPeerAddress(host.to_string()))?
        .collect();

    let addr = resolved
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| Error::InvalidPeerAddress(host.to_string()))?;

    debug!(host = trimmed, %addr, "Resolved peer address");
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_ipv4() {
        let addr = resolve_peer("192.168.1.20", 4464).unwrap();
        assert_eq!(addr, "192.168.1.20:4464".parse().unwrap());
    }

    #[test]
    fn test_literal_ipv6() {
        let addr = resolve_peer("[::1]", 4464).unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 4464);

        let addr = resolve_peer("fe80::1", 1).unwrap();
        assert!(addr.is_ipv6());
    }

    #[test]
    fn test_localhost_resolves() {
        let addr = resolve_peer("localhost", 4464).unwrap();
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            resolve_peer("", 4464),
            Err(Error::InvalidPeerAddress(_))
        ));
        assert!(matches!(
            resolve_peer("not a host name!", 4464),
            Err(Error::InvalidPeerAddress(_))
        ));
    }
}
