//! Address utilities.
//!
//! Every address the engine stores is normalized first: v4-mapped v6
//! addresses are unwrapped to native v4 so that a dual-stack socket and a
//! v4-only socket agree on path identity.

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// Parse a literal IP address. No DNS.
pub fn parse_ip(s: &str) -> Result<IpAddr> {
    s.parse()
        .map_err(|_| Error::InvalidAddress(format!("not an IP literal: {s}")))
}

/// Unwrap a v4-mapped v6 address to native v4.
pub fn unmap_v4_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// Unwrap a v4-mapped v6 socket address to native v4, preserving the port.
pub fn unmap_v4_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(unmap_v4_ip(addr.ip()), addr.port())
}

/// Whether a local IP and a remote socket address share a family.
pub fn same_family(local: IpAddr, remote: &SocketAddr) -> bool {
    local.is_ipv4() == remote.ip().is_ipv4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_literals() {
        assert!(parse_ip("10.0.0.1").unwrap().is_ipv4());
        assert!(parse_ip("::1").unwrap().is_ipv6());
        assert!(parse_ip("example.com").is_err());
        assert!(parse_ip("").is_err());
    }

    #[test]
    fn test_unmap_v4_mapped() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:4000".parse().unwrap();
        let unmapped = unmap_v4_addr(mapped);
        assert_eq!(unmapped, "192.0.2.1:4000".parse().unwrap());
    }

    #[test]
    fn test_unmap_leaves_native_alone() {
        let v4: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        assert_eq!(unmap_v4_addr(v4), v4);

        let v6: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        assert_eq!(unmap_v4_addr(v6), v6);
    }

    #[test]
    fn test_same_family() {
        let v4 = "10.0.0.1".parse().unwrap();
        let v6 = "2001:db8::1".parse().unwrap();
        let r4: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let r6: SocketAddr = "[2001:db8::2]:5000".parse().unwrap();

        assert!(same_family(v4, &r4));
        assert!(same_family(v6, &r6));
        assert!(!same_family(v4, &r6));
        assert!(!same_family(v6, &r4));
    }
}
