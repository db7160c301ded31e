//! SOCKS5-UDP address header codec
//!
//! The relay's inner packet starts with `ATYP | DST.ADDR | DST.PORT`,
//! shared between the SOCKS5 UDP request (after the 3-byte RSV/FRAG
//! prefix) and the encrypted relay envelope.

use std::net::{IpAddr, SocketAddr};

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

/// RSV (2 bytes) + FRAG (1 byte)
pub const SOCKS_UDP_PREFIX_LEN: usize = 3;

/// ATYP + length-prefixed hostname + port
pub const MAX_ADDR_HEADER_SIZE: usize = 1 + 1 + 255 + 2;

/// Destination named by a SOCKS5-UDP header. Domain strings that are
/// really IP literals are converted on parse, so `Domain` always needs
/// a resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Parse an address header at the start of `buf`. Returns the
    /// target and the header length, or `None` for an unknown ATYP,
    /// a truncated header or a malformed hostname.
    pub fn parse(buf: &[u8]) -> Option<(TargetAddr, usize)> {
        let atyp = *buf.first()?;
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return None;
                }
                let octets: [u8; 4] = buf[1..5].try_into().ok()?;
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Some((TargetAddr::Ip(SocketAddr::from((octets, port))), 7))
            }
            ATYP_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return None;
                }
                let octets: [u8; 16] = buf[1..17].try_into().ok()?;
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Some((TargetAddr::Ip(SocketAddr::from((octets, port))), 19))
            }
            ATYP_DOMAIN => {
                let name_len = *buf.get(1)? as usize;
                if buf.len() < 2 + name_len + 2 {
                    return None;
                }
                let name = std::str::from_utf8(&buf[2..2 + name_len]).ok()?;
                let port = u16::from_be_bytes([buf[2 + name_len], buf[3 + name_len]]);

                // IP literals hidden in the domain slot short-circuit
                // resolution
                let target = match name.parse::<IpAddr>() {
                    Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
                    Err(_) => TargetAddr::Domain(name.to_string(), port),
                };
                Some((target, 2 + name_len + 2))
            }
            _ => None,
        }
    }

    /// Append the wire form of this target to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(name, port) => {
                debug_assert!(name.len() <= 255);
                out.push(ATYP_DOMAIN);
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn round_trip(target: TargetAddr) {
        let mut wire = Vec::new();
        target.write(&mut wire);
        wire.extend_from_slice(b"payload");

        let (parsed, len) = TargetAddr::parse(&wire).unwrap();
        assert_eq!(parsed, target);
        assert_eq!(&wire[len..], b"payload");
    }

    #[test]
    fn ipv4_round_trip() {
        round_trip(TargetAddr::Ip(SocketAddr::from((Ipv4Addr::new(192, 168, 1, 10), 53))));
    }

    #[test]
    fn ipv6_round_trip() {
        round_trip(TargetAddr::Ip(SocketAddr::from((Ipv6Addr::LOCALHOST, 8053))));
    }

    #[test]
    fn domain_round_trip() {
        round_trip(TargetAddr::Domain("example.com".into(), 443));
    }

    #[test]
    fn domain_ip_literal_collapses() {
        let mut wire = Vec::new();
        TargetAddr::Domain("10.1.2.3".into(), 80).write(&mut wire);
        let (parsed, _) = TargetAddr::parse(&wire).unwrap();
        assert_eq!(parsed, TargetAddr::Ip(SocketAddr::from((Ipv4Addr::new(10, 1, 2, 3), 80))));
    }

    #[test]
    fn truncated_headers_fail() {
        assert!(TargetAddr::parse(&[]).is_none());
        assert!(TargetAddr::parse(&[ATYP_IPV4, 1, 2, 3]).is_none());
        assert!(TargetAddr::parse(&[ATYP_IPV6, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(TargetAddr::parse(&[ATYP_DOMAIN, 5, b'a', b'b']).is_none());
        assert!(TargetAddr::parse(&[9, 0, 0, 0, 0, 0, 0]).is_none());
    }
}
