//! Self-describing network addresses
//!
//! Textual form is a sequence of `/name/value` components, e.g.
//! `/ip4/127.0.0.1/tcp/4001/p2p/Qm…` or `/p2p-circuit/p2p/Qm…`.

use crate::error::{Error, Result};
use crate::identity::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// A single multiaddr component
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns4(String),
    Dns6(String),
    Tcp(u16),
    Udp(u16),
    Utp,
    Ws,
    Wss,
    P2pWebrtcStar,
    P2pCircuit,
    /// In-process transport port
    Memory(u64),
    /// Embedded peer id (`/p2p/` or the legacy `/ipfs/`)
    P2p(PeerId),
}

impl Protocol {
    /// Component name as written in the textual form
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Dns4(_) => "dns4",
            Protocol::Dns6(_) => "dns6",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::Utp => "utp",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::P2pWebrtcStar => "p2p-webrtc-star",
            Protocol::P2pCircuit => "p2p-circuit",
            Protocol::Memory(_) => "memory",
            Protocol::P2p(_) => "p2p",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name())?;
        match self {
            Protocol::Ip4(ip) => write!(f, "/{ip}"),
            Protocol::Ip6(ip) => write!(f, "/{ip}"),
            Protocol::Dns4(host) | Protocol::Dns6(host) => write!(f, "/{host}"),
            Protocol::Tcp(port) | Protocol::Udp(port) => write!(f, "/{port}"),
            Protocol::Memory(port) => write!(f, "/{port}"),
            Protocol::P2p(id) => write!(f, "/{id}"),
            Protocol::Utp
            | Protocol::Ws
            | Protocol::Wss
            | Protocol::P2pWebrtcStar
            | Protocol::P2pCircuit => Ok(()),
        }
    }
}

/// Parsed multiaddr
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Multiaddr(Vec<Protocol>);

impl Multiaddr {
    /// Empty address
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Circuit address for reaching `peer` through any relay
    pub fn circuit(peer: &PeerId) -> Self {
        Self(vec![Protocol::P2pCircuit, Protocol::P2p(*peer)])
    }

    /// Append a component
    pub fn push(&mut self, protocol: Protocol) {
        self.0.push(protocol);
    }

    /// Builder-style append
    pub fn with(mut self, protocol: Protocol) -> Self {
        self.0.push(protocol);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.0.iter()
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last embedded peer id, if any
    pub fn peer_id(&self) -> Option<PeerId> {
        self.0.iter().rev().find_map(|p| match p {
            Protocol::P2p(id) => Some(*id),
            _ => None,
        })
    }

    /// Drop a trailing `/p2p/<id>` component (peer ids are not dialable)
    pub fn without_peer_id(&self) -> Multiaddr {
        match self.0.last() {
            Some(Protocol::P2p(_)) => Self(self.0[..self.0.len() - 1].to_vec()),
            _ => self.clone(),
        }
    }

    /// Whether this address routes through a circuit relay
    pub fn is_circuit(&self) -> bool {
        self.0.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    /// Split `<relay>/p2p-circuit/<destination>` into its two halves
    pub fn split_circuit(&self) -> Option<(Multiaddr, Multiaddr)> {
        let pos = self
            .0
            .iter()
            .position(|p| matches!(p, Protocol::P2pCircuit))?;
        Some((Self(self.0[..pos].to_vec()), Self(self.0[pos + 1..].to_vec())))
    }

    /// Socket address of an `/ip{4,6}/…/tcp/…` address (trailing peer id allowed)
    pub fn tcp_socket_addr(&self) -> Option<SocketAddr> {
        match self.without_peer_id().protocols() {
            [Protocol::Ip4(ip), Protocol::Tcp(port)] => {
                Some(SocketAddr::new(IpAddr::V4(*ip), *port))
            }
            [Protocol::Ip6(ip), Protocol::Tcp(port)] => {
                Some(SocketAddr::new(IpAddr::V6(*ip), *port))
            }
            _ => None,
        }
    }

    /// Multiaddr of a TCP socket address
    pub fn from_tcp(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Self(vec![ip, Protocol::Tcp(addr.port())])
    }
}

fn next_value<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    addr: &str,
    name: &str,
) -> Result<&'a str> {
    parts
        .next()
        .ok_or_else(|| Error::multiaddr(addr, format!("missing value for /{name}")))
}

fn parse_value<T: FromStr>(value: &str, addr: &str, name: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::multiaddr(addr, format!("bad /{name} value {value:?}")))
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if !s.starts_with('/') {
            return Err(Error::multiaddr(s, "must start with '/'"));
        }

        // Empty segments are tolerated ("//ip4/…")
        let mut parts = s.split('/').filter(|p| !p.is_empty());
        let mut protocols = Vec::new();

        while let Some(name) = parts.next() {
            let protocol = match name {
                "ip4" => Protocol::Ip4(parse_value(next_value(&mut parts, s, name)?, s, name)?),
                "ip6" => Protocol::Ip6(parse_value(next_value(&mut parts, s, name)?, s, name)?),
                "dns4" => Protocol::Dns4(next_value(&mut parts, s, name)?.to_string()),
                "dns6" => Protocol::Dns6(next_value(&mut parts, s, name)?.to_string()),
                "tcp" => Protocol::Tcp(parse_value(next_value(&mut parts, s, name)?, s, name)?),
                "udp" => Protocol::Udp(parse_value(next_value(&mut parts, s, name)?, s, name)?),
                "memory" => {
                    Protocol::Memory(parse_value(next_value(&mut parts, s, name)?, s, name)?)
                }
                "p2p" | "ipfs" => {
                    let value = next_value(&mut parts, s, name)?;
                    let id = PeerId::from_base58(value)
                        .map_err(|_| Error::multiaddr(s, format!("bad peer id {value:?}")))?;
                    Protocol::P2p(id)
                }
                "utp" => Protocol::Utp,
                "ws" => Protocol::Ws,
                "wss" => Protocol::Wss,
                "p2p-webrtc-star" => Protocol::P2pWebrtcStar,
                "p2p-circuit" => Protocol::P2pCircuit,
                other => return Err(Error::multiaddr(s, format!("unknown protocol {other:?}"))),
            };
            protocols.push(protocol);
        }

        if protocols.is_empty() {
            return Err(Error::multiaddr(s, "no components"));
        }
        Ok(Self(protocols))
    }
}

impl TryFrom<String> for Multiaddr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Multiaddr> for String {
    fn from(addr: Multiaddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for protocol in &self.0 {
            write!(f, "{protocol}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiaddr({self})")
    }
}

impl FromIterator<Protocol> for Multiaddr {
    fn from_iter<I: IntoIterator<Item = Protocol>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_display() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9090/ws".parse().unwrap();
        assert_eq!(addr.len(), 3);
        assert_eq!(addr.to_string(), "/ip4/127.0.0.1/tcp/9090/ws");

        let star: Multiaddr = "/ip4/1.2.3.4/tcp/3456/ws/p2p-webrtc-star".parse().unwrap();
        assert_eq!(star.protocols().last(), Some(&Protocol::P2pWebrtcStar));
    }

    #[test]
    fn test_legacy_ipfs_component() {
        let id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/ipfs/{id}").parse().unwrap();

        assert_eq!(addr.peer_id(), Some(id));
        assert_eq!(addr.to_string(), format!("/ip4/127.0.0.1/tcp/4001/p2p/{id}"));
        assert_eq!(addr.without_peer_id().to_string(), "/ip4/127.0.0.1/tcp/4001");
    }

    #[test]
    fn test_parse_errors() {
        assert!("ip4/127.0.0.1".parse::<Multiaddr>().is_err());
        assert!("/ip4/300.0.0.1".parse::<Multiaddr>().is_err());
        assert!("/tcp".parse::<Multiaddr>().is_err());
        assert!("/bogus/1".parse::<Multiaddr>().is_err());
        assert!("/p2p/Qm123".parse::<Multiaddr>().is_err());
        assert!("/".parse::<Multiaddr>().is_err());
    }

    #[test]
    fn test_circuit_split() {
        let relay = PeerId::random();
        let dst = PeerId::random();
        let addr: Multiaddr = format!("/memory/7/p2p/{relay}/p2p-circuit/p2p/{dst}")
            .parse()
            .unwrap();

        assert!(addr.is_circuit());
        let (relay_part, dst_part) = addr.split_circuit().unwrap();
        assert_eq!(relay_part.peer_id(), Some(relay));
        assert_eq!(dst_part.peer_id(), Some(dst));

        let bare = Multiaddr::circuit(&dst);
        let (relay_part, _) = bare.split_circuit().unwrap();
        assert!(relay_part.is_empty());
    }

    #[test]
    fn test_tcp_socket_addr() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/80".parse().unwrap();
        let sock = addr.tcp_socket_addr().unwrap();
        assert_eq!(sock.port(), 80);
        assert_eq!(Multiaddr::from_tcp(sock), addr);

        let ws: Multiaddr = "/ip4/10.0.0.1/tcp/80/ws".parse().unwrap();
        assert!(ws.tcp_socket_addr().is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let addr: Multiaddr = "/memory/42".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"/memory/42\"");
        let back: Multiaddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
