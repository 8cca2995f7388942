//! Direction-agnostic flow identity

use crate::packet::{Packet, Protocol};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A transport flow keyed by its sorted endpoint pair, so both directions of
/// one connection map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Transport protocol
    pub protocol: Protocol,
    /// Lower endpoint
    pub a: SocketAddr,
    /// Higher endpoint
    pub b: SocketAddr,
}

impl FlowKey {
    /// Build from two endpoints in any order
    pub fn new(protocol: Protocol, x: SocketAddr, y: SocketAddr) -> Self {
        let (a, b) = if (x.ip(), x.port()) <= (y.ip(), y.port()) { (x, y) } else { (y, x) };
        Self { protocol, a, b }
    }

    /// Key of a parsed packet
    pub fn of(packet: &Packet) -> Self {
        Self::new(
            packet.protocol,
            SocketAddr::new(packet.src_addr, packet.src_port),
            SocketAddr::new(packet.dst_addr, packet.dst_port),
        )
    }

    /// Whether either endpoint has this address
    pub fn involves(&self, ip: IpAddr) -> bool {
        self.a.ip() == ip || self.b.ip() == ip
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol, self.a, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_key_is_direction_agnostic() {
        let client: SocketAddr = "10.0.0.2:50000".parse().unwrap();
        let server: SocketAddr = "93.184.216.34:443".parse().unwrap();
        assert_eq!(
            FlowKey::new(Protocol::Tcp, client, server),
            FlowKey::new(Protocol::Tcp, server, client)
        );
        assert_ne!(
            FlowKey::new(Protocol::Tcp, client, server),
            FlowKey::new(Protocol::Udp, client, server)
        );
    }

    #[test]
    fn test_flow_key_involves() {
        let key = FlowKey::new(
            Protocol::Tcp,
            "10.0.0.2:1".parse().unwrap(),
            "10.0.0.3:2".parse().unwrap(),
        );
        assert!(key.involves("10.0.0.3".parse().unwrap()));
        assert!(!key.involves("10.0.0.4".parse().unwrap()));
    }
}
