//! Platform-agnostic capture interface
//!
//! The traffic engine only talks to [`PacketCapture`]; the WinDivert driver
//! is one implementation and tests use the generated mock.

use crate::Result;
use dpiscope_core::packet::{Direction, Packet};

/// Packet capture and injection interface
#[cfg_attr(test, mockall::automock)]
pub trait PacketCapture: Send {
    /// Receive a packet from the network stack
    ///
    /// Blocks until a packet is available or the handle is shut down.
    fn recv(&mut self) -> Result<CapturedPacket>;

    /// Send/inject a packet
    fn send(&mut self, packet: &[u8], addr: &PacketAddress) -> Result<()>;

    /// Close the capture handle
    fn close(&mut self) -> Result<()>;
}

/// A captured packet with metadata
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    /// Raw packet data
    pub data: Vec<u8>,
    /// Packet direction
    pub direction: Direction,
    /// Driver metadata needed to reinject at the same point
    pub address: PacketAddress,
}

impl CapturedPacket {
    /// Wrap a buffer with a default address for `direction`
    pub fn new(data: Vec<u8>, direction: Direction) -> Self {
        let address = match direction {
            Direction::Outbound => PacketAddress::outbound(),
            Direction::Inbound => PacketAddress::inbound(),
        };
        Self { data, direction, address }
    }

    /// Parse the captured packet into a structured Packet
    pub fn parse(&self) -> dpiscope_core::Result<Packet> {
        Packet::from_bytes(&self.data, self.direction)
    }
}

/// Platform-specific packet address for reinjection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketAddress {
    /// Interface index
    pub interface_index: u32,
    /// Subinterface index
    pub subinterface_index: u32,
    /// Direction (outbound = true, inbound = false)
    pub outbound: bool,
    /// Whether packet is loopback
    pub loopback: bool,
    /// Whether packet is an impostor (injected)
    pub impostor: bool,
    /// IPv6 flag
    pub ipv6: bool,
}

impl PacketAddress {
    /// Create for outbound packet
    pub fn outbound() -> Self {
        Self {
            outbound: true,
            ..Default::default()
        }
    }

    /// Create for inbound packet
    pub fn inbound() -> Self {
        Self {
            outbound: false,
            ..Default::default()
        }
    }

    /// Mark as impostor (injected)
    #[must_use]
    pub fn as_impostor(mut self) -> Self {
        self.impostor = true;
        self
    }

    /// Direction the address points at
    pub fn direction(&self) -> Direction {
        if self.outbound {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_address_outbound() {
        let addr = PacketAddress::outbound();
        assert!(addr.outbound);
        assert!(!addr.loopback);
        assert_eq!(addr.direction(), Direction::Outbound);
    }

    #[test]
    fn test_packet_address_impostor() {
        let addr = PacketAddress::inbound().as_impostor();
        assert!(!addr.outbound);
        assert!(addr.impostor);
    }

    #[test]
    fn test_captured_packet_default_address() {
        let captured = CapturedPacket::new(vec![0u8; 4], Direction::Inbound);
        assert_eq!(captured.address, PacketAddress::inbound());
        assert!(captured.parse().is_err());
    }
}
