//! Packet type definitions

use bitflags::bitflags;
use std::fmt;

/// Packet direction relative to the local host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Leaving the host
    Outbound,
    /// Arriving at the host
    Inbound,
}

impl Direction {
    /// The opposite direction
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            Self::Outbound => Self::Inbound,
            Self::Inbound => Self::Outbound,
        }
    }
}

/// IP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP (protocol number 6)
    Tcp,
    /// UDP (protocol number 17)
    Udp,
    /// ICMP (protocol number 1)
    Icmp,
    /// ICMPv6 (protocol number 58)
    Icmpv6,
    /// Anything else
    Other(u8),
}

impl Protocol {
    /// Create from protocol number
    pub fn from_u8(proto: u8) -> Self {
        match proto {
            1 => Self::Icmp,
            6 => Self::Tcp,
            17 => Self::Udp,
            58 => Self::Icmpv6,
            n => Self::Other(n),
        }
    }

    /// Get protocol number
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Icmp => 1,
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmpv6 => 58,
            Self::Other(n) => n,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
            Self::Icmp => f.write_str("ICMP"),
            Self::Icmpv6 => f.write_str("ICMPv6"),
            Self::Other(n) => write!(f, "proto({n})"),
        }
    }
}

bitflags! {
    /// TCP header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        /// FIN
        const FIN = 0x01;
        /// SYN
        const SYN = 0x02;
        /// RST
        const RST = 0x04;
        /// PSH
        const PSH = 0x08;
        /// ACK
        const ACK = 0x10;
        /// URG
        const URG = 0x20;
        /// ECE
        const ECE = 0x40;
        /// CWR
        const CWR = 0x80;
    }
}

impl TcpFlags {
    /// Create from the raw TCP flags byte (all bits are meaningful)
    pub fn from_byte(byte: u8) -> Self {
        Self::from_bits_retain(byte)
    }

    /// Raw flags byte
    pub fn to_byte(self) -> u8 {
        self.bits()
    }

    /// SYN and ACK both set
    pub fn is_syn_ack(self) -> bool {
        self.contains(Self::SYN | Self::ACK)
    }
}

/// Common well-known ports
pub mod ports {
    /// HTTP port
    pub const HTTP: u16 = 80;
    /// HTTPS port
    pub const HTTPS: u16 = 443;
    /// DNS port
    pub const DNS: u16 = 53;
    /// QUIC / HTTP3 port
    pub const QUIC: u16 = 443;
}
