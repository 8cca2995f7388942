//! Packet builder for synthesized and test packets

use super::{IpVersion, PacketParser, Protocol, TcpFlags};
use bytes::{BufMut, BytesMut};

/// Builder for raw IPv4/IPv6 TCP or UDP packets with valid checksums
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    ip_version: IpVersion,
    protocol: Protocol,
    src_ip: [u8; 16],
    dst_ip: [u8; 16],
    src_port: u16,
    dst_port: u16,
    ttl: u8,
    ip_id: u16,
    tcp_flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload: Vec<u8>,
}

impl PacketBuilder {
    fn new(ip_version: IpVersion, protocol: Protocol) -> Self {
        Self {
            ip_version,
            protocol,
            src_ip: [0; 16],
            dst_ip: [0; 16],
            src_port: 0,
            dst_port: 0,
            ttl: 64,
            ip_id: 0,
            tcp_flags: TcpFlags::ACK,
            seq: 0,
            ack: 0,
            payload: Vec::new(),
        }
    }

    /// IPv4 TCP packet
    pub fn tcp_v4() -> Self {
        Self::new(IpVersion::V4, Protocol::Tcp)
    }

    /// IPv4 UDP datagram
    pub fn udp_v4() -> Self {
        Self::new(IpVersion::V4, Protocol::Udp)
    }

    /// IPv6 TCP packet
    pub fn tcp_v6() -> Self {
        Self::new(IpVersion::V6, Protocol::Tcp)
    }

    /// IPv6 UDP datagram
    pub fn udp_v6() -> Self {
        Self::new(IpVersion::V6, Protocol::Udp)
    }

    /// Set source IP (IPv4)
    pub fn src_ip_v4(mut self, ip: [u8; 4]) -> Self {
        self.src_ip[..4].copy_from_slice(&ip);
        self
    }

    /// Set destination IP (IPv4)
    pub fn dst_ip_v4(mut self, ip: [u8; 4]) -> Self {
        self.dst_ip[..4].copy_from_slice(&ip);
        self
    }

    /// Set source IP (IPv6)
    pub fn src_ip_v6(mut self, ip: [u8; 16]) -> Self {
        self.src_ip = ip;
        self
    }

    /// Set destination IP (IPv6)
    pub fn dst_ip_v6(mut self, ip: [u8; 16]) -> Self {
        self.dst_ip = ip;
        self
    }

    /// Set source port
    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    /// Set destination port
    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    /// Set TTL / hop limit
    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set IPv4 identification
    pub fn ip_id(mut self, id: u16) -> Self {
        self.ip_id = id;
        self
    }

    /// Set TCP flags
    pub fn flags(mut self, flags: TcpFlags) -> Self {
        self.tcp_flags = flags;
        self
    }

    /// Set sequence number
    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Set acknowledgment number
    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    /// Set payload
    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    /// Build the raw packet bytes
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(self) -> Vec<u8> {
        let ip_header_len = match self.ip_version {
            IpVersion::V4 => 20,
            IpVersion::V6 => 40,
        };
        let transport_len = match self.protocol {
            Protocol::Udp => 8,
            _ => 20,
        } + self.payload.len();
        let total_len = ip_header_len + transport_len;

        let mut packet = BytesMut::with_capacity(total_len);
        match self.ip_version {
            IpVersion::V4 => {
                packet.put_u8(0x45);
                packet.put_u8(0);
                packet.put_u16(total_len as u16);
                packet.put_u16(self.ip_id);
                packet.put_u16(0x4000);
                packet.put_u8(self.ttl);
                packet.put_u8(self.protocol.to_u8());
                packet.put_u16(0);
                packet.put_slice(&self.src_ip[..4]);
                packet.put_slice(&self.dst_ip[..4]);
            }
            IpVersion::V6 => {
                packet.put_u32(0x6000_0000);
                packet.put_u16(transport_len as u16);
                packet.put_u8(self.protocol.to_u8());
                packet.put_u8(self.ttl);
                packet.put_slice(&self.src_ip);
                packet.put_slice(&self.dst_ip);
            }
        }

        packet.put_u16(self.src_port);
        packet.put_u16(self.dst_port);
        if self.protocol == Protocol::Udp {
            packet.put_u16(transport_len as u16);
            packet.put_u16(0);
        } else {
            packet.put_u32(self.seq);
            packet.put_u32(self.ack);
            packet.put_u8(0x50);
            packet.put_u8(self.tcp_flags.to_byte());
            packet.put_u16(0xFFFF);
            packet.put_u16(0);
            packet.put_u16(0);
        }
        packet.put_slice(&self.payload);

        let mut out = packet.to_vec();
        PacketParser::recalculate_checksums(
            &mut out,
            self.ip_version,
            ip_header_len,
            self.protocol.to_u8(),
        );
        out
    }
}
