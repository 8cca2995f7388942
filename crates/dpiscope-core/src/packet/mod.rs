//! Packet parsing and manipulation
//!
//! Minimal IPv4/IPv6 + TCP/UDP header decoding for the receive loop. Every
//! length field (IHL, total length, IPv6 payload length and extension header
//! lengths, TCP data offset, UDP length) is checked against the buffer before
//! any field behind it is read, so malformed input is rejected with an error
//! rather than a panic. Callers on the hot path treat a parse error as "pass
//! the packet through unmodified".

mod builder;
mod parser;
mod types;

pub use builder::PacketBuilder;
pub use parser::PacketParser;
pub use types::*;

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Maximum packet size we handle
pub const MAX_PACKET_SIZE: usize = 0xFFFF;

/// Maximum hostname length (DNS standard)
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Minimum size of a QUIC Initial datagram payload (RFC 9000 §14.1)
pub const QUIC_MIN_INITIAL_LEN: usize = 1200;

/// Represents a network packet with parsed headers
#[derive(Debug, Clone)]
pub struct Packet {
    data: BytesMut,
    /// Packet direction
    pub direction: Direction,
    /// IP version
    pub ip_version: IpVersion,
    /// Transport protocol
    pub protocol: Protocol,
    /// Source IP address
    pub src_addr: IpAddr,
    /// Destination IP address
    pub dst_addr: IpAddr,
    /// Source port (TCP/UDP, 0 otherwise)
    pub src_port: u16,
    /// Destination port (TCP/UDP, 0 otherwise)
    pub dst_port: u16,
    ip_header_len: usize,
    transport_header_len: usize,
    /// TCP flags (if TCP)
    pub tcp_flags: Option<TcpFlags>,
    /// TTL / hop limit
    pub ttl: u8,
    /// IP identification (IPv4 only)
    pub ip_id: Option<u16>,
    /// Non-first IP fragment: no transport header present
    pub is_fragment: bool,
    checksum_frozen: bool,
}

impl Packet {
    /// Parse a packet from raw bytes.
    ///
    /// Bytes beyond the IP total length (link padding) are dropped.
    pub fn from_bytes(data: &[u8], direction: Direction) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::PacketTooSmall {
                expected: 20,
                actual: 0,
            });
        }
        if data.len() > MAX_PACKET_SIZE + 40 {
            return Err(Error::packet_parse(format!("packet of {} bytes exceeds maximum", data.len())));
        }

        let mut packet = Self {
            data: BytesMut::from(data),
            direction,
            ip_version: IpVersion::V4,
            protocol: Protocol::Other(0),
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            ip_header_len: 0,
            transport_header_len: 0,
            tcp_flags: None,
            ttl: 0,
            ip_id: None,
            is_fragment: false,
            checksum_frozen: false,
        };

        match data[0] >> 4 {
            4 => packet.parse_ipv4()?,
            6 => packet.parse_ipv6()?,
            v => return Err(Error::packet_parse_at(format!("unknown IP version {v}"), 0)),
        }
        packet.parse_transport()?;
        Ok(packet)
    }

    fn parse_ipv4(&mut self) -> Result<()> {
        let len = self.data.len();
        if len < 20 {
            return Err(Error::PacketTooSmall {
                expected: 20,
                actual: len,
            });
        }
        let ihl = usize::from(self.data[0] & 0x0F) * 4;
        if ihl < 20 || ihl > len {
            return Err(Error::InvalidHeaderLength {
                field: "ipv4 ihl",
                value: ihl,
                buffer_len: len,
            });
        }
        let total = usize::from(u16::from_be_bytes([self.data[2], self.data[3]]));
        if total < ihl || total > len {
            return Err(Error::InvalidHeaderLength {
                field: "ipv4 total length",
                value: total,
                buffer_len: len,
            });
        }
        self.data.truncate(total);

        self.ip_version = IpVersion::V4;
        self.ip_header_len = ihl;
        self.ip_id = Some(u16::from_be_bytes([self.data[4], self.data[5]]));
        let frag_offset = u16::from_be_bytes([self.data[6], self.data[7]]) & 0x1FFF;
        self.is_fragment = frag_offset != 0;
        self.ttl = self.data[8];
        self.protocol = Protocol::from_u8(self.data[9]);
        self.src_addr = IpAddr::V4(Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15]));
        self.dst_addr = IpAddr::V4(Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19]));
        Ok(())
    }

    fn parse_ipv6(&mut self) -> Result<()> {
        let len = self.data.len();
        if len < 40 {
            return Err(Error::PacketTooSmall {
                expected: 40,
                actual: len,
            });
        }
        let payload_len = usize::from(u16::from_be_bytes([self.data[4], self.data[5]]));
        if 40 + payload_len > len {
            return Err(Error::InvalidHeaderLength {
                field: "ipv6 payload length",
                value: payload_len,
                buffer_len: len,
            });
        }
        self.data.truncate(40 + payload_len);

        self.ip_version = IpVersion::V6;
        self.ttl = self.data[7];
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&self.data[8..24]);
        dst.copy_from_slice(&self.data[24..40]);
        self.src_addr = IpAddr::V6(Ipv6Addr::from(src));
        self.dst_addr = IpAddr::V6(Ipv6Addr::from(dst));

        // Walk hop-by-hop / routing / fragment / destination-options headers.
        let mut next = self.data[6];
        let mut offset = 40;
        loop {
            match next {
                0 | 43 | 60 => {
                    if offset + 2 > self.data.len() {
                        return Err(Error::packet_parse_at("truncated ipv6 extension header", offset));
                    }
                    let ext_len = (usize::from(self.data[offset + 1]) + 1) * 8;
                    if offset + ext_len > self.data.len() {
                        return Err(Error::InvalidHeaderLength {
                            field: "ipv6 extension header",
                            value: ext_len,
                            buffer_len: self.data.len(),
                        });
                    }
                    next = self.data[offset];
                    offset += ext_len;
                }
                44 => {
                    if offset + 8 > self.data.len() {
                        return Err(Error::packet_parse_at("truncated ipv6 fragment header", offset));
                    }
                    let frag_offset = u16::from_be_bytes([self.data[offset + 2], self.data[offset + 3]]) >> 3;
                    self.is_fragment = frag_offset != 0;
                    next = self.data[offset];
                    offset += 8;
                }
                _ => break,
            }
        }
        self.ip_header_len = offset;
        self.protocol = Protocol::from_u8(next);
        Ok(())
    }

    fn parse_transport(&mut self) -> Result<()> {
        if self.is_fragment {
            return Ok(());
        }
        let offset = self.ip_header_len;
        let len = self.data.len();

        match self.protocol {
            Protocol::Tcp => {
                if len < offset + 20 {
                    return Err(Error::PacketTooSmall {
                        expected: offset + 20,
                        actual: len,
                    });
                }
                let doff = usize::from(self.data[offset + 12] >> 4) * 4;
                if doff < 20 || offset + doff > len {
                    return Err(Error::InvalidHeaderLength {
                        field: "tcp data offset",
                        value: doff,
                        buffer_len: len,
                    });
                }
                self.src_port = u16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
                self.dst_port = u16::from_be_bytes([self.data[offset + 2], self.data[offset + 3]]);
                self.transport_header_len = doff;
                self.tcp_flags = Some(TcpFlags::from_byte(self.data[offset + 13]));
            }
            Protocol::Udp => {
                if len < offset + 8 {
                    return Err(Error::PacketTooSmall {
                        expected: offset + 8,
                        actual: len,
                    });
                }
                let udp_len = usize::from(u16::from_be_bytes([self.data[offset + 4], self.data[offset + 5]]));
                if udp_len < 8 || offset + udp_len > len {
                    return Err(Error::InvalidHeaderLength {
                        field: "udp length",
                        value: udp_len,
                        buffer_len: len,
                    });
                }
                self.src_port = u16::from_be_bytes([self.data[offset], self.data[offset + 1]]);
                self.dst_port = u16::from_be_bytes([self.data[offset + 2], self.data[offset + 3]]);
                self.transport_header_len = 8;
            }
            _ => {}
        }
        Ok(())
    }

    /// Payload after IP and transport headers
    pub fn payload(&self) -> &[u8] {
        let offset = self.header_len();
        if offset < self.data.len() {
            &self.data[offset..]
        } else {
            &[]
        }
    }

    /// Payload length
    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Combined IP + transport header length
    pub fn header_len(&self) -> usize {
        self.ip_header_len + self.transport_header_len
    }

    /// IP header length including IPv6 extension headers
    pub fn ip_header_len(&self) -> usize {
        self.ip_header_len
    }

    /// Check if packet is outbound
    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Check if packet is inbound
    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    /// Check if this is a TCP packet
    pub fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }

    /// Check if this is a UDP packet
    pub fn is_udp(&self) -> bool {
        self.protocol == Protocol::Udp
    }

    /// Check if this is IPv4
    pub fn is_ipv4(&self) -> bool {
        self.ip_version == IpVersion::V4
    }

    /// Check if this is IPv6
    pub fn is_ipv6(&self) -> bool {
        self.ip_version == IpVersion::V6
    }

    fn has_flag(&self, flag: TcpFlags) -> bool {
        self.tcp_flags.is_some_and(|f| f.contains(flag))
    }

    /// TCP SYN set
    pub fn is_syn(&self) -> bool {
        self.has_flag(TcpFlags::SYN)
    }

    /// TCP ACK set
    pub fn is_ack(&self) -> bool {
        self.has_flag(TcpFlags::ACK)
    }

    /// TCP RST set
    pub fn is_rst(&self) -> bool {
        self.has_flag(TcpFlags::RST)
    }

    /// TCP SYN+ACK
    pub fn is_syn_ack(&self) -> bool {
        self.tcp_flags.is_some_and(TcpFlags::is_syn_ack)
    }

    /// Source IPv4 address, if IPv4
    pub fn src_v4(&self) -> Option<Ipv4Addr> {
        match self.src_addr {
            IpAddr::V4(a) => Some(a),
            IpAddr::V6(_) => None,
        }
    }

    /// Destination IPv4 address, if IPv4
    pub fn dst_v4(&self) -> Option<Ipv4Addr> {
        match self.dst_addr {
            IpAddr::V4(a) => Some(a),
            IpAddr::V6(_) => None,
        }
    }

    /// Address of the far end: destination for outbound, source for inbound
    pub fn remote_addr(&self) -> IpAddr {
        match self.direction {
            Direction::Outbound => self.dst_addr,
            Direction::Inbound => self.src_addr,
        }
    }

    /// Check if payload starts like an HTTP request
    pub fn is_http_request(&self) -> bool {
        let payload = self.payload();
        payload.len() >= 4
            && matches!(
                &payload[..4],
                b"GET " | b"POST" | b"HEAD" | b"PUT " | b"DELE" | b"CONN" | b"OPTI" | b"PATC"
            )
    }

    /// TLS handshake record carrying a ClientHello
    pub fn is_tls_client_hello(&self) -> bool {
        is_tls_client_hello(self.payload())
    }

    /// QUIC Initial datagram
    pub fn is_quic_initial(&self) -> bool {
        self.is_udp() && is_quic_initial(self.payload())
    }

    /// Extract the SNI host name from a TLS ClientHello
    pub fn extract_sni(&self) -> Option<String> {
        extract_sni(self.payload())
    }

    /// Extract the Host header from an HTTP request
    pub fn extract_http_host(&self) -> Option<String> {
        let payload = self.payload();
        let head_end = find(payload, b"\r\n\r\n").unwrap_or(payload.len());
        let head = std::str::from_utf8(&payload[..head_end]).ok()?;
        head.split("\r\n").skip(1).find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if !name.trim().eq_ignore_ascii_case("host") {
                return None;
            }
            let host = value.trim();
            (host.len() >= 3 && host.len() <= MAX_HOSTNAME_LEN).then(|| host.to_string())
        })
    }

    /// Raw packet data
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw packet data
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Total packet length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if packet is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clone packet data into a new Bytes
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    fn tcp_u32(&self, field: usize) -> Option<u32> {
        if !self.is_tcp() || self.transport_header_len == 0 {
            return None;
        }
        let offset = self.ip_header_len + field;
        let bytes = self.data.get(offset..offset + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// TCP sequence number
    pub fn tcp_seq(&self) -> Option<u32> {
        self.tcp_u32(4)
    }

    /// TCP acknowledgment number
    pub fn tcp_ack_num(&self) -> Option<u32> {
        self.tcp_u32(8)
    }

    /// Set TTL / hop limit
    pub fn set_ttl(&mut self, ttl: u8) {
        match self.ip_version {
            IpVersion::V4 => self.data[8] = ttl,
            IpVersion::V6 => self.data[7] = ttl,
        }
        self.ttl = ttl;
    }

    /// Set TCP sequence number
    pub fn set_tcp_seq(&mut self, seq: u32) {
        if self.is_tcp() && self.transport_header_len > 0 {
            let offset = self.ip_header_len + 4;
            self.data[offset..offset + 4].copy_from_slice(&seq.to_be_bytes());
        }
    }

    /// Set TCP acknowledgment number
    pub fn set_tcp_ack(&mut self, ack: u32) {
        if self.is_tcp() && self.transport_header_len > 0 {
            let offset = self.ip_header_len + 8;
            self.data[offset..offset + 4].copy_from_slice(&ack.to_be_bytes());
        }
    }

    /// Copy of this packet with `payload` in place of the current one.
    ///
    /// Length fields are rewritten; checksums are not.
    pub fn with_payload(&self, payload: &[u8]) -> Result<Self> {
        let header_len = self.header_len();
        if header_len + payload.len() > MAX_PACKET_SIZE {
            return Err(Error::technique("payload", "replacement payload too large"));
        }
        let mut data = BytesMut::with_capacity(header_len + payload.len());
        data.extend_from_slice(&self.data[..header_len]);
        data.extend_from_slice(payload);

        let mut out = self.clone();
        out.data = data;
        out.update_lengths();
        Ok(out)
    }

    /// Split at a payload offset into two TCP segments.
    ///
    /// The second segment's sequence number is advanced by `offset`.
    pub fn split_at_payload(&self, offset: usize) -> Result<(Self, Self)> {
        let payload = self.payload();
        if !self.is_tcp() || offset == 0 || offset >= payload.len() {
            return Err(Error::technique("split", "split offset outside payload"));
        }
        let first = self.with_payload(&payload[..offset])?;
        let mut second = self.with_payload(&payload[offset..])?;
        if let Some(seq) = second.tcp_seq() {
            #[allow(clippy::cast_possible_truncation)]
            second.set_tcp_seq(seq.wrapping_add(offset as u32));
        }
        Ok((first, second))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn update_lengths(&mut self) {
        let total_len = self.data.len();
        match self.ip_version {
            IpVersion::V4 => {
                self.data[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            }
            IpVersion::V6 => {
                self.data[4..6].copy_from_slice(&((total_len - 40) as u16).to_be_bytes());
            }
        }
        if self.is_udp() && self.transport_header_len == 8 {
            let off = self.ip_header_len + 4;
            let udp_len = (total_len - self.ip_header_len) as u16;
            self.data[off..off + 2].copy_from_slice(&udp_len.to_be_bytes());
        }
    }

    /// Recompute IP and transport checksums in place
    pub fn recalculate_checksums(&mut self) -> bool {
        if self.is_fragment || self.checksum_frozen {
            return false;
        }
        let (version, ihl, proto) = (self.ip_version, self.ip_header_len, self.protocol.to_u8());
        PacketParser::recalculate_checksums(&mut self.data, version, ihl, proto)
    }

    /// Whether the transport checksum was deliberately invalidated
    pub fn checksums_frozen(&self) -> bool {
        self.checksum_frozen
    }

    /// Deliberately invalidate the transport checksum.
    ///
    /// The IP header checksum is fixed up first so the packet still reaches
    /// middleboxes; later recalculation requests are ignored.
    pub fn corrupt_transport_checksum(&mut self) {
        self.recalculate_checksums();
        self.checksum_frozen = true;
        let field = match self.protocol {
            Protocol::Tcp => 16,
            Protocol::Udp => 6,
            _ => return,
        };
        let offset = self.ip_header_len + field;
        if let Some(bytes) = self.data.get_mut(offset..offset + 2) {
            let value = u16::from_be_bytes([bytes[0], bytes[1]]).wrapping_add(0x5A5A) | 1;
            bytes.copy_from_slice(&value.to_be_bytes());
        }
    }
}

/// TLS record header for a handshake carrying a ClientHello
pub fn is_tls_client_hello(payload: &[u8]) -> bool {
    payload.len() >= 6 && payload[0] == 0x16 && payload[1] == 0x03 && payload[2] <= 0x04 && payload[5] == 0x01
}

/// QUIC long-header Initial packet (version 1, or a version-0 probe)
pub fn is_quic_initial(payload: &[u8]) -> bool {
    if payload.len() < QUIC_MIN_INITIAL_LEN {
        return false;
    }
    let first = payload[0];
    if first & 0xC0 != 0xC0 || (first & 0x30) >> 4 != 0 {
        return false;
    }
    let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    version == 1 || version == 0
}

/// DTLS record carrying a ClientHello handshake
pub fn is_dtls_client_hello(payload: &[u8]) -> bool {
    payload.len() >= 23 && payload[0] == 22 && payload[13] == 1
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Cursor over a byte slice with bounds-checked reads
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<usize> {
        let bytes = self.take(2)?;
        Some(usize::from(u16::from_be_bytes([bytes[0], bytes[1]])))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }
}

/// Walk a TLS ClientHello and return the `server_name` host, if present.
///
/// Works on the first record only; an SNI split across TCP segments is not
/// recovered.
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    if !is_tls_client_hello(payload) {
        return None;
    }
    let mut r = Reader { buf: payload, pos: 5 };
    r.u8()?; // handshake type
    r.take(3)?; // handshake length
    r.take(2 + 32)?; // client version + random
    let sid = r.u8()?;
    r.take(usize::from(sid))?;
    let suites = r.u16()?;
    r.take(suites)?;
    let comp = r.u8()?;
    r.take(usize::from(comp))?;
    let ext_total = r.u16()?;
    let exts = r.take(ext_total.min(payload.len().saturating_sub(r.pos)))?;

    let mut e = Reader { buf: exts, pos: 0 };
    while e.pos + 4 <= exts.len() {
        let ext_type = e.u16()?;
        let ext_len = e.u16()?;
        let body = e.take(ext_len)?;
        if ext_type != 0 {
            continue;
        }
        let mut s = Reader { buf: body, pos: 0 };
        let list_len = s.u16()?;
        let list = s.take(list_len)?;
        let mut l = Reader { buf: list, pos: 0 };
        while l.pos < list.len() {
            let name_type = l.u8()?;
            let name_len = l.u16()?;
            let name = l.take(name_len)?;
            if name_type == 0 && !name.is_empty() && name.len() <= MAX_HOSTNAME_LEN {
                let host = std::str::from_utf8(name).ok()?;
                if host.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_') {
                    return Some(host.to_ascii_lowercase());
                }
                return None;
            }
        }
    }
    None
}

/// Build a minimal TLS 1.2 ClientHello carrying `sni`, used for fake packets
/// and tests.
#[allow(clippy::cast_possible_truncation)]
pub fn build_client_hello(sni: &str, random: &[u8; 32]) -> Vec<u8> {
    let name = sni.as_bytes();
    let mut sni_ext = Vec::with_capacity(name.len() + 9);
    sni_ext.extend_from_slice(&[0x00, 0x00]);
    sni_ext.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
    sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni_ext.push(0x00);
    sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(name);

    let mut body = Vec::with_capacity(64 + sni_ext.len());
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(random);
    body.push(0x00); // session id
    body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0xc0, 0x2f]);
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&sni_ext);

    let mut hs = Vec::with_capacity(body.len() + 4);
    hs.push(0x01);
    hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    hs.extend_from_slice(&body);

    let mut record = Vec::with_capacity(hs.len() + 5);
    record.extend_from_slice(&[0x16, 0x03, 0x01]);
    record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    record.extend_from_slice(&hs);
    record
}
