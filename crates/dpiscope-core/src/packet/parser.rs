//! Checksum helpers (RFC 1071) for IPv4/IPv6 headers and TCP/UDP segments.
//!
//! Sums are accumulated in place over the pseudo-header and the segment so
//! recomputation on the receive loop does not allocate.

use super::IpVersion;

/// Packet checksum utilities
pub struct PacketParser;

/// Accumulate 16-bit big-endian words into a 32-bit running sum.
fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    !folded
}

impl PacketParser {
    /// Calculate Internet Checksum (RFC 1071)
    pub fn internet_checksum(data: &[u8]) -> u16 {
        fold(sum_words(0, data))
    }

    /// TCP/UDP checksum over an IPv4 pseudo-header.
    ///
    /// The checksum field inside `segment` must be zeroed by the caller.
    pub fn transport_checksum_ipv4(src: &[u8; 4], dst: &[u8; 4], proto: u8, segment: &[u8]) -> u16 {
        let mut sum = sum_words(0, src);
        sum = sum_words(sum, dst);
        sum += u32::from(proto);
        #[allow(clippy::cast_possible_truncation)]
        {
            sum += u32::from(segment.len() as u16);
        }
        fold(sum_words(sum, segment))
    }

    /// TCP/UDP checksum over an IPv6 pseudo-header
    pub fn transport_checksum_ipv6(src: &[u8; 16], dst: &[u8; 16], proto: u8, segment: &[u8]) -> u16 {
        let mut sum = sum_words(0, src);
        sum = sum_words(sum, dst);
        #[allow(clippy::cast_possible_truncation)]
        let len = segment.len() as u32;
        sum += (len >> 16) + (len & 0xFFFF);
        sum += u32::from(proto);
        fold(sum_words(sum, segment))
    }

    /// TCP checksum for an IPv4 segment
    pub fn tcp_checksum_ipv4(src_ip: &[u8; 4], dst_ip: &[u8; 4], tcp_segment: &[u8]) -> u16 {
        Self::transport_checksum_ipv4(src_ip, dst_ip, 6, tcp_segment)
    }

    /// UDP checksum for an IPv4 datagram
    pub fn udp_checksum_ipv4(src_ip: &[u8; 4], dst_ip: &[u8; 4], udp_segment: &[u8]) -> u16 {
        Self::transport_checksum_ipv4(src_ip, dst_ip, 17, udp_segment)
    }

    /// Calculate IPv4 header checksum, ignoring the current checksum field
    pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
        if header.len() < 12 {
            return Self::internet_checksum(header);
        }
        let sum = sum_words(sum_words(0, &header[..10]), &header[12..]);
        fold(sum)
    }

    /// Recompute IPv4 header and TCP/UDP checksums of a raw packet in place.
    ///
    /// `ip_header_len` and `protocol` come from a prior successful parse, so
    /// offsets are known to be inside the buffer. Returns `false` when the
    /// layout is not one we know how to checksum.
    pub fn recalculate_checksums(
        data: &mut [u8],
        version: IpVersion,
        ip_header_len: usize,
        protocol: u8,
    ) -> bool {
        let csum_offset = match protocol {
            6 => 16,
            17 => 6,
            _ => usize::MAX,
        };
        match version {
            IpVersion::V4 => {
                if data.len() < ip_header_len || ip_header_len < 20 {
                    return false;
                }
                data[10] = 0;
                data[11] = 0;
                let ip_sum = Self::internet_checksum(&data[..ip_header_len]);
                data[10..12].copy_from_slice(&ip_sum.to_be_bytes());

                if csum_offset == usize::MAX || data.len() < ip_header_len + csum_offset + 2 {
                    return csum_offset == usize::MAX;
                }
                let mut src = [0u8; 4];
                let mut dst = [0u8; 4];
                src.copy_from_slice(&data[12..16]);
                dst.copy_from_slice(&data[16..20]);
                let seg = &mut data[ip_header_len..];
                seg[csum_offset] = 0;
                seg[csum_offset + 1] = 0;
                let sum = Self::transport_checksum_ipv4(&src, &dst, protocol, seg);
                seg[csum_offset..csum_offset + 2].copy_from_slice(&sum.to_be_bytes());
                true
            }
            IpVersion::V6 => {
                if csum_offset == usize::MAX || data.len() < ip_header_len + csum_offset + 2 {
                    return false;
                }
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&data[8..24]);
                dst.copy_from_slice(&data[24..40]);
                let seg = &mut data[ip_header_len..];
                seg[csum_offset] = 0;
                seg[csum_offset + 1] = 0;
                let sum = Self::transport_checksum_ipv6(&src, &dst, protocol, seg);
                seg[csum_offset..csum_offset + 2].copy_from_slice(&sum.to_be_bytes());
                true
            }
        }
    }
}
