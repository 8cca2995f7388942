//! Packet rewriting techniques
//!
//! Pure functions over [`Packet`]: they build the segments, decoys and
//! copies the bypass filter queues for injection. None of them touch shared
//! state.

use crate::error::{Error, Result};
use crate::packet::{build_client_hello, Packet};
use rand::Rng;

/// SNI carried by decoy ClientHellos
pub const DECOY_SNI: &str = "www.w3.org";

/// How far behind the real stream decoys are placed
pub const DECOY_SEQ_OFFSET: u32 = 10_000;

/// Bytes of an HTTP request searched for the Host header
const HOST_SEARCH_LIMIT: usize = 1024;

/// Auto-TTL tuning: `a1`/`a2` hop margins and an upper bound
const AUTO_TTL_A1: u8 = 1;
const AUTO_TTL_A2: u8 = 4;
const AUTO_TTL_MAX: u8 = 10;

/// One piece of a split payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSlice {
    /// Offset into the payload, also the sequence advance
    pub offset: usize,
    /// Bytes in this piece
    pub len: usize,
}

/// Cut a payload of `payload_len` bytes by `sizes`, with the remainder as the
/// last piece.
///
/// Sizes that would leave nothing for the remainder stop the plan early.
/// `None` when fewer than two pieces result.
pub fn fragment_plan(payload_len: usize, sizes: &[u32]) -> Option<Vec<FragmentSlice>> {
    let mut slices = Vec::with_capacity(sizes.len() + 1);
    let mut consumed = 0usize;
    for &size in sizes.iter().filter(|s| **s > 0).take(crate::strategy::MAX_FRAGMENTS) {
        let size = size as usize;
        if payload_len.saturating_sub(consumed) <= size {
            break;
        }
        slices.push(FragmentSlice { offset: consumed, len: size });
        consumed += size;
    }
    if consumed == 0 || consumed >= payload_len {
        return None;
    }
    slices.push(FragmentSlice {
        offset: consumed,
        len: payload_len - consumed,
    });
    Some(slices)
}

/// TCP segments for `plan`, in plan order
pub fn split_segments(packet: &Packet, plan: &[FragmentSlice]) -> Result<Vec<Packet>> {
    if !packet.is_tcp() {
        return Err(Error::technique("fragment", "not a TCP packet"));
    }
    let payload = packet.payload();
    let seq = packet
        .tcp_seq()
        .ok_or_else(|| Error::technique("fragment", "missing TCP header"))?;
    plan.iter()
        .map(|slice| {
            let bytes = payload
                .get(slice.offset..slice.offset + slice.len)
                .ok_or_else(|| Error::technique("fragment", "slice outside payload"))?;
            let mut segment = packet.with_payload(bytes)?;
            #[allow(clippy::cast_possible_truncation)]
            segment.set_tcp_seq(seq.wrapping_add(slice.offset as u32));
            Ok(segment)
        })
        .collect()
}

/// Decoy ClientHello for the flow of `packet`.
///
/// The decoy carries [`DECOY_SNI`], a fresh random, and a sequence number
/// [`DECOY_SEQ_OFFSET`] behind the real one, so the server discards it even
/// if it arrives. With `bad_checksum` the transport checksum is invalidated;
/// otherwise `ttl` (when given) keeps it from reaching the server.
pub fn fake_client_hello(packet: &Packet, bad_checksum: bool, ttl: Option<u8>) -> Result<Packet> {
    let mut random = [0u8; 32];
    rand::thread_rng().fill(&mut random);
    let mut fake = packet.with_payload(&build_client_hello(DECOY_SNI, &random))?;
    if let Some(seq) = packet.tcp_seq() {
        fake.set_tcp_seq(seq.wrapping_sub(DECOY_SEQ_OFFSET));
    }
    if let Some(ttl) = ttl {
        fake.set_ttl(ttl);
    }
    if bad_checksum {
        fake.corrupt_transport_checksum();
    }
    Ok(fake)
}

/// Copy of `packet` with a TTL too low to reach the server
pub fn ttl_copy(packet: &Packet, ttl: u8) -> Packet {
    let mut copy = packet.clone();
    copy.set_ttl(ttl.max(1));
    copy
}

/// Decoy TTL from the TTL observed on the server's packets.
///
/// The hop count is inferred from the usual initial TTLs (64, 128); `None`
/// when the value fits neither or the path is too short to stay below it.
pub fn auto_ttl(observed_ttl: u8) -> Option<u8> {
    let hops = match observed_ttl {
        99..=127 => 128 - observed_ttl,
        35..=63 => 64 - observed_ttl,
        _ => return None,
    };
    let mut ttl = hops.saturating_sub(AUTO_TTL_A2);
    if ttl < AUTO_TTL_A2 && hops <= 9 {
        // Scale the margin down on short paths
        let scale = (AUTO_TTL_A2 - AUTO_TTL_A1) * hops / 10;
        ttl = hops.saturating_sub(AUTO_TTL_A1).saturating_sub(scale);
    }
    let ttl = ttl.min(AUTO_TTL_MAX);
    (ttl > 0).then_some(ttl)
}

fn starts_with_host(buf: &[u8], at: usize) -> bool {
    buf.get(at..at + 5).is_some_and(|w| w.eq_ignore_ascii_case(b"host:"))
}

/// Offset of the `Host:` header name within an HTTP request
pub fn find_http_host_header(payload: &[u8]) -> Option<usize> {
    let head = &payload[..payload.len().min(HOST_SEARCH_LIMIT)];
    if starts_with_host(head, 0) {
        return Some(0);
    }
    head.windows(2)
        .enumerate()
        .filter(|(_, w)| *w == b"\r\n")
        .map(|(i, _)| i + 2)
        .find(|&at| starts_with_host(head, at))
}

/// Split point inside the header name (`Ho|st:`)
pub fn host_split_offset(payload: &[u8]) -> Option<usize> {
    let split = find_http_host_header(payload)? + 2;
    (split > 0 && split < payload.len()).then_some(split)
}
