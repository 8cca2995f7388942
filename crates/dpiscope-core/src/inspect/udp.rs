//! UDP handshake completion tracking (QUIC Initial, DTLS ClientHello)

use crate::error::Result;
use crate::intercept::{FilterContext, FilterVerdict, PacketFilter};
use crate::packet::{is_dtls_client_hello, is_quic_initial, Packet};
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Handshake recognized on an outbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpHandshakeKind {
    /// QUIC long-header Initial
    QuicInitial,
    /// DTLS ClientHello record
    DtlsClientHello,
}

/// Raised once when a destination crosses the unanswered threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnansweredHandshakes {
    /// Destination that never replied
    pub destination: IpAddr,
    /// Destination port of the last attempt
    pub port: u16,
    /// Kind of the last attempt
    pub kind: UdpHandshakeKind,
    /// Attempts since the last inbound datagram
    pub count: u32,
}

#[derive(Debug)]
struct PeerState {
    unanswered: u32,
    alerted: bool,
    updated: Instant,
}

/// Per-destination unanswered handshake counters
#[derive(Debug)]
pub struct UdpHandshakeTracker {
    peers: DashMap<IpAddr, PeerState>,
    threshold: u32,
}

/// Classify an outbound UDP payload
pub fn classify_handshake(payload: &[u8]) -> Option<UdpHandshakeKind> {
    if is_quic_initial(payload) {
        Some(UdpHandshakeKind::QuicInitial)
    } else if is_dtls_client_hello(payload) {
        Some(UdpHandshakeKind::DtlsClientHello)
    } else {
        None
    }
}

impl UdpHandshakeTracker {
    /// Tracker alerting at `threshold` unanswered attempts
    pub fn new(threshold: u32) -> Self {
        Self {
            peers: DashMap::new(),
            threshold,
        }
    }

    /// Feed one packet; returns an alert the first time the threshold is crossed
    pub fn observe(&self, packet: &Packet, now: Instant) -> Option<UnansweredHandshakes> {
        if !packet.is_udp() {
            return None;
        }
        if packet.is_inbound() {
            if let Some(mut peer) = self.peers.get_mut(&packet.src_addr) {
                peer.unanswered = 0;
                peer.alerted = false;
                peer.updated = now;
            }
            return None;
        }

        let kind = classify_handshake(packet.payload())?;
        let mut peer = self.peers.entry(packet.dst_addr).or_insert(PeerState {
            unanswered: 0,
            alerted: false,
            updated: now,
        });
        peer.unanswered = peer.unanswered.saturating_add(1);
        peer.updated = now;
        if peer.unanswered >= self.threshold && !peer.alerted {
            peer.alerted = true;
            debug!(destination = %packet.dst_addr, count = peer.unanswered, ?kind, "UDP handshakes unanswered");
            return Some(UnansweredHandshakes {
                destination: packet.dst_addr,
                port: packet.dst_port,
                kind,
                count: peer.unanswered,
            });
        }
        None
    }

    /// Attempts to `ip` since its last reply
    pub fn unanswered_count(&self, ip: IpAddr) -> u32 {
        self.peers.get(&ip).map_or(0, |p| p.unanswered)
    }

    /// Forget peers idle for longer than `idle`
    pub fn cleanup(&self, now: Instant, idle: Duration) {
        self.peers
            .retain(|_, p| now.saturating_duration_since(p.updated) < idle);
    }
}

impl PacketFilter for UdpHandshakeTracker {
    fn name(&self) -> &str {
        "udp-handshake-tracker"
    }

    fn priority(&self) -> i32 {
        970
    }

    fn process(&self, packet: &mut Packet, ctx: &mut FilterContext) -> Result<FilterVerdict> {
        self.observe(packet, ctx.now());
        Ok(FilterVerdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Direction, PacketBuilder};

    fn quic_initial() -> Vec<u8> {
        let mut payload = vec![0u8; 1250];
        payload[0] = 0xC0;
        payload[1..5].copy_from_slice(&1u32.to_be_bytes());
        payload
    }

    fn outbound(payload: &[u8]) -> Packet {
        let raw = PacketBuilder::udp_v4()
            .src_ip_v4([10, 0, 0, 2])
            .dst_ip_v4([142, 250, 1, 1])
            .src_port(55000)
            .dst_port(443)
            .payload(payload)
            .build();
        Packet::from_bytes(&raw, Direction::Outbound).unwrap()
    }

    fn reply() -> Packet {
        let raw = PacketBuilder::udp_v4()
            .src_ip_v4([142, 250, 1, 1])
            .dst_ip_v4([10, 0, 0, 2])
            .src_port(443)
            .dst_port(55000)
            .payload(&[0x40, 1, 2, 3])
            .build();
        Packet::from_bytes(&raw, Direction::Inbound).unwrap()
    }

    #[test]
    fn test_alert_fires_once_at_threshold() {
        let tracker = UdpHandshakeTracker::new(5);
        let now = Instant::now();
        let pkt = outbound(&quic_initial());
        let alerts: Vec<_> = (0..7).filter_map(|_| tracker.observe(&pkt, now)).collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].count, 5);
        assert_eq!(alerts[0].kind, UdpHandshakeKind::QuicInitial);
        assert_eq!(tracker.unanswered_count("142.250.1.1".parse().unwrap()), 7);
    }

    #[test]
    fn test_inbound_reply_resets_counter_and_alert() {
        let tracker = UdpHandshakeTracker::new(5);
        let now = Instant::now();
        let pkt = outbound(&quic_initial());
        for _ in 0..5 {
            tracker.observe(&pkt, now);
        }
        tracker.observe(&reply(), now);
        assert_eq!(tracker.unanswered_count("142.250.1.1".parse().unwrap()), 0);

        let again: Vec<_> = (0..5).filter_map(|_| tracker.observe(&pkt, now)).collect();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_dtls_client_hello_recognized() {
        let mut hello = vec![0u8; 40];
        hello[0] = 22;
        hello[13] = 1;
        assert_eq!(classify_handshake(&hello), Some(UdpHandshakeKind::DtlsClientHello));
        assert_eq!(classify_handshake(&[0u8; 40]), None);
    }

    #[test]
    fn test_short_long_header_not_counted() {
        let tracker = UdpHandshakeTracker::new(1);
        let short = outbound(&quic_initial()[..600]);
        assert!(tracker.observe(&short, Instant::now()).is_none());
    }
}
