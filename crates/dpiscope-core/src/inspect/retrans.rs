//! TCP retransmission tracking
//!
//! A data-bearing (or SYN) segment whose sequence number was already seen in
//! the same direction of the same flow counts as a retransmission.

use super::flow::FlowKey;
use crate::error::Result;
use crate::intercept::{FilterContext, FilterVerdict, PacketFilter};
use crate::packet::Packet;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Sequence numbers remembered per flow direction
const RECENT_SEQS: usize = 32;

/// Aggregated counters for one address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetransStats {
    /// Segments seen again with an already-seen sequence number
    pub retransmissions: u64,
    /// All TCP packets seen on matching flows
    pub total_packets: u64,
}

impl RetransStats {
    /// Retransmission ratio, `None` when no packets were seen
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> Option<f64> {
        (self.total_packets > 0).then(|| self.retransmissions as f64 / self.total_packets as f64)
    }
}

#[derive(Debug, Default)]
struct FlowCounters {
    recent: VecDeque<(bool, u32)>,
    retransmissions: u64,
    total: u64,
    updated: Option<Instant>,
}

/// Per-flow retransmission counters
#[derive(Debug)]
pub struct RetransmissionTracker {
    flows: DashMap<FlowKey, FlowCounters>,
    min_packets: u64,
    suspicious_ratio: f64,
}

impl RetransmissionTracker {
    /// Tracker judging drops once `min_packets` were seen at `suspicious_ratio`
    pub fn new(min_packets: u64, suspicious_ratio: f64) -> Self {
        Self {
            flows: DashMap::new(),
            min_packets,
            suspicious_ratio,
        }
    }

    /// Feed one packet; returns whether it was a retransmission
    pub fn observe(&self, packet: &Packet, now: Instant) -> bool {
        if !packet.is_tcp() || packet.tcp_flags.is_none() {
            return false;
        }
        let key = FlowKey::of(packet);
        let from_a = key.a == SocketAddr::new(packet.src_addr, packet.src_port);
        let mut counters = self.flows.entry(key).or_default();
        counters.total += 1;
        counters.updated = Some(now);

        let Some(seq) = packet.tcp_seq() else {
            return false;
        };
        if packet.payload_len() == 0 && !packet.is_syn() {
            return false;
        }
        let marker = (from_a, seq);
        if counters.recent.contains(&marker) {
            counters.retransmissions += 1;
            return true;
        }
        if counters.recent.len() == RECENT_SEQS {
            counters.recent.pop_front();
        }
        counters.recent.push_back(marker);
        false
    }

    /// Sum over every flow with `ip` as an endpoint
    pub fn stats_for_ip(&self, ip: IpAddr) -> RetransStats {
        self.flows
            .iter()
            .filter(|entry| entry.key().involves(ip))
            .fold(RetransStats::default(), |acc, entry| RetransStats {
                retransmissions: acc.retransmissions + entry.retransmissions,
                total_packets: acc.total_packets + entry.total,
            })
    }

    /// Stats for `ip` when they look like a silent drop
    pub fn suspicious_drop(&self, ip: IpAddr) -> Option<RetransStats> {
        let stats = self.stats_for_ip(ip);
        (stats.total_packets >= self.min_packets && stats.ratio()? >= self.suspicious_ratio).then_some(stats)
    }

    /// Forget flows idle for longer than `idle`
    pub fn cleanup(&self, now: Instant, idle: Duration) {
        self.flows.retain(|_, c| {
            c.updated
                .is_some_and(|at| now.saturating_duration_since(at) < idle)
        });
    }

    /// Number of tracked flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether no flow is tracked
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl PacketFilter for RetransmissionTracker {
    fn name(&self) -> &str {
        "retrans-tracker"
    }

    fn priority(&self) -> i32 {
        990
    }

    fn process(&self, packet: &mut Packet, ctx: &mut FilterContext) -> Result<FilterVerdict> {
        self.observe(packet, ctx.now());
        Ok(FilterVerdict::Pass)
    }
}
