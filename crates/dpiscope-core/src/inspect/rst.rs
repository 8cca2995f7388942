//! RST / TTL / IP-ID anomaly detection
//!
//! Builds a per-source baseline of TTL and IP-ID values from ordinary inbound
//! SYN-ACK and ACK segments. An inbound RST whose TTL (or IP-ID) falls well
//! outside that baseline was most likely forged by a middlebox rather than
//! sent by the real peer.

use crate::config::InspectConfig;
use crate::error::Result;
use crate::intercept::{FilterContext, FilterVerdict, PacketFilter};
use crate::packet::Packet;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Rolling min/max/last over observed values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeStats {
    /// Smallest value seen
    pub min: u32,
    /// Largest value seen
    pub max: u32,
    /// Most recent value
    pub last: u32,
    /// Number of samples
    pub count: u32,
}

impl RangeStats {
    fn first(value: u32) -> Self {
        Self {
            min: value,
            max: value,
            last: value,
            count: 1,
        }
    }

    fn observe(&mut self, value: u32) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
        self.count = self.count.saturating_add(1);
    }

    /// Distance of `value` from the `[min, max]` range, zero when inside
    pub fn distance(&self, value: u32) -> u32 {
        if value < self.min {
            self.min - value
        } else if value > self.max {
            value - self.max
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
struct Baseline {
    ttl: RangeStats,
    ip_id: Option<RangeStats>,
    updated: Instant,
}

/// Which field made an RST suspicious
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RstAnomaly {
    /// TTL outside the baseline
    Ttl,
    /// IP-ID outside the baseline
    IpId,
    /// Both
    TtlAndIpId,
}

/// A forged-looking RST, with the baseline it was judged against
#[derive(Debug, Clone, PartialEq)]
pub struct SuspiciousRst {
    /// Sender of the RST
    pub source: IpAddr,
    /// What tripped the detector
    pub anomaly: RstAnomaly,
    /// TTL on the RST
    pub rst_ttl: u8,
    /// Baseline TTL range
    pub ttl_range: RangeStats,
    /// Distance of the RST TTL from the baseline range
    pub ttl_delta: u32,
    /// IP-ID on the RST (IPv4)
    pub rst_ip_id: Option<u16>,
    /// Distance of the RST IP-ID from the baseline range
    pub ip_id_delta: Option<u32>,
    /// Monotonic detection time
    pub observed_at: Instant,
    /// Wall-clock detection time
    pub observed_at_utc: DateTime<Utc>,
}

/// Detector state, keyed by source address
#[derive(Debug)]
pub struct RstInspector {
    baselines: DashMap<IpAddr, Baseline>,
    suspicious: DashMap<IpAddr, SuspiciousRst>,
    ttl_threshold: u32,
    ipid_threshold: u32,
    min_samples: u32,
    freshness: Duration,
}

impl RstInspector {
    /// Detector using the `[inspect]` tunables
    pub fn new(cfg: &InspectConfig) -> Self {
        Self {
            baselines: DashMap::new(),
            suspicious: DashMap::new(),
            ttl_threshold: u32::from(cfg.rst_ttl_threshold),
            ipid_threshold: cfg.rst_ipid_threshold,
            min_samples: cfg.rst_min_samples,
            freshness: cfg.rst_freshness(),
        }
    }

    /// Feed one packet; returns the record when an RST is judged suspicious
    pub fn observe(&self, packet: &Packet, now: Instant) -> Option<SuspiciousRst> {
        if !packet.is_inbound() || !packet.is_tcp() || packet.tcp_flags.is_none() {
            return None;
        }
        let source = packet.src_addr;

        if packet.is_rst() {
            return self.judge_rst(source, packet, now);
        }
        if packet.is_syn_ack() || packet.is_ack() {
            let ttl = u32::from(packet.ttl);
            let ip_id = packet.ip_id.map(u32::from);
            self.baselines
                .entry(source)
                .and_modify(|b| {
                    b.ttl.observe(ttl);
                    if let Some(id) = ip_id {
                        match b.ip_id.as_mut() {
                            Some(range) => range.observe(id),
                            None => b.ip_id = Some(RangeStats::first(id)),
                        }
                    }
                    b.updated = now;
                })
                .or_insert_with(|| Baseline {
                    ttl: RangeStats::first(ttl),
                    ip_id: ip_id.map(RangeStats::first),
                    updated: now,
                });
        }
        None
    }

    fn judge_rst(&self, source: IpAddr, packet: &Packet, now: Instant) -> Option<SuspiciousRst> {
        let baseline = self.baselines.get(&source)?.clone();
        if baseline.ttl.count < self.min_samples {
            return None;
        }

        let ttl_delta = baseline.ttl.distance(u32::from(packet.ttl));
        let ip_id_delta = match (packet.ip_id, baseline.ip_id) {
            (Some(id), Some(range)) if range.count >= self.min_samples => Some(range.distance(u32::from(id))),
            _ => None,
        };

        let ttl_bad = ttl_delta >= self.ttl_threshold;
        let ipid_bad = ip_id_delta.is_some_and(|d| d > self.ipid_threshold);
        let anomaly = match (ttl_bad, ipid_bad) {
            (true, true) => RstAnomaly::TtlAndIpId,
            (true, false) => RstAnomaly::Ttl,
            (false, true) => RstAnomaly::IpId,
            (false, false) => return None,
        };

        let record = SuspiciousRst {
            source,
            anomaly,
            rst_ttl: packet.ttl,
            ttl_range: baseline.ttl,
            ttl_delta,
            rst_ip_id: packet.ip_id,
            ip_id_delta,
            observed_at: now,
            observed_at_utc: Utc::now(),
        };
        debug!(
            source = %source,
            ?anomaly,
            rst_ttl = packet.ttl,
            ttl_min = baseline.ttl.min,
            ttl_max = baseline.ttl.max,
            ttl_delta,
            ip_id_delta,
            "suspicious RST"
        );
        self.suspicious.insert(source, record.clone());
        Some(record)
    }

    /// Latest suspicious RST from `ip`, if still fresh
    pub fn latest_suspicious(&self, ip: IpAddr, now: Instant) -> Option<SuspiciousRst> {
        let record = self.suspicious.get(&ip)?;
        (now.saturating_duration_since(record.observed_at) <= self.freshness).then(|| record.clone())
    }

    /// Whether a fresh suspicious RST from `ip` exists
    pub fn has_suspicious_rst(&self, ip: IpAddr, now: Instant) -> bool {
        self.latest_suspicious(ip, now).is_some()
    }

    /// Current TTL baseline for `ip`
    pub fn ttl_baseline(&self, ip: IpAddr) -> Option<RangeStats> {
        self.baselines.get(&ip).map(|b| b.ttl)
    }

    /// Drop baselines idle for longer than `idle` and stale suspicious records
    pub fn cleanup(&self, now: Instant, idle: Duration) {
        self.baselines
            .retain(|_, b| now.saturating_duration_since(b.updated) < idle);
        self.suspicious
            .retain(|_, r| now.saturating_duration_since(r.observed_at) <= self.freshness);
    }

    /// Number of tracked sources
    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    /// Whether no source is tracked
    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}

impl PacketFilter for RstInspector {
    fn name(&self) -> &str {
        "rst-inspector"
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn process(&self, packet: &mut Packet, ctx: &mut FilterContext) -> Result<FilterVerdict> {
        self.observe(packet, ctx.now());
        Ok(FilterVerdict::Pass)
    }
}
