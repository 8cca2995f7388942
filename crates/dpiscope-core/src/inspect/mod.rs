//! Wire inspectors
//!
//! Passive filters that watch the interception chain and keep per-flow or
//! per-address state. They never mutate or veto packets. The signals adapter
//! reads their state through [`WireInspectors::snapshot_for`] when a host is
//! evaluated.

mod flow;
mod redirect;
mod retrans;
mod rst;
mod udp;

pub use flow::FlowKey;
pub use redirect::{etld_plus_one, normalize_host, RedirectDetector, RedirectRecord};
pub use retrans::{RetransStats, RetransmissionTracker};
pub use rst::{RangeStats, RstAnomaly, RstInspector, SuspiciousRst};
pub use udp::{classify_handshake, UdpHandshakeKind, UdpHandshakeTracker, UnansweredHandshakes};

use crate::config::InspectConfig;
use crate::intercept::FilterChain;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the inspectors currently know about one remote address
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InspectionSnapshot {
    /// Retransmitted segments on flows with this address
    pub retransmissions: u64,
    /// Total TCP packets on flows with this address
    pub total_packets: u64,
    /// Latest redirect from this address, same-site upgrades excluded
    pub redirect: Option<RedirectRecord>,
    /// Distinct redirect targets (eTLD+1) inside the burst window
    pub redirect_burst_count: usize,
    /// Fresh suspicious RST from this address
    pub suspicious_rst: Option<SuspiciousRst>,
    /// Outbound UDP handshakes with no reply
    pub udp_unanswered: u32,
}

impl InspectionSnapshot {
    /// Whether a qualifying redirect was seen
    pub fn has_http_redirect(&self) -> bool {
        self.redirect.is_some()
    }
}

/// The four wire inspectors, shared between the chain and the adapter
#[derive(Debug, Clone)]
pub struct WireInspectors {
    /// RST anomaly detector
    pub rst: Arc<RstInspector>,
    /// Retransmission tracker
    pub retrans: Arc<RetransmissionTracker>,
    /// HTTP redirect detector
    pub redirect: Arc<RedirectDetector>,
    /// UDP handshake tracker
    pub udp: Arc<UdpHandshakeTracker>,
    flow_idle: Duration,
}

impl WireInspectors {
    /// Build all inspectors from the `[inspect]` section
    pub fn new(cfg: &InspectConfig) -> Self {
        Self {
            rst: Arc::new(RstInspector::new(cfg)),
            retrans: Arc::new(RetransmissionTracker::new(
                cfg.retrans_min_packets,
                cfg.retrans_suspicious_ratio,
            )),
            redirect: Arc::new(RedirectDetector::new(cfg)),
            udp: Arc::new(UdpHandshakeTracker::new(cfg.udp_unanswered_threshold)),
            flow_idle: cfg.flow_idle(),
        }
    }

    /// Register every inspector on `chain`
    pub fn attach(&self, chain: &FilterChain) {
        chain.register(self.rst.clone());
        chain.register(self.retrans.clone());
        chain.register(self.redirect.clone());
        chain.register(self.udp.clone());
    }

    /// Remove every inspector from `chain`
    pub fn detach(&self, chain: &FilterChain) {
        for name in ["rst-inspector", "retrans-tracker", "http-redirect-detector", "udp-handshake-tracker"] {
            chain.remove(name);
        }
    }

    /// Current view of one remote address
    pub fn snapshot_for(&self, ip: IpAddr, now: Instant) -> InspectionSnapshot {
        let retrans = self.retrans.stats_for_ip(ip);
        InspectionSnapshot {
            retransmissions: retrans.retransmissions,
            total_packets: retrans.total_packets,
            redirect: self
                .redirect
                .latest_for_ip(ip, now)
                .filter(|r| !r.is_same_site_upgrade()),
            redirect_burst_count: self.redirect.burst_count(now),
            suspicious_rst: self.rst.latest_suspicious(ip, now),
            udp_unanswered: self.udp.unanswered_count(ip),
        }
    }

    /// Drop idle per-flow and per-address state
    pub fn cleanup(&self, now: Instant) {
        self.rst.cleanup(now, self.flow_idle);
        self.retrans.cleanup(now, self.flow_idle);
        self.redirect.cleanup(now, self.flow_idle);
        self.udp.cleanup(now, self.flow_idle);
    }
}
