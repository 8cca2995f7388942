//! Windowed aggregate of a host's facts

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;

/// Facts about one host aggregated over a time window.
///
/// Optional fields are `None` when there is no data, never zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockageSignals {
    /// Host bucket
    pub host_key: String,
    /// When the snapshot was built
    pub captured_at: DateTime<Utc>,
    /// Aggregation window
    pub window: Duration,

    /// TCP reset observed (host test or wire)
    pub has_tcp_reset: bool,
    /// TCP connect timed out
    pub has_tcp_timeout: bool,
    /// Retransmitted / total, when any packet was counted
    pub retransmission_rate: Option<f64>,

    /// RST TTL distance from the sender's normal range
    pub rst_ttl_delta: Option<u32>,
    /// RST IP-ID distance from the sender's normal range
    pub rst_ip_id_delta: Option<u32>,
    /// Suspicious RST events in the window
    pub suspicious_rst_count: u32,
    /// Time from connect to reset
    pub rst_latency: Option<Duration>,

    /// DNS did not resolve cleanly
    pub has_dns_failure: bool,
    /// Resolved into the service range
    pub has_fake_ip: bool,

    /// Substituted redirect seen
    pub has_http_redirect: bool,
    /// Redirect target host
    pub redirect_to_host: Option<String>,

    /// Unanswered UDP handshakes
    pub udp_unanswered_handshakes: u32,
    /// HTTP/3 probes attempted
    pub http3_attempt_count: u32,
    /// HTTP/3 probes that succeeded
    pub http3_success_count: u32,
    /// HTTP/3 probes that failed (timeouts included)
    pub http3_failure_count: u32,
    /// HTTP/3 probes that timed out
    pub http3_timeout_count: u32,
    /// HTTP/3 probes where the server lacked support
    pub http3_not_supported_count: u32,

    /// Host tests in the window
    pub host_tested_count: u32,
    /// Host tests sent without SNI
    pub host_tested_no_sni_count: u32,

    /// TLS handshake timed out
    pub has_tls_timeout: bool,
    /// TLS handshake failed authentication
    pub has_tls_auth_failure: bool,
    /// TLS connection reset mid-handshake
    pub has_tls_reset: bool,

    /// Events in the window
    pub sample_size: u32,
    /// Too few samples and no strong fact
    pub is_unreliable: bool,
}

impl BlockageSignals {
    /// Snapshot with no facts at all
    pub fn empty(host_key: impl Into<String>, captured_at: DateTime<Utc>, window: Duration) -> Self {
        Self {
            host_key: host_key.into(),
            captured_at,
            window,
            has_tcp_reset: false,
            has_tcp_timeout: false,
            retransmission_rate: None,
            rst_ttl_delta: None,
            rst_ip_id_delta: None,
            suspicious_rst_count: 0,
            rst_latency: None,
            has_dns_failure: false,
            has_fake_ip: false,
            has_http_redirect: false,
            redirect_to_host: None,
            udp_unanswered_handshakes: 0,
            http3_attempt_count: 0,
            http3_success_count: 0,
            http3_failure_count: 0,
            http3_timeout_count: 0,
            http3_not_supported_count: 0,
            host_tested_count: 0,
            host_tested_no_sni_count: 0,
            has_tls_timeout: false,
            has_tls_auth_failure: false,
            has_tls_reset: false,
            sample_size: 0,
            is_unreliable: false,
        }
    }

    /// Any TLS-layer failure
    pub fn has_tls_issue(&self) -> bool {
        self.has_tls_timeout || self.has_tls_auth_failure || self.has_tls_reset
    }

    /// Any failure above DNS
    pub fn has_transport_issue(&self) -> bool {
        self.has_tcp_timeout || self.has_tcp_reset || self.has_tls_issue() || self.has_http_redirect
    }

    /// At least one blockage flag is set
    pub fn has_any_flag(&self) -> bool {
        self.has_dns_failure || self.has_fake_ip || self.has_transport_issue() || self.http3_failure_count > 0
    }

    /// Whether a single observation is already enough to reason about
    pub fn has_strong_fact(&self) -> bool {
        self.has_any_flag() || self.retransmission_rate.is_some()
    }
}

/// Address inside 198.18.0.0/15, the range filtering resolvers hand out
/// instead of the real destination
pub fn is_fake_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 198 && (o[1] & 0xFE) == 18
        }
        IpAddr::V6(_) => false,
    }
}
