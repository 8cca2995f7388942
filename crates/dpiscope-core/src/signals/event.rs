//! Immutable observed facts

use super::host_tested::HostTested;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Kind of fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalType {
    /// One-shot host test result
    HostTested,
    /// Retransmission counters for the host
    TcpRetransStats,
    /// Forged-looking RST from the host
    SuspiciousRstObserved,
    /// 3xx redirect from the host
    HttpRedirectObserved,
    /// UDP handshakes to the host never answered
    UdpHandshakeUnanswered,
}

impl SignalType {
    /// Short label used in progress timelines
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostTested => "HostTested",
            Self::TcpRetransStats => "TcpRetransStats",
            Self::SuspiciousRstObserved => "SuspiciousRstObserved",
            Self::HttpRedirectObserved => "HttpRedirectObserved",
            Self::UdpHandshakeUnanswered => "UdpHandshakeUnanswered",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload of a fact
#[derive(Debug, Clone, PartialEq)]
pub enum SignalValue {
    /// Host test record
    HostTested(Box<HostTested>),
    /// Retransmission counters
    Retrans {
        /// Retransmitted segments
        retransmissions: u64,
        /// All packets
        total_packets: u64,
    },
    /// Suspicious RST details
    SuspiciousRst {
        /// Sender
        source: IpAddr,
        /// TTL on the RST
        rst_ttl: u8,
        /// TTL distance from baseline
        ttl_delta: u32,
        /// IP-ID distance from baseline
        ip_id_delta: Option<u32>,
    },
    /// Redirect details
    HttpRedirect {
        /// Target host
        target_host: String,
        /// eTLD+1 of the target
        target_etld: Option<String>,
        /// Distinct targets in the burst window
        burst_count: usize,
    },
    /// Unanswered UDP handshakes
    UdpUnanswered {
        /// Attempts without a reply
        count: u32,
    },
}

/// One immutable fact about a host
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEvent {
    /// Host bucket this fact belongs to
    pub host_key: String,
    /// Kind
    pub kind: SignalType,
    /// Observation time
    pub observed_at: DateTime<Utc>,
    /// Producer name
    pub source: &'static str,
    /// Payload
    pub value: SignalValue,
    /// Optional human-readable reason
    pub reason: Option<String>,
    /// Free-form annotations
    pub metadata: BTreeMap<String, String>,
}

impl SignalEvent {
    /// New event without reason or metadata
    pub fn new(
        host_key: impl Into<String>,
        kind: SignalType,
        observed_at: DateTime<Utc>,
        source: &'static str,
        value: SignalValue,
    ) -> Self {
        Self {
            host_key: host_key.into(),
            kind,
            observed_at,
            source,
            value,
            reason: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a reason
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach one metadata entry
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Host test payload, if this is a `HostTested` event
    pub fn as_host_tested(&self) -> Option<&HostTested> {
        match &self.value {
            SignalValue::HostTested(t) => Some(t),
            _ => None,
        }
    }
}
