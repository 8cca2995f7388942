//! Rule-based diagnosis of why a host is unreachable

mod engine;

pub use engine::DiagnosisEngine;

use crate::signals::BlockageSignals;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Blocking technique believed to be in play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosisId {
    /// Not enough evidence, or evidence that fits nothing better
    Unknown,
    /// Nothing wrong observed
    NoBlockage,
    /// Resolver lies or refuses
    DnsHijack,
    /// Packets vanish without a reset
    SilentDrop,
    /// Forged resets from equipment close to the client
    ActiveDpiEdge,
    /// Forged resets after connection-state tracking
    StatefulDpi,
    /// DNS and transport interference together
    MultiLayerBlock,
    /// TLS handshake disrupted
    TlsInterference,
    /// Plaintext HTTP answered with a substituted redirect
    HttpRedirect,
    /// QUIC blocked while TCP works
    QuicInterference,
}

impl DiagnosisId {
    /// Every id
    pub const ALL: [Self; 10] = [
        Self::Unknown,
        Self::NoBlockage,
        Self::DnsHijack,
        Self::SilentDrop,
        Self::ActiveDpiEdge,
        Self::StatefulDpi,
        Self::MultiLayerBlock,
        Self::TlsInterference,
        Self::HttpRedirect,
        Self::QuicInterference,
    ];

    /// Stable name, as persisted
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::NoBlockage => "NoBlockage",
            Self::DnsHijack => "DnsHijack",
            Self::SilentDrop => "SilentDrop",
            Self::ActiveDpiEdge => "ActiveDpiEdge",
            Self::StatefulDpi => "StatefulDpi",
            Self::MultiLayerBlock => "MultiLayerBlock",
            Self::TlsInterference => "TlsInterference",
            Self::HttpRedirect => "HttpRedirect",
            Self::QuicInterference => "QuicInterference",
        }
    }
}

impl fmt::Display for DiagnosisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiagnosisId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::config_value("diagnosis", format!("unknown diagnosis '{s}'")))
    }
}

/// Outcome of one diagnosis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisResult {
    /// Verdict
    pub diagnosis_id: DiagnosisId,
    /// 0..=100
    pub confidence: u8,
    /// Name of the rule that fired
    pub matched_rule: &'static str,
    /// Human-readable observations
    pub notes: Vec<String>,
    /// Machine-readable observations
    pub evidence: BTreeMap<String, String>,
    /// Snapshot the verdict was computed from
    pub input: BlockageSignals,
    /// When
    pub diagnosed_at: DateTime<Utc>,
}

impl DiagnosisResult {
    /// Evidence value by key
    pub fn evidence(&self, key: &str) -> Option<&str> {
        self.evidence.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnosis_id_round_trip_names() {
        for id in DiagnosisId::ALL {
            assert_eq!(id.as_str().parse::<DiagnosisId>().unwrap(), id);
        }
        assert_eq!("silentdrop".parse::<DiagnosisId>().unwrap(), DiagnosisId::SilentDrop);
        assert!("Bogus".parse::<DiagnosisId>().is_err());
    }

    #[test]
    fn test_diagnosis_id_serde_uses_name() {
        assert_eq!(serde_json::to_string(&DiagnosisId::ActiveDpiEdge).unwrap(), "\"ActiveDpiEdge\"");
    }
}
