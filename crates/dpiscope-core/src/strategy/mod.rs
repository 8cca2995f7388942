//! Bypass strategies and plans
//!
//! A [`BypassPlan`] is what the selector recommends for one diagnosis: an
//! ordered list of strategies plus two assist flags that are not strategies
//! themselves. Plans are data only; the apply service turns them into bypass
//! options.

mod catalog;
mod params;
mod plan;
mod selector;

pub use catalog::{candidates_for, StrategyTemplate};
pub use params::{
    normalize_sizes, FragmentPreset, TlsFragmentParams, DEFAULT_FRAGMENT_SIZES, MAX_FRAGMENTS, MIN_FRAGMENT_SIZE,
    PLAN_PRESET_NAME,
};
pub use plan::{plan_signature, PlanSelector};
pub use selector::{RankedStrategy, StrategySelector};

use crate::diagnosis::DiagnosisId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form strategy parameters
pub type StrategyParams = BTreeMap<String, serde_json::Value>;

/// Bypass technique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StrategyId {
    /// Placeholder for "nothing"
    None,
    /// Send ClientHello fragments in reverse order
    TlsDisorder,
    /// Split the ClientHello into TCP segments
    TlsFragment,
    /// Fake ClientHello with a low TTL
    TlsFakeTtl,
    /// Drop inbound RST
    DropRst,
    /// Mangle the HTTP Host header
    HttpHostTricks,
    /// Obfuscate QUIC Initials
    QuicObfuscation,
    /// Fake packets carry a broken checksum
    BadChecksum,
    /// Resolve over DNS-over-HTTPS
    UseDoh,
    /// Tiny ClientHello fragments
    AggressiveFragment,
}

impl StrategyId {
    /// Every id
    pub const ALL: [Self; 10] = [
        Self::None,
        Self::TlsDisorder,
        Self::TlsFragment,
        Self::TlsFakeTtl,
        Self::DropRst,
        Self::HttpHostTricks,
        Self::QuicObfuscation,
        Self::BadChecksum,
        Self::UseDoh,
        Self::AggressiveFragment,
    ];

    /// Stable name, as persisted
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::TlsDisorder => "TlsDisorder",
            Self::TlsFragment => "TlsFragment",
            Self::TlsFakeTtl => "TlsFakeTtl",
            Self::DropRst => "DropRst",
            Self::HttpHostTricks => "HttpHostTricks",
            Self::QuicObfuscation => "QuicObfuscation",
            Self::BadChecksum => "BadChecksum",
            Self::UseDoh => "UseDoh",
            Self::AggressiveFragment => "AggressiveFragment",
        }
    }

    /// Member of the mutually exclusive TLS-mode group
    pub fn is_tls_mode(self) -> bool {
        matches!(self, Self::TlsFragment | Self::TlsDisorder | Self::AggressiveFragment)
    }

    /// Any strategy that reshapes the TLS handshake
    pub fn is_tls_bypass(self) -> bool {
        self.is_tls_mode() || self == Self::TlsFakeTtl
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::config_value("strategy", format!("unknown strategy '{s}'")))
    }
}

/// How disruptive a strategy may be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    /// Safe to apply broadly
    Low,
    /// May break some sites
    Medium,
    /// May break many sites
    High,
}

impl RiskLevel {
    /// Divisor in the ranking weight
    pub fn cost(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

/// One recommended strategy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BypassStrategy {
    /// Technique
    pub id: StrategyId,
    /// Strength from the candidate table
    pub base_priority: u32,
    /// Risk class
    pub risk: RiskLevel,
    /// Technique parameters
    pub parameters: StrategyParams,
}

/// A strategy shown to the operator but never executed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferredStrategy {
    /// Technique
    pub id: StrategyId,
    /// Why it is deferred
    pub reason: String,
    /// Risk class
    pub risk: RiskLevel,
}

/// Output of the selector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BypassPlan {
    /// Strategies to execute, best first
    pub strategies: Vec<BypassStrategy>,
    /// Strategies surfaced for visibility only
    pub deferred_strategies: Vec<DeferredStrategy>,
    /// Diagnosis the plan answers
    pub for_diagnosis: DiagnosisId,
    /// Confidence of that diagnosis
    pub plan_confidence: u8,
    /// Human-readable rationale
    pub reasoning: String,
    /// Force QUIC back to TCP
    pub drop_udp_443: bool,
    /// Tolerate ClientHellos without SNI
    pub allow_no_sni: bool,
    /// When the plan was built
    pub planned_at: DateTime<Utc>,
}

impl BypassPlan {
    /// Plan with nothing to do
    pub fn empty(for_diagnosis: DiagnosisId, plan_confidence: u8, reasoning: impl Into<String>) -> Self {
        Self {
            strategies: Vec::new(),
            deferred_strategies: Vec::new(),
            for_diagnosis,
            plan_confidence,
            reasoning: reasoning.into(),
            drop_udp_443: false,
            allow_no_sni: false,
            planned_at: Utc::now(),
        }
    }

    /// Neither strategies nor assist flags
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty() && !self.drop_udp_443 && !self.allow_no_sni
    }

    /// Whether `id` is among the strategies
    pub fn contains(&self, id: StrategyId) -> bool {
        self.strategies.iter().any(|s| s.id == id)
    }

    /// Strategy entry by id
    pub fn strategy(&self, id: StrategyId) -> Option<&BypassStrategy> {
        self.strategies.iter().find(|s| s.id == id)
    }
}
