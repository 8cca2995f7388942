//! Declarative per-flow policies
//!
//! Policies are authored as data ([`FlowPolicy`]), validated for hard
//! conflicts by [`compile`], and looked up per packet through the resulting
//! [`DecisionGraph`]. Packet filters only consult the graph when the
//! matching [`PolicyGates`] switch is on.

mod compiler;
mod condition;
mod gates;
mod graph;

pub use compiler::{compile, detect_hard_conflicts, PolicyCompilationError, PolicyConflict};
pub use condition::{FlowProtocol, MatchCondition, TlsStage};
pub use gates::{is_truthy, PolicyGates};
pub use graph::{DecisionGraph, GraphKey};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Strategy id used by the UDP/443 drop policy
pub const STRATEGY_DROP_UDP_443: &str = "drop_udp_443";

/// What to do with a matching flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PolicyAction {
    /// Let it through untouched
    Pass,
    /// Drop it
    Block,
    /// Run a named technique
    Strategy {
        /// Technique name
        strategy_id: String,
        /// Technique parameters
        #[serde(default)]
        parameters: BTreeMap<String, String>,
    },
}

impl PolicyAction {
    /// Strategy action without parameters
    pub fn strategy(id: impl Into<String>) -> Self {
        Self::Strategy {
            strategy_id: id.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Force QUIC back to TCP
    pub fn drop_udp_443() -> Self {
        Self::strategy(STRATEGY_DROP_UDP_443)
    }

    /// Same kind, and for strategies the same id ignoring case
    pub fn is_equivalent(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Pass, Self::Pass) | (Self::Block, Self::Block) => true,
            (Self::Strategy { strategy_id: a, .. }, Self::Strategy { strategy_id: b, .. }) => {
                a.eq_ignore_ascii_case(b)
            }
            _ => false,
        }
    }

    /// Whether the packet should be dropped
    pub fn drops_packet(&self) -> bool {
        match self {
            Self::Pass => false,
            Self::Block => true,
            Self::Strategy { strategy_id, .. } => strategy_id.eq_ignore_ascii_case(STRATEGY_DROP_UDP_443),
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Block => f.write_str("BLOCK"),
            Self::Strategy { strategy_id, .. } => write!(f, "STRATEGY:{strategy_id}"),
        }
    }
}

/// Reach of a policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyScope {
    /// Tied to one target or group
    #[default]
    Local,
    /// Applies to all traffic
    Global,
}

impl fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "Local",
            Self::Global => "Global",
        })
    }
}

/// One authored rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPolicy {
    /// Stable id
    pub id: String,
    /// Predicate
    #[serde(rename = "match", default)]
    pub condition: MatchCondition,
    /// Action on match
    pub action: PolicyAction,
    /// Reach
    #[serde(default)]
    pub scope: PolicyScope,
    /// Higher wins
    #[serde(default)]
    pub priority: i32,
    /// Lifetime in seconds, if bounded
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Authoring time
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl FlowPolicy {
    /// Local policy with priority 0
    pub fn new(id: impl Into<String>, condition: MatchCondition, action: PolicyAction) -> Self {
        Self {
            id: id.into(),
            condition,
            action,
            scope: PolicyScope::Local,
            priority: 0,
            ttl_secs: None,
            created_at: Utc::now(),
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the scope
    #[must_use]
    pub fn with_scope(mut self, scope: PolicyScope) -> Self {
        self.scope = scope;
        self
    }

    /// Lifetime, if bounded
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

impl fmt::Display for FlowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} prio={} scope={} match=({}) action={}",
            self.id, self.priority, self.scope, self.condition, self.action
        )
    }
}

/// A policy file: `[[policy]]` tables in TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Policies in file order
    #[serde(rename = "policy", default)]
    pub policies: Vec<FlowPolicy>,
}

impl PolicySet {
    /// Parse TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let set: Self = toml::from_str(content)?;
        set.resolved()
    }

    /// Resolve every authored destination set, rejecting bad entries
    fn resolved(mut self) -> Result<Self> {
        for policy in &mut self.policies {
            policy
                .condition
                .resolve_targets()
                .map_err(|e| Error::config_value(format!("policy.{}.match.dst_ip_set", policy.id), e))?;
        }
        Ok(self)
    }

    /// Load from a TOML or JSON file, chosen by extension
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json")) {
            let set: Self = serde_json::from_str(&content)?;
            set.resolved()
        } else {
            Self::from_toml(&content)
        }
    }

    /// Compile into a decision graph
    pub fn compile(&self) -> std::result::Result<DecisionGraph, PolicyCompilationError> {
        compile(&self.policies)
    }
}
