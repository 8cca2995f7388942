//! Historical strategy outcomes
//!
//! Outcomes are kept per (diagnosis, strategy) pair and bias the selector's
//! ranking once enough samples exist.

mod file;
mod memory;

pub use file::{FeedbackDocument, FeedbackEntry, JsonFileFeedbackStore, FEEDBACK_SCHEMA_VERSION};
pub use memory::InMemoryFeedbackStore;

use crate::diagnosis::DiagnosisId;
use crate::strategy::StrategyId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of running a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyOutcome {
    /// Not determined; never recorded
    Unknown,
    /// Host became reachable
    Success,
    /// Host stayed blocked
    Failure,
}

/// (diagnosis, strategy) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedbackKey {
    /// Diagnosis the strategy was applied for
    pub diagnosis: DiagnosisId,
    /// Strategy applied
    pub strategy: StrategyId,
}

impl FeedbackKey {
    /// Key for the pair
    pub fn new(diagnosis: DiagnosisId, strategy: StrategyId) -> Self {
        Self { diagnosis, strategy }
    }
}

/// Counters for one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackStats {
    /// Successful outcomes
    pub success_count: u32,
    /// Failed outcomes
    pub failure_count: u32,
    /// Time of the last recorded outcome
    pub last_updated: DateTime<Utc>,
}

impl FeedbackStats {
    /// All recorded outcomes
    pub fn total(&self) -> u32 {
        self.success_count + self.failure_count
    }

    /// Successes / total, 0 when empty
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            t => f64::from(self.success_count) / f64::from(t),
        }
    }
}

/// Storage of [`FeedbackStats`]
pub trait FeedbackStore: Send + Sync {
    /// Stats for one pair
    fn stats(&self, key: FeedbackKey) -> Option<FeedbackStats>;

    /// Count one outcome; `Unknown` is ignored
    fn record(&self, key: FeedbackKey, outcome: StrategyOutcome, observed_at: DateTime<Utc>);

    /// Drop expired entries and enforce the size cap
    fn prune(&self, now: DateTime<Utc>);

    /// Copy of everything stored
    fn snapshot(&self) -> BTreeMap<FeedbackKey, FeedbackStats>;
}
