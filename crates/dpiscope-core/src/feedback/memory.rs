//! In-memory feedback store behind one lock

use super::{FeedbackKey, FeedbackStats, FeedbackStore, StrategyOutcome};
use crate::config::FeedbackConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Feedback counters with TTL and a size cap, pruned on every record
#[derive(Debug)]
pub struct InMemoryFeedbackStore {
    ttl: ChronoDuration,
    max_entries: usize,
    stats: Mutex<HashMap<FeedbackKey, FeedbackStats>>,
}

impl InMemoryFeedbackStore {
    /// Empty store
    pub fn new(cfg: &FeedbackConfig) -> Self {
        Self {
            ttl: ChronoDuration::days(i64::from(cfg.ttl_days)),
            max_entries: cfg.max_entries,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the whole content, used when loading from disk
    pub fn replace(&self, data: BTreeMap<FeedbackKey, FeedbackStats>) {
        *self.stats.lock() = data.into_iter().collect();
    }

    /// Number of stored pairs
    pub fn len(&self) -> usize {
        self.stats.lock().len()
    }

    /// Nothing stored
    pub fn is_empty(&self) -> bool {
        self.stats.lock().is_empty()
    }

    fn prune_locked(&self, stats: &mut HashMap<FeedbackKey, FeedbackStats>, now: DateTime<Utc>) {
        let before = stats.len();
        if self.ttl > ChronoDuration::zero() {
            let threshold = now - self.ttl;
            stats.retain(|_, s| s.last_updated >= threshold);
        }

        if self.max_entries > 0 && stats.len() > self.max_entries {
            // Oldest first, ties broken by key
            let mut ordered: Vec<(DateTime<Utc>, FeedbackKey)> =
                stats.iter().map(|(k, s)| (s.last_updated, *k)).collect();
            ordered.sort();
            let extra = stats.len() - self.max_entries;
            for (_, key) in ordered.into_iter().take(extra) {
                stats.remove(&key);
            }
        }

        if stats.len() != before {
            trace!(removed = before - stats.len(), "pruned feedback entries");
        }
    }
}

impl FeedbackStore for InMemoryFeedbackStore {
    fn stats(&self, key: FeedbackKey) -> Option<FeedbackStats> {
        self.stats.lock().get(&key).copied()
    }

    fn record(&self, key: FeedbackKey, outcome: StrategyOutcome, observed_at: DateTime<Utc>) {
        if outcome == StrategyOutcome::Unknown {
            return;
        }
        let mut stats = self.stats.lock();
        let entry = stats.entry(key).or_insert(FeedbackStats {
            success_count: 0,
            failure_count: 0,
            last_updated: observed_at,
        });
        match outcome {
            StrategyOutcome::Success => entry.success_count += 1,
            StrategyOutcome::Failure => entry.failure_count += 1,
            StrategyOutcome::Unknown => {}
        }
        entry.last_updated = observed_at;
        self.prune_locked(&mut stats, observed_at);
    }

    fn prune(&self, now: DateTime<Utc>) {
        let mut stats = self.stats.lock();
        self.prune_locked(&mut stats, now);
    }

    fn snapshot(&self) -> BTreeMap<FeedbackKey, FeedbackStats> {
        self.stats.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }
}
