//! Per-host, TTL-bounded fact store
//!
//! Eviction has no background timer. Each append evicts expired events from
//! its own bucket, and every `sweep_every`-th append walks all buckets,
//! evicting expired events and dropping buckets that are empty and stale.
//! The cost of expiry is therefore paid by writers, amortized over appends.
//!
//! Each bucket has its own lock. The sweep takes bucket locks one at a time;
//! no lock covering the whole store is held while it runs. Reads return
//! copies so bucket locks are held only for the copy.
//!
//! A bucket removed by the sweep is marked retired under its lock, and an
//! append that finds its bucket retired fetches the live one and retries.

use super::event::{SignalEvent, SignalType};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Ordered facts for one host key
#[derive(Debug, Clone)]
pub struct SignalSequence {
    /// Bucket identity
    pub host_key: String,
    /// Facts, oldest first (barring out-of-order arrivals)
    pub events: VecDeque<SignalEvent>,
    /// First append
    pub first_seen: DateTime<Utc>,
    /// Latest append
    pub last_updated: DateTime<Utc>,
    unordered: bool,
    retired: bool,
}

impl SignalSequence {
    fn new(host_key: &str, now: DateTime<Utc>) -> Self {
        Self {
            host_key: host_key.to_string(),
            events: VecDeque::new(),
            first_seen: now,
            last_updated: now,
            unordered: false,
            retired: false,
        }
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.events.front().is_some_and(|e| e.observed_at < cutoff) {
            self.events.pop_front();
        }
        if self.unordered {
            self.events.retain(|e| e.observed_at >= cutoff);
        }
        if self.events.is_empty() {
            self.unordered = false;
        }
    }
}

/// Concurrent store of [`SignalSequence`]s
#[derive(Debug)]
pub struct SignalStore {
    buckets: DashMap<String, Arc<Mutex<SignalSequence>>>,
    ttl: ChronoDuration,
    sweep_every: u64,
    appends: AtomicU64,
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

impl SignalStore {
    /// Store with the given event TTL and sweep period
    pub fn new(ttl: Duration, sweep_every: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            ttl: to_chrono(ttl),
            sweep_every: sweep_every.max(1),
            appends: AtomicU64::new(0),
        }
    }

    fn bucket(&self, host_key: &str, now: DateTime<Utc>) -> Arc<Mutex<SignalSequence>> {
        if let Some(existing) = self.buckets.get(host_key) {
            return Arc::clone(&existing);
        }
        Arc::clone(
            &self
                .buckets
                .entry(host_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SignalSequence::new(host_key, now)))),
        )
    }

    /// Append at the current time
    pub fn append(&self, event: SignalEvent) {
        self.append_at(event, Utc::now());
    }

    /// Append with an explicit "now" used for eviction
    pub fn append_at(&self, event: SignalEvent, now: DateTime<Utc>) {
        let bucket = self.bucket(&event.host_key, now);
        self.append_into(bucket, event, now);
    }

    fn append_into(&self, mut bucket: Arc<Mutex<SignalSequence>>, event: SignalEvent, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        loop {
            {
                let mut seq = bucket.lock();
                if !seq.retired {
                    seq.evict_before(cutoff);
                    if seq.events.back().is_some_and(|last| last.observed_at > event.observed_at) {
                        seq.unordered = true;
                    }
                    if event.observed_at >= cutoff {
                        seq.events.push_back(event);
                    }
                    seq.last_updated = now;
                    break;
                }
            }
            bucket = self.bucket(&event.host_key, now);
        }

        let n = self.appends.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.sweep_every == 0 {
            self.sweep(now);
        }
    }

    /// Evict expired events everywhere and drop empty, stale buckets
    pub fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        let snapshot: Vec<(String, Arc<Mutex<SignalSequence>>)> = self
            .buckets
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut removed = 0usize;
        for (key, bucket) in snapshot {
            let empty_and_stale = {
                let mut seq = bucket.lock();
                seq.evict_before(cutoff);
                seq.events.is_empty() && seq.last_updated < cutoff
            };
            if empty_and_stale
                && self
                    .buckets
                    .remove_if(&key, |_, b| {
                        let mut seq = b.lock();
                        seq.retired = seq.events.is_empty() && seq.last_updated < cutoff;
                        seq.retired
                    })
                    .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            trace!(removed, remaining = self.buckets.len(), "signal store sweep");
        }
    }

    /// Copies of the events for `host_key` observed within `window` of `now`
    pub fn read_window(&self, host_key: &str, window: Duration, now: DateTime<Utc>) -> Vec<SignalEvent> {
        let Some(bucket) = self.buckets.get(host_key).map(|b| Arc::clone(&b)) else {
            return Vec::new();
        };
        let cutoff = (now - to_chrono(window)).max(now - self.ttl);
        let seq = bucket.lock();
        seq.events
            .iter()
            .filter(|e| e.observed_at >= cutoff && e.observed_at <= now)
            .cloned()
            .collect()
    }

    /// Most recent event of `kind` for `host_key`
    pub fn try_get_latest(&self, host_key: &str, kind: SignalType) -> Option<SignalEvent> {
        let bucket = self.buckets.get(host_key).map(|b| Arc::clone(&b))?;
        let seq = bucket.lock();
        seq.events
            .iter()
            .filter(|e| e.kind == kind)
            .max_by_key(|e| e.observed_at)
            .cloned()
    }

    /// Copy of the whole sequence for `host_key`
    pub fn sequence(&self, host_key: &str) -> Option<SignalSequence> {
        let bucket = self.buckets.get(host_key).map(|b| Arc::clone(&b))?;
        let seq = bucket.lock().clone();
        Some(seq)
    }

    /// Number of host buckets
    pub fn count_host_keys(&self) -> usize {
        self.buckets.len()
    }

    /// All host keys, sorted
    pub fn host_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}
