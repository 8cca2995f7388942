//! JSON-file persistence for feedback

use super::memory::InMemoryFeedbackStore;
use super::{FeedbackKey, FeedbackStats, FeedbackStore, StrategyOutcome};
use crate::config::FeedbackConfig;
use crate::diagnosis::DiagnosisId;
use crate::error::Result;
use crate::persist;
use crate::strategy::StrategyId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Version written into every document
pub const FEEDBACK_SCHEMA_VERSION: u32 = 1;

/// On-disk document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackDocument {
    /// Format version
    pub schema_version: u32,
    /// Write time
    pub saved_at_utc: DateTime<Utc>,
    /// Entries sorted by diagnosis, then strategy
    pub entries: Vec<FeedbackEntry>,
}

/// One persisted pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    /// Diagnosis
    pub diagnosis_id: DiagnosisId,
    /// Strategy
    pub strategy_id: StrategyId,
    /// Successes
    pub success_count: u32,
    /// Failures
    pub failure_count: u32,
    /// Last outcome time
    pub last_updated_utc: DateTime<Utc>,
}

impl FeedbackDocument {
    /// Document for the given stats
    pub fn from_stats(stats: &BTreeMap<FeedbackKey, FeedbackStats>, saved_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: FEEDBACK_SCHEMA_VERSION,
            saved_at_utc: saved_at,
            // BTreeMap iteration already follows (diagnosis, strategy)
            entries: stats
                .iter()
                .map(|(k, s)| FeedbackEntry {
                    diagnosis_id: k.diagnosis,
                    strategy_id: k.strategy,
                    success_count: s.success_count,
                    failure_count: s.failure_count,
                    last_updated_utc: s.last_updated,
                })
                .collect(),
        }
    }

    /// Stats held by the document
    pub fn into_stats(self) -> BTreeMap<FeedbackKey, FeedbackStats> {
        self.entries
            .into_iter()
            .map(|e| {
                (
                    FeedbackKey::new(e.diagnosis_id, e.strategy_id),
                    FeedbackStats {
                        success_count: e.success_count,
                        failure_count: e.failure_count,
                        last_updated: e.last_updated_utc,
                    },
                )
            })
            .collect()
    }
}

/// [`InMemoryFeedbackStore`] mirrored to a JSON file.
///
/// Loading tolerates a missing or corrupt file by starting empty. Every
/// record and prune rewrites the file atomically; write failures are logged
/// and the in-memory state stays authoritative. Updates and the write that
/// follows them hold one lock, so the file never ends behind memory.
#[derive(Debug)]
pub struct JsonFileFeedbackStore {
    path: PathBuf,
    inner: InMemoryFeedbackStore,
    write_lock: Mutex<()>,
}

impl JsonFileFeedbackStore {
    /// Open, loading whatever is on disk
    pub fn open(path: impl Into<PathBuf>, cfg: &FeedbackConfig) -> Self {
        let path = path.into();
        let inner = InMemoryFeedbackStore::new(cfg);
        match Self::load(&path) {
            Ok(Some(doc)) => {
                debug!(path = %path.display(), entries = doc.entries.len(), "loaded feedback");
                inner.replace(doc.into_stats());
                inner.prune(Utc::now());
            }
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable feedback file"),
        }
        Self {
            path,
            inner,
            write_lock: Mutex::new(()),
        }
    }

    fn load(path: &Path) -> Result<Option<FeedbackDocument>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// File backing the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current state
    pub fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write_snapshot()
    }

    fn write_snapshot(&self) -> Result<()> {
        let doc = FeedbackDocument::from_stats(&self.inner.snapshot(), Utc::now());
        persist::write_json_atomic(&self.path, &doc)
    }

    /// Run `update` and persist its result before anyone else can update
    fn update_and_save(&self, update: impl FnOnce(&InMemoryFeedbackStore)) {
        let _guard = self.write_lock.lock();
        update(&self.inner);
        if let Err(e) = self.write_snapshot() {
            warn!(path = %self.path.display(), error = %e, "failed to persist feedback");
        }
    }
}

impl FeedbackStore for JsonFileFeedbackStore {
    fn stats(&self, key: FeedbackKey) -> Option<FeedbackStats> {
        self.inner.stats(key)
    }

    fn record(&self, key: FeedbackKey, outcome: StrategyOutcome, observed_at: DateTime<Utc>) {
        if outcome == StrategyOutcome::Unknown {
            return;
        }
        self.update_and_save(|inner| inner.record(key, outcome, observed_at));
    }

    fn prune(&self, now: DateTime<Utc>) {
        self.update_and_save(|inner| inner.prune(now));
    }

    fn snapshot(&self) -> BTreeMap<FeedbackKey, FeedbackStats> {
        self.inner.snapshot()
    }
}
