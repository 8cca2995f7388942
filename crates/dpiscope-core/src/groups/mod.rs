//! Group participation
//!
//! Hosts that share infrastructure are handled as a group. Each host
//! attaches what it learned (endpoints, assist flags) to its group; the
//! operator may exclude a host from a group, and a host can be pinned to a
//! group so its group key stays stable. Exclusions and pins are persisted.

mod set;

pub use set::{EffectiveGroupConfig, GroupAttachment, GroupAttachmentSet};

use crate::error::{Error, Result};
use crate::persist::write_json_atomic;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// Version tag written into the persisted document
pub const GROUPS_PERSIST_VERSION: &str = "v3";

/// Plan token for the QUIC fallback assist
pub const TOKEN_DROP_UDP_443: &str = "DROP_UDP_443";
/// Plan token for the no-SNI assist
pub const TOKEN_ALLOW_NO_SNI: &str = "ALLOW_NO_SNI";

/// Trimmed, without leading/trailing dots, lowercase
pub fn normalize_key(value: &str) -> String {
    value.trim().trim_matches('.').to_ascii_lowercase()
}

/// Persisted form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistState {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "SavedAtUtc")]
    saved_at_utc: String,
    #[serde(rename = "ExcludedHostKeysByGroupKey")]
    excluded_host_keys_by_group_key: BTreeMap<String, Vec<String>>,
    #[serde(rename = "PinnedGroupKeyByHostKey")]
    pinned_group_key_by_host_key: BTreeMap<String, String>,
}

/// Everything the UI shows about one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipationSnapshot {
    /// Normalized group key
    pub group_key: String,
    /// Hosts pinned to this group
    pub pinned_host_keys: Vec<String>,
    /// Excluded hosts
    pub excluded_host_keys: Vec<String>,
    /// All attachments
    pub attachments: Vec<GroupAttachment>,
    /// Merge, `None` for an unknown group
    pub effective: Option<EffectiveGroupConfig>,
}

#[derive(Debug, Default)]
struct Inner {
    sets: BTreeMap<String, GroupAttachmentSet>,
    pinned: BTreeMap<String, String>,
}

impl Inner {
    fn set_mut(&mut self, group_key: &str) -> &mut GroupAttachmentSet {
        self.sets.entry(group_key.to_string()).or_default()
    }
}

/// Thread-safe store of every group; one lock for all operations
#[derive(Debug, Default)]
pub struct GroupAttachmentStore {
    inner: Mutex<Inner>,
}

fn split_plan_tokens(plan_text: &str) -> HashSet<String> {
    plan_text
        .split(',')
        .map(|t| t.trim().to_ascii_uppercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn both(group_key: &str, host_key: &str) -> Option<(String, String)> {
    let g = normalize_key(group_key);
    let h = normalize_key(host_key);
    (!g.is_empty() && !h.is_empty()).then_some((g, h))
}

impl GroupAttachmentStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Group `host_key` is pinned to
    pub fn pinned_group(&self, host_key: &str) -> Option<String> {
        self.inner.lock().pinned.get(&normalize_key(host_key)).cloned()
    }

    /// Pin `host_key` to `group_key`; an existing exclusion is kept
    pub fn pin(&self, host_key: &str, group_key: &str) {
        let Some((group, host)) = both(group_key, host_key) else {
            return;
        };
        let mut inner = self.inner.lock();
        inner.pinned.insert(host.clone(), group.clone());
        inner.set_mut(&group).ensure(&host);
    }

    /// Flip the exclusion of `host_key` in `group_key`; returns the new state
    pub fn toggle_excluded(&self, group_key: &str, host_key: &str) -> bool {
        let Some((group, host)) = both(group_key, host_key) else {
            return false;
        };
        let mut inner = self.inner.lock();
        let set = inner.set_mut(&group);
        let now = !set.is_excluded(&host);
        set.set_excluded(&host, now)
    }

    /// Whether `host_key` is excluded from `group_key`
    pub fn is_excluded(&self, group_key: &str, host_key: &str) -> bool {
        let Some((group, host)) = both(group_key, host_key) else {
            return false;
        };
        self.inner.lock().sets.get(&group).is_some_and(|s| s.is_excluded(&host))
    }

    /// Excluded hosts of `group_key`, ordered
    pub fn excluded_hosts(&self, group_key: &str) -> Vec<String> {
        self.inner
            .lock()
            .sets
            .get(&normalize_key(group_key))
            .map(GroupAttachmentSet::excluded_hosts)
            .unwrap_or_default()
    }

    /// Merge of `group_key`; all-empty for unknown groups
    pub fn effective_config(&self, group_key: &str) -> EffectiveGroupConfig {
        self.inner
            .lock()
            .sets
            .get(&normalize_key(group_key))
            .map(GroupAttachmentSet::effective_config)
            .unwrap_or_default()
    }

    /// Record what an apply for `host_key` learned.
    ///
    /// `plan_text` is a comma-separated token list; `DROP_UDP_443` and
    /// `ALLOW_NO_SNI` set the assist flags. A manual exclusion survives.
    pub fn update_attachment_from_apply(
        &self,
        group_key: &str,
        host_key: &str,
        candidate_ip_endpoints: &[String],
        plan_text: &str,
    ) {
        let Some((group, host)) = both(group_key, host_key) else {
            return;
        };
        let endpoints: BTreeSet<String> = candidate_ip_endpoints
            .iter()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        let tokens = split_plan_tokens(plan_text);

        let mut inner = self.inner.lock();
        let set = inner.set_mut(&group);
        let excluded = set.is_excluded(&host);
        set.upsert(GroupAttachment {
            host_key: host,
            excluded,
            candidate_ip_endpoints: endpoints.into_iter().collect(),
            drop_udp_443: tokens.contains(TOKEN_DROP_UDP_443),
            allow_no_sni: tokens.contains(TOKEN_ALLOW_NO_SNI),
            updated_at_utc: Utc::now(),
        });
    }

    /// Snapshot of `group_key` for display
    pub fn participation_snapshot(&self, group_key: &str) -> ParticipationSnapshot {
        let group = normalize_key(group_key);
        let inner = self.inner.lock();
        let set = inner.sets.get(&group);
        let pinned_host_keys = inner
            .pinned
            .iter()
            .filter(|(_, g)| **g == group)
            .map(|(h, _)| h.clone())
            .collect();
        ParticipationSnapshot {
            pinned_host_keys,
            excluded_host_keys: set.map(GroupAttachmentSet::excluded_hosts).unwrap_or_default(),
            attachments: set.map(GroupAttachmentSet::attachments).unwrap_or_default(),
            effective: set.map(GroupAttachmentSet::effective_config),
            group_key: group,
        }
    }

    fn read_state(path: &Path) -> Result<Option<PersistState>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Replace the in-memory state with the file at `path`.
    ///
    /// Documents without pins get one pin per exclusion.
    pub fn load(&self, path: &Path) -> Result<()> {
        let Some(state) = Self::read_state(path)? else {
            return Ok(());
        };

        let mut excluded: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (group, hosts) in state.excluded_host_keys_by_group_key {
            let group = normalize_key(&group);
            let hosts: BTreeSet<String> = hosts.iter().map(|h| normalize_key(h)).filter(|h| !h.is_empty()).collect();
            if !group.is_empty() && !hosts.is_empty() {
                excluded.insert(group, hosts);
            }
        }
        let pinned: BTreeMap<String, String> = state
            .pinned_group_key_by_host_key
            .iter()
            .filter_map(|(h, g)| both(g, h).map(|(g, h)| (h, g)))
            .collect();

        let mut inner = self.inner.lock();
        *inner = Inner::default();
        for (group, hosts) in &excluded {
            let set = inner.set_mut(group);
            for host in hosts {
                set.set_excluded(host, true);
            }
        }
        for (host, group) in &pinned {
            inner.pinned.insert(host.clone(), group.clone());
            inner.set_mut(group).ensure(host);
        }
        if inner.pinned.is_empty() {
            for (group, hosts) in &excluded {
                for host in hosts {
                    inner.pinned.insert(host.clone(), group.clone());
                }
            }
        }
        debug!(groups = inner.sets.len(), pins = inner.pinned.len(), path = %path.display(), "group state loaded");
        Ok(())
    }

    /// [`GroupAttachmentStore::load`], logging instead of failing
    pub fn load_best_effort(&self, path: &Path) {
        if let Err(e) = self.load(path) {
            warn!(error = %e, path = %path.display(), "group state not loaded; starting empty");
        }
    }

    /// Write exclusions and pins to `path` atomically
    pub fn persist(&self, path: &Path, saved_at: DateTime<Utc>) -> Result<()> {
        let state = {
            let inner = self.inner.lock();
            PersistState {
                version: GROUPS_PERSIST_VERSION.to_string(),
                saved_at_utc: saved_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                excluded_host_keys_by_group_key: inner
                    .sets
                    .iter()
                    .map(|(g, s)| (g.clone(), s.excluded_hosts()))
                    .collect(),
                pinned_group_key_by_host_key: inner.pinned.clone(),
            }
        };
        write_json_atomic(path, &state).map_err(|e| match e {
            Error::Persist { .. } => e,
            other => Error::persist(path.display().to_string(), other.to_string()),
        })
    }

    /// [`GroupAttachmentStore::persist`], logging instead of failing
    pub fn persist_best_effort(&self, path: &Path) {
        if let Err(e) = self.persist(path, Utc::now()) {
            warn!(error = %e, "group state not persisted");
        }
    }
}
