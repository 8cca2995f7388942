//! Per-group attachments

use super::normalize_key;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// One host's contribution to a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAttachment {
    /// Normalized host key
    pub host_key: String,
    /// Manually excluded from the group
    pub excluded: bool,
    /// Endpoints the host resolved to, sorted
    pub candidate_ip_endpoints: Vec<String>,
    /// Host asked for QUIC fallback
    pub drop_udp_443: bool,
    /// Host asked for no-SNI tolerance
    pub allow_no_sni: bool,
    /// Last change
    pub updated_at_utc: DateTime<Utc>,
}

impl GroupAttachment {
    fn bare(host_key: String, excluded: bool) -> Self {
        Self {
            host_key,
            excluded,
            candidate_ip_endpoints: Vec::new(),
            drop_udp_443: false,
            allow_no_sni: false,
            updated_at_utc: Utc::now(),
        }
    }
}

/// Merge of the included attachments of a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveGroupConfig {
    /// Union of endpoints, sorted
    pub candidate_ip_endpoints_union: Vec<String>,
    /// OR over included hosts
    pub drop_udp_443: bool,
    /// OR over included hosts
    pub allow_no_sni: bool,
    /// All attachments
    pub attachment_count: usize,
    /// Attachments not excluded
    pub included_count: usize,
    /// Excluded attachments
    pub excluded_count: usize,
}

/// Attachments of one group, keyed by host
#[derive(Debug, Clone, Default)]
pub struct GroupAttachmentSet {
    attachments: BTreeMap<String, GroupAttachment>,
}

impl GroupAttachmentSet {
    /// Attachments ordered by host key
    pub fn attachments(&self) -> Vec<GroupAttachment> {
        self.attachments.values().cloned().collect()
    }

    /// Excluded host keys, ordered
    pub fn excluded_hosts(&self) -> Vec<String> {
        self.attachments
            .values()
            .filter(|a| a.excluded)
            .map(|a| a.host_key.clone())
            .collect()
    }

    /// Insert or replace; attachments with an empty key are ignored
    pub fn upsert(&mut self, mut attachment: GroupAttachment) {
        let key = normalize_key(&attachment.host_key);
        if key.is_empty() {
            return;
        }
        attachment.host_key.clone_from(&key);
        self.attachments.insert(key, attachment);
    }

    /// Set the exclusion flag, creating a bare attachment when needed
    pub fn set_excluded(&mut self, host_key: &str, excluded: bool) -> bool {
        let key = normalize_key(host_key);
        if key.is_empty() {
            return false;
        }
        self.attachments
            .entry(key.clone())
            .and_modify(|a| {
                a.excluded = excluded;
                a.updated_at_utc = Utc::now();
            })
            .or_insert_with(|| GroupAttachment::bare(key, excluded));
        excluded
    }

    /// Whether `host_key` is excluded
    pub fn is_excluded(&self, host_key: &str) -> bool {
        self.attachments
            .get(&normalize_key(host_key))
            .is_some_and(|a| a.excluded)
    }

    /// Make sure an attachment exists without touching its flags
    pub(super) fn ensure(&mut self, host_key: &str) {
        let excluded = self.is_excluded(host_key);
        self.set_excluded(host_key, excluded);
    }

    /// Deterministic merge of the included attachments
    pub fn effective_config(&self) -> EffectiveGroupConfig {
        let included: Vec<&GroupAttachment> = self.attachments.values().filter(|a| !a.excluded).collect();
        let endpoints: BTreeSet<String> = included
            .iter()
            .flat_map(|a| a.candidate_ip_endpoints.iter())
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        EffectiveGroupConfig {
            candidate_ip_endpoints_union: endpoints.into_iter().collect(),
            drop_udp_443: included.iter().any(|a| a.drop_udp_443),
            allow_no_sni: included.iter().any(|a| a.allow_no_sni),
            attachment_count: self.attachments.len(),
            included_count: included.len(),
            excluded_count: self.attachments.len() - included.len(),
        }
    }

    /// No attachments at all
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(host: &str, endpoints: &[&str], drop_udp: bool) -> GroupAttachment {
        GroupAttachment {
            host_key: host.to_string(),
            excluded: false,
            candidate_ip_endpoints: endpoints.iter().map(|s| (*s).to_string()).collect(),
            drop_udp_443: drop_udp,
            allow_no_sni: false,
            updated_at_utc: Utc::now(),
        }
    }

    #[test]
    fn test_effective_config_merges_included() {
        let mut set = GroupAttachmentSet::default();
        set.upsert(attachment("a.example", &["203.0.113.2:443", "203.0.113.1:443"], false));
        set.upsert(attachment("b.example", &["203.0.113.1:443", "198.51.100.9:443"], true));
        set.upsert(attachment("c.example", &["192.0.2.1:443"], false));
        set.set_excluded("b.example", true);

        let cfg = set.effective_config();
        assert_eq!(cfg.candidate_ip_endpoints_union, ["192.0.2.1:443", "203.0.113.1:443", "203.0.113.2:443"]);
        assert!(!cfg.drop_udp_443);
        assert_eq!((cfg.attachment_count, cfg.included_count, cfg.excluded_count), (3, 2, 1));
    }

    #[test]
    fn test_keys_normalized() {
        let mut set = GroupAttachmentSet::default();
        set.set_excluded(" Video.Example. ", true);
        assert!(set.is_excluded("video.example"));
        assert_eq!(set.excluded_hosts(), ["video.example"]);
        assert!(!set.set_excluded("  ", true));
    }

    #[test]
    fn test_ensure_keeps_flag() {
        let mut set = GroupAttachmentSet::default();
        set.set_excluded("x.example", true);
        set.ensure("x.example");
        set.ensure("y.example");
        assert!(set.is_excluded("x.example"));
        assert!(!set.is_excluded("y.example"));
        assert_eq!(set.attachments().len(), 2);
    }
}
