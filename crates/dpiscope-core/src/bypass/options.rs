//! Live bypass configuration

use crate::strategy::{normalize_sizes, FragmentPreset, DEFAULT_FRAGMENT_SIZES};
use serde::{Deserialize, Serialize};

/// TTL used by the TTL trick when none is configured
pub const DEFAULT_TTL_TRICK_VALUE: u8 = 3;

/// Everything the bypass filter does, as one value.
///
/// Options are replaced wholesale; the filter never sees a half-applied
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsBypassOptions {
    /// Split the ClientHello in order
    pub fragment_enabled: bool,
    /// Split the ClientHello and send it back to front
    pub disorder_enabled: bool,
    /// Send a decoy ClientHello first
    pub fake_enabled: bool,
    /// Drop inbound RST
    pub drop_rst_enabled: bool,
    /// Treat ClientHellos without SNI like any other
    pub allow_no_sni: bool,
    /// Drop outbound QUIC on UDP/443
    pub drop_udp_443: bool,
    /// Drop UDP/443 for every destination, ignoring policies
    pub drop_udp_443_global: bool,
    /// Split the HTTP request inside the Host header name
    pub http_host_tricks_enabled: bool,
    /// Decoys carry a broken transport checksum
    pub bad_checksum_enabled: bool,
    /// Fragment sizes in bytes, first to last
    pub fragment_sizes: Vec<u32>,
    /// Preset the sizes came from
    pub preset_name: String,
    /// Let auto-adjust move to the aggressive preset
    pub auto_adjust_aggressive: bool,
    /// Send a low-TTL copy before the real packet
    pub ttl_trick_enabled: bool,
    /// TTL of the copy
    pub ttl_trick_value: u8,
    /// Derive the TTL from the server's observed hop count
    pub auto_ttl_enabled: bool,
}

impl Default for TlsBypassOptions {
    fn default() -> Self {
        Self {
            fragment_enabled: false,
            disorder_enabled: false,
            fake_enabled: false,
            drop_rst_enabled: false,
            allow_no_sni: false,
            drop_udp_443: false,
            drop_udp_443_global: false,
            http_host_tricks_enabled: false,
            bad_checksum_enabled: false,
            fragment_sizes: DEFAULT_FRAGMENT_SIZES.to_vec(),
            preset_name: "Standard".to_string(),
            auto_adjust_aggressive: false,
            ttl_trick_enabled: false,
            ttl_trick_value: DEFAULT_TTL_TRICK_VALUE,
            auto_ttl_enabled: false,
        }
    }
}

impl TlsBypassOptions {
    /// Whether the filter has anything to do
    pub fn is_any_enabled(&self) -> bool {
        self.fragment_enabled
            || self.disorder_enabled
            || self.fake_enabled
            || self.drop_rst_enabled
            || self.allow_no_sni
            || self.drop_udp_443
            || self.ttl_trick_enabled
            || self.http_host_tricks_enabled
            || self.bad_checksum_enabled
    }

    /// Sanitized copy: sizes positive, at least 4, at most 4 entries, `[64]`
    /// when empty; TTL value 0 becomes the default
    #[must_use]
    pub fn normalize(&self) -> Self {
        let sizes = normalize_sizes(self.fragment_sizes.iter().map(|s| i64::from(*s)));
        let ttl = if self.ttl_trick_value == 0 {
            DEFAULT_TTL_TRICK_VALUE
        } else {
            self.ttl_trick_value
        };
        let preset_name = if self.preset_name.trim().is_empty() {
            FragmentPreset::for_sizes(&sizes).name
        } else {
            self.preset_name.clone()
        };
        Self {
            fragment_sizes: sizes,
            ttl_trick_value: ttl,
            preset_name,
            ..self.clone()
        }
    }

    /// Copy with every technique switched off; sizes and preset are kept
    #[must_use]
    pub fn disabled(&self) -> Self {
        Self {
            fragment_enabled: false,
            disorder_enabled: false,
            fake_enabled: false,
            drop_rst_enabled: false,
            allow_no_sni: false,
            drop_udp_443: false,
            drop_udp_443_global: false,
            http_host_tricks_enabled: false,
            bad_checksum_enabled: false,
            ttl_trick_enabled: false,
            auto_ttl_enabled: false,
            ..self.clone()
        }
    }

    /// Sizes joined with `/`, or `default`
    pub fn fragment_sizes_as_text(&self) -> String {
        if self.fragment_sizes.is_empty() {
            return "default".to_string();
        }
        self.fragment_sizes
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// One-line summary such as `Fragment + DROP RST`
    pub fn to_readable_strategy(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.fragment_enabled {
            parts.push("Fragment".into());
        }
        if self.disorder_enabled {
            parts.push("Disorder".into());
        }
        if self.fake_enabled {
            parts.push("Fake".into());
        }
        if self.drop_rst_enabled {
            parts.push("DROP RST".into());
        }
        if self.drop_udp_443 {
            parts.push(if self.drop_udp_443_global {
                "DROP UDP/443 (GLOBAL)".into()
            } else {
                "DROP UDP/443".into()
            });
        }
        if self.allow_no_sni {
            parts.push("AllowNoSNI".into());
        }
        if self.ttl_trick_enabled {
            let label = if self.auto_ttl_enabled { "AutoTTL" } else { "TTL" };
            parts.push(format!("{label}({})", self.ttl_trick_value));
        }
        if self.http_host_tricks_enabled {
            parts.push("HTTP Host tricks".into());
        }
        if self.bad_checksum_enabled {
            parts.push("BadChecksum".into());
        }
        if parts.is_empty() {
            "Off".to_string()
        } else {
            parts.join(" + ")
        }
    }
}
