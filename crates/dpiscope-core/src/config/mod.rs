//! Configuration management
//!
//! Strongly-typed TOML configuration. Every section is `#[serde(default)]`,
//! so a partial file only overrides what it names. The empirically chosen
//! detection constants (RST TTL/IP-ID thresholds, latency cut-offs) live
//! here as tunables rather than being baked into the detectors.

use crate::apply::DNS_PRESETS;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Wire inspector tunables
    pub inspect: InspectConfig,
    /// Signal store and adapter
    pub signals: SignalsConfig,
    /// Diagnosis thresholds
    pub diagnosis: DiagnosisConfig,
    /// Strategy selection gates
    pub selector: SelectorConfig,
    /// Feedback persistence
    pub feedback: FeedbackConfig,
    /// Apply/rollback service
    pub apply: ApplyConfig,
    /// Group participation persistence
    pub groups: GroupsConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(Error::from)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let i = &self.inspect;
        if i.rst_ttl_threshold == 0 {
            return Err(Error::config_value("inspect.rst_ttl_threshold", "must be at least 1"));
        }
        if i.rst_min_samples == 0 {
            return Err(Error::config_value("inspect.rst_min_samples", "must be at least 1"));
        }
        if i.redirect_buffer_bytes < 16 {
            return Err(Error::config_value("inspect.redirect_buffer_bytes", "must be at least 16"));
        }
        if i.redirect_retention_secs < i.redirect_burst_window_secs {
            return Err(Error::config_value(
                "inspect.redirect_retention_secs",
                "must not be shorter than redirect_burst_window_secs",
            ));
        }
        if i.udp_unanswered_threshold == 0 {
            return Err(Error::config_value("inspect.udp_unanswered_threshold", "must be at least 1"));
        }

        let s = &self.signals;
        if s.window_secs == 0 || s.extended_window_secs < s.window_secs {
            return Err(Error::config_value(
                "signals.extended_window_secs",
                "windows must be non-zero and extended_window_secs >= window_secs",
            ));
        }
        if s.event_ttl_secs < s.extended_window_secs {
            return Err(Error::config_value("signals.event_ttl_secs", "must cover the extended window"));
        }
        if s.sweep_every == 0 {
            return Err(Error::config_value("signals.sweep_every", "must be at least 1"));
        }

        let d = &self.diagnosis;
        if d.edge_latency_ms >= d.stateful_latency_ms {
            return Err(Error::config_value(
                "diagnosis.edge_latency_ms",
                "must be below stateful_latency_ms",
            ));
        }
        if !(d.retx_rate_threshold > 0.0 && d.retx_rate_threshold <= 1.0) {
            return Err(Error::config_value("diagnosis.retx_rate_threshold", "must be in (0, 1]"));
        }

        let sel = &self.selector;
        if sel.min_confidence > sel.high_risk_min_confidence || sel.high_risk_min_confidence > 100 {
            return Err(Error::config_value(
                "selector.high_risk_min_confidence",
                "must satisfy min_confidence <= high_risk_min_confidence <= 100",
            ));
        }
        if sel.success_rate_low > sel.success_rate_high {
            return Err(Error::config_value("selector.success_rate_low", "must not exceed success_rate_high"));
        }

        if self.feedback.max_entries == 0 {
            return Err(Error::config_value("feedback.max_entries", "must be at least 1"));
        }
        if self.apply.timeout_ms == 0 {
            return Err(Error::config_value("apply.timeout_ms", "must be non-zero"));
        }
        if !DNS_PRESETS.iter().any(|p| p.name.eq_ignore_ascii_case(self.apply.dns_preset.trim())) {
            return Err(Error::config_value("apply.dns_preset", format!("unknown preset '{}'", self.apply.dns_preset)));
        }
        Ok(())
    }
}

/// Wire inspector tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectConfig {
    /// RST TTL distance outside the observed range that counts as suspicious
    pub rst_ttl_threshold: u8,
    /// RST IP-ID distance outside the observed range that counts as suspicious
    pub rst_ipid_threshold: u32,
    /// Baseline samples required before an RST is judged
    pub rst_min_samples: u32,
    /// How long a suspicious RST stays "fresh"
    pub rst_freshness_secs: u64,
    /// Response bytes buffered per port-80 flow
    pub redirect_buffer_bytes: usize,
    /// Sliding window for counting distinct redirect targets
    pub redirect_burst_window_secs: u64,
    /// How long redirect records are retained
    pub redirect_retention_secs: u64,
    /// Minimum packets on an IP before retransmissions are judged
    pub retrans_min_packets: u64,
    /// Retransmission ratio treated as a suspicious drop
    pub retrans_suspicious_ratio: f64,
    /// Unanswered UDP handshakes that raise an event
    pub udp_unanswered_threshold: u32,
    /// Idle time after which per-flow state is discarded
    pub flow_idle_secs: u64,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            rst_ttl_threshold: 6,
            rst_ipid_threshold: 1000,
            rst_min_samples: 3,
            rst_freshness_secs: 60,
            redirect_buffer_bytes: 2048,
            redirect_burst_window_secs: 600,
            redirect_retention_secs: 1800,
            retrans_min_packets: 20,
            retrans_suspicious_ratio: 0.10,
            udp_unanswered_threshold: 5,
            flow_idle_secs: 120,
        }
    }
}

impl InspectConfig {
    /// Suspicious RST freshness window
    pub fn rst_freshness(&self) -> Duration {
        Duration::from_secs(self.rst_freshness_secs)
    }

    /// Redirect burst window
    pub fn redirect_burst_window(&self) -> Duration {
        Duration::from_secs(self.redirect_burst_window_secs)
    }

    /// Redirect retention window
    pub fn redirect_retention(&self) -> Duration {
        Duration::from_secs(self.redirect_retention_secs)
    }

    /// Per-flow idle timeout
    pub fn flow_idle(&self) -> Duration {
        Duration::from_secs(self.flow_idle_secs)
    }
}

/// Signal store and adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Age after which events are evicted
    pub event_ttl_secs: u64,
    /// Default aggregation window
    pub window_secs: u64,
    /// Extended aggregation window
    pub extended_window_secs: u64,
    /// Run the stale-bucket sweep every N appends
    pub sweep_every: u64,
    /// Minimum spacing between two inspector events of the same type per host
    pub debounce_secs: u64,
    /// Cooldown between two gate progress lines for the same host
    pub gate_cooldown_secs: u64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            event_ttl_secs: 600,
            window_secs: 30,
            extended_window_secs: 60,
            sweep_every: 64,
            debounce_secs: 5,
            gate_cooldown_secs: 60,
        }
    }
}

impl SignalsConfig {
    /// Event time-to-live
    pub fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl_secs)
    }

    /// Default window
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Extended window
    pub fn extended_window(&self) -> Duration {
        Duration::from_secs(self.extended_window_secs)
    }
}

/// Diagnosis thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    /// RST TTL delta treated as injected
    pub rst_ttl_delta: u32,
    /// RST latency at or below which the injector sits at the edge
    pub edge_latency_ms: u64,
    /// RST latency at or above which the DPI is stateful
    pub stateful_latency_ms: u64,
    /// Retransmission rate that upgrades a TCP timeout to a silent drop
    pub retx_rate_threshold: f64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            rst_ttl_delta: 6,
            edge_latency_ms: 250,
            stateful_latency_ms: 500,
            retx_rate_threshold: 0.20,
        }
    }
}

/// Strategy selection gates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Diagnoses below this confidence get an empty plan
    pub min_confidence: u8,
    /// High-risk strategies need at least this confidence
    pub high_risk_min_confidence: u8,
    /// Success rate above which the feedback boost applies
    pub success_rate_high: f64,
    /// Success rate below which the feedback penalty applies
    pub success_rate_low: f64,
    /// Weight multiplier for proven strategies
    pub success_boost: f64,
    /// Weight multiplier for failing strategies
    pub failure_penalty: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 50,
            high_risk_min_confidence: 70,
            success_rate_high: 0.70,
            success_rate_low: 0.30,
            success_boost: 1.5,
            failure_penalty: 0.5,
        }
    }
}

/// Feedback store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Entries untouched for longer than this are pruned
    pub ttl_days: u32,
    /// Upper bound on stored (diagnosis, strategy) pairs
    pub max_entries: usize,
    /// Outcomes required before feedback affects ranking
    pub min_samples: u32,
    /// JSON file; in-memory only when unset
    pub path: Option<PathBuf>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            max_entries: 512,
            min_samples: 5,
            path: None,
        }
    }
}

/// Apply/rollback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Soft deadline for a single apply
    pub timeout_ms: u64,
    /// User consent for DoH/DNS changes
    pub allow_dns_changes: bool,
    /// Working-plan memory capacity per session
    pub session_memory: usize,
    /// DNS preset used when a plan asks for DoH
    pub dns_preset: String,
    /// Network adapter whose resolvers are switched; DoH is skipped when unset
    pub dns_adapter: Option<String>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 8000,
            allow_dns_changes: false,
            session_memory: 64,
            dns_preset: "Cloudflare".to_string(),
            dns_adapter: None,
        }
    }
}

impl ApplyConfig {
    /// Apply timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Group participation persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupsConfig {
    /// JSON file; in-memory only when unset
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when neither `-v` nor `RUST_LOG` says otherwise
    pub level: String,
    /// Log file path (None = stderr only)
    pub file: Option<PathBuf>,
    /// Enable JSON format logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json_format: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========== Default Config Tests ===========

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.inspect.rst_ttl_threshold, 6);
        assert_eq!(config.inspect.rst_ipid_threshold, 1000);
        assert_eq!(config.signals.event_ttl(), Duration::from_secs(600));
        assert_eq!(config.selector.min_confidence, 50);
        assert_eq!(config.feedback.max_entries, 512);
    }

    // =========== Validation Tests ===========

    #[test]
    fn test_validation_latency_order() {
        let mut config = Config::default();
        config.diagnosis.edge_latency_ms = 600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("diagnosis.edge_latency_ms"));
    }

    #[test]
    fn test_validation_confidence_gates() {
        let mut config = Config::default();
        config.selector.min_confidence = 80;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_windows() {
        let mut config = Config::default();
        config.signals.extended_window_secs = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.signals.event_ttl_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_dns_preset() {
        let mut config = Config::default();
        config.apply.dns_preset = " google ".to_string();
        assert!(config.validate().is_ok());

        config.apply.dns_preset = "Quad9".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValue { ref key, .. } if key == "apply.dns_preset"));
    }

    // =========== TOML Tests ===========

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.feedback.path = Some(PathBuf::from("feedback.json"));
        let text = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_toml_partial_override() {
        let config = Config::from_toml(
            r#"
[inspect]
rst_ttl_threshold = 8

[diagnosis]
edge_latency_ms = 200
"#,
        )
        .unwrap();
        assert_eq!(config.inspect.rst_ttl_threshold, 8);
        assert_eq!(config.inspect.rst_ipid_threshold, 1000);
        assert_eq!(config.diagnosis.edge_latency_ms, 200);
        assert_eq!(config.diagnosis.stateful_latency_ms, 500);
    }

    #[test]
    fn test_toml_parse_invalid() {
        assert!(Config::from_toml("this is not [valid toml").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }
}
