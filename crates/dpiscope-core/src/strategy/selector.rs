//! Diagnosis -> plan

use super::catalog::{candidates_for, StrategyTemplate};
use super::{BypassPlan, BypassStrategy, DeferredStrategy, RiskLevel, StrategyId};
use crate::config::{FeedbackConfig, SelectorConfig};
use crate::diagnosis::{DiagnosisId, DiagnosisResult};
use crate::feedback::{FeedbackKey, FeedbackStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Strategies the bypass engine can execute
const IMPLEMENTED: [StrategyId; 7] = [
    StrategyId::TlsDisorder,
    StrategyId::TlsFragment,
    StrategyId::DropRst,
    StrategyId::UseDoh,
    StrategyId::HttpHostTricks,
    StrategyId::BadChecksum,
    StrategyId::AggressiveFragment,
];

/// Strategies shown but never executed
const DEFERRED: [StrategyId; 2] = [StrategyId::TlsFakeTtl, StrategyId::QuicObfuscation];

/// Ranked candidate
#[derive(Debug, Clone, PartialEq)]
pub struct RankedStrategy {
    /// The strategy
    pub strategy: BypassStrategy,
    /// Ranking weight
    pub weight: f64,
    /// Feedback factor folded into the weight
    pub feedback_multiplier: f64,
}

/// Risk- and feedback-ranked strategy selection
pub struct StrategySelector {
    cfg: SelectorConfig,
    min_samples: u32,
    feedback: Option<Arc<dyn FeedbackStore>>,
}

impl std::fmt::Debug for StrategySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategySelector")
            .field("cfg", &self.cfg)
            .field("min_samples", &self.min_samples)
            .field("feedback", &self.feedback.is_some())
            .finish()
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::new(SelectorConfig::default())
    }
}

impl StrategySelector {
    /// Selector without feedback
    pub fn new(cfg: SelectorConfig) -> Self {
        Self {
            cfg,
            min_samples: FeedbackConfig::default().min_samples,
            feedback: None,
        }
    }

    /// Bias ranking with historical outcomes from `store`
    #[must_use]
    pub fn with_feedback(mut self, store: Arc<dyn FeedbackStore>, cfg: &FeedbackConfig) -> Self {
        self.feedback = Some(store);
        self.min_samples = cfg.min_samples;
        self
    }

    /// Factor applied to a pair's weight
    pub fn feedback_multiplier(&self, diagnosis: DiagnosisId, strategy: StrategyId) -> f64 {
        let Some(stats) = self
            .feedback
            .as_ref()
            .and_then(|f| f.stats(FeedbackKey::new(diagnosis, strategy)))
        else {
            return 1.0;
        };
        if stats.total() < self.min_samples {
            return 1.0;
        }
        let rate = stats.success_rate();
        if rate > self.cfg.success_rate_high {
            self.cfg.success_boost
        } else if rate < self.cfg.success_rate_low {
            self.cfg.failure_penalty
        } else {
            1.0
        }
    }

    /// Executable candidates for `diagnosis`, ranked best first, before
    /// TLS-mode collapsing. Deferred and unimplemented candidates are left
    /// out; see [`StrategySelector::select`].
    pub fn rank(&self, diagnosis: &DiagnosisResult) -> Vec<RankedStrategy> {
        let (executable, _) = self.filter(diagnosis, &candidates_for(diagnosis.diagnosis_id));
        self.rank_strategies(diagnosis, executable)
    }

    fn filter(
        &self,
        diagnosis: &DiagnosisResult,
        candidates: &[StrategyTemplate],
    ) -> (Vec<BypassStrategy>, Vec<DeferredStrategy>) {
        let confidence = diagnosis.confidence.min(100);
        let mut executable = Vec::with_capacity(candidates.len());
        let mut deferred = Vec::new();

        for c in candidates {
            if c.risk == RiskLevel::High && confidence < self.cfg.high_risk_min_confidence {
                continue;
            }
            if !IMPLEMENTED.contains(&c.id) {
                if DEFERRED.contains(&c.id) {
                    deferred.push(DeferredStrategy {
                        id: c.id,
                        reason: "deferred: not applied automatically".to_string(),
                        risk: c.risk,
                    });
                } else {
                    warn!(strategy = %c.id, "strategy has no runtime implementation, skipping");
                }
                continue;
            }
            executable.push(BypassStrategy {
                id: c.id,
                base_priority: c.base_priority,
                risk: c.risk,
                parameters: c.parameters.clone(),
            });
        }
        (executable, deferred)
    }

    fn rank_strategies(&self, diagnosis: &DiagnosisResult, strategies: Vec<BypassStrategy>) -> Vec<RankedStrategy> {
        let confidence = f64::from(diagnosis.confidence.min(100));
        let mut ranked: Vec<RankedStrategy> = strategies
            .into_iter()
            .map(|s| {
                let feedback_multiplier = self.feedback_multiplier(diagnosis.diagnosis_id, s.id);
                let weight = f64::from(s.base_priority) * confidence / f64::from(s.risk.cost()) * feedback_multiplier;
                RankedStrategy {
                    strategy: s,
                    weight,
                    feedback_multiplier,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| b.strategy.base_priority.cmp(&a.strategy.base_priority))
                .then_with(|| a.strategy.risk.cmp(&b.strategy.risk))
                .then_with(|| a.strategy.id.cmp(&b.strategy.id))
        });
        ranked
    }

    /// Build the plan for `diagnosis`
    pub fn select(&self, diagnosis: &DiagnosisResult) -> BypassPlan {
        let confidence = diagnosis.confidence.min(100);
        let id = diagnosis.diagnosis_id;

        if confidence < self.cfg.min_confidence {
            return BypassPlan::empty(id, confidence, format!("confidence < {}", self.cfg.min_confidence));
        }

        let candidates = candidates_for(id);
        let (executable, deferred) = self.filter(diagnosis, &candidates);
        let ranked = self.rank_strategies(diagnosis, executable);
        let any_feedback = ranked.iter().any(|r| (r.feedback_multiplier - 1.0).abs() > 1e-4);
        let strategies = keep_one_tls_mode(ranked.into_iter().map(|r| r.strategy));

        let signals = &diagnosis.input;
        let has_tls_bypass = strategies.iter().any(|s| s.id.is_tls_bypass());

        let h3_evidence = signals.http3_attempt_count > 0;
        let h3_failure_only = h3_evidence
            && signals.http3_not_supported_count == 0
            && signals.http3_success_count == 0
            && signals.http3_failure_count > 0;
        let quic_evidence = if h3_evidence {
            h3_failure_only
        } else {
            signals.udp_unanswered_handshakes >= 2
        };

        // QUIC->TCP does not help a TLS timeout on TCP/443
        let mut drop_udp_443 = !signals.has_tls_timeout
            && match id {
                DiagnosisId::ActiveDpiEdge | DiagnosisId::StatefulDpi => true,
                DiagnosisId::QuicInterference => quic_evidence,
                _ => h3_failure_only,
            };
        if id == DiagnosisId::DnsHijack {
            drop_udp_443 = false;
        }

        let allow_no_sni = has_tls_bypass && signals.host_tested_count >= 2 && {
            let ratio = f64::from(signals.host_tested_no_sni_count) / f64::from(signals.host_tested_count.max(1));
            signals.host_tested_no_sni_count >= 2 && ratio >= 0.70
        };

        let mut reasoning = if any_feedback {
            "plan built from diagnosis (feedback)".to_string()
        } else {
            "plan built from diagnosis".to_string()
        };
        if candidates.is_empty() {
            reasoning.push_str("; no strategy mapping for diagnosis");
        }
        if drop_udp_443 {
            reasoning.push_str("; assist: QUIC->TCP");
        }
        if allow_no_sni {
            reasoning.push_str("; assist: No SNI");
        }
        if id == DiagnosisId::HttpRedirect {
            if let Some(host) = signals.redirect_to_host.as_deref().filter(|h| !h.trim().is_empty()) {
                reasoning.push_str(&format!("; redirectHost={host}"));
                if confidence < self.cfg.high_risk_min_confidence {
                    reasoning.push_str("; possibly a captive portal or router");
                }
            }
        }
        if !deferred.is_empty() {
            let names: Vec<&str> = deferred.iter().map(|d| d.id.as_str()).collect();
            reasoning.push_str(&format!("; deferred: {}", names.join(", ")));
        }

        if strategies.is_empty() && deferred.is_empty() && !drop_udp_443 && !allow_no_sni {
            let why = if candidates.is_empty() {
                "no strategy mapping for diagnosis"
            } else {
                "all strategies filtered by risk or implementation"
            };
            return BypassPlan::empty(id, confidence, why);
        }

        debug!(
            diagnosis = %id,
            confidence,
            strategies = strategies.len(),
            drop_udp_443,
            allow_no_sni,
            "plan selected"
        );

        BypassPlan {
            strategies,
            deferred_strategies: deferred,
            for_diagnosis: id,
            plan_confidence: confidence,
            reasoning,
            drop_udp_443,
            allow_no_sni,
            planned_at: Utc::now(),
        }
    }
}

/// Keep only the best-ranked member of the TLS-mode group
fn keep_one_tls_mode(strategies: impl Iterator<Item = BypassStrategy>) -> Vec<BypassStrategy> {
    let mut seen_tls_mode = false;
    strategies
        .filter(|s| {
            if !s.id.is_tls_mode() {
                return true;
            }
            !std::mem::replace(&mut seen_tls_mode, true)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::DiagnosisEngine;
    use crate::feedback::{InMemoryFeedbackStore, StrategyOutcome};
    use crate::signals::BlockageSignals;
    use std::time::Duration;

    fn result(id: DiagnosisId, confidence: u8) -> DiagnosisResult {
        let input = BlockageSignals::empty("203.0.113.7", Utc::now(), Duration::from_secs(30));
        DiagnosisResult {
            diagnosis_id: id,
            confidence,
            matched_rule: "test",
            notes: Vec::new(),
            evidence: Default::default(),
            input,
            diagnosed_at: Utc::now(),
        }
    }

    // ====== Gate Tests ======

    #[test]
    fn test_confidence_floor() {
        let plan = StrategySelector::default().select(&result(DiagnosisId::ActiveDpiEdge, 49));
        assert!(plan.strategies.is_empty());
        assert!(!plan.drop_udp_443);
        assert!(!plan.allow_no_sni);
        assert_eq!(plan.reasoning, "confidence < 50");
    }

    #[test]
    fn test_high_risk_dropped_below_70() {
        let plan = StrategySelector::default().select(&result(DiagnosisId::ActiveDpiEdge, 60));
        assert!(plan.strategies.iter().all(|s| s.risk != RiskLevel::High));
        let plan = StrategySelector::default().select(&result(DiagnosisId::ActiveDpiEdge, 75));
        assert!(plan.contains(StrategyId::BadChecksum));
    }

    #[test]
    fn test_single_tls_mode() {
        let plan = StrategySelector::default().select(&result(DiagnosisId::StatefulDpi, 90));
        let tls_modes = plan.strategies.iter().filter(|s| s.id.is_tls_mode()).count();
        assert_eq!(tls_modes, 1);
        assert_eq!(plan.strategies[0].id, StrategyId::TlsDisorder);
        assert!(plan.drop_udp_443);
    }

    // ====== Ranking Tests ======

    #[test]
    fn test_silent_drop_plan_order() {
        let mut s = BlockageSignals::empty("203.0.113.7", Utc::now(), Duration::from_secs(30));
        s.sample_size = 3;
        s.has_tcp_timeout = true;
        s.retransmission_rate = Some(0.25);
        let diagnosis = DiagnosisEngine::default().diagnose(&s);
        let plan = StrategySelector::default().select(&diagnosis);

        let ids: Vec<_> = plan.strategies.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![StrategyId::TlsFragment, StrategyId::DropRst]);
        let frag = plan.strategy(StrategyId::TlsFragment).unwrap();
        assert_eq!(frag.parameters["PresetName"], serde_json::json!("Standard"));
        assert_eq!(frag.parameters["TlsFragmentSizes"], serde_json::json!([64]));
    }

    #[test]
    fn test_feedback_boost_needs_min_samples() {
        let store = Arc::new(InMemoryFeedbackStore::new(&FeedbackConfig::default()));
        let key = FeedbackKey::new(DiagnosisId::SilentDrop, StrategyId::TlsFragment);
        let now = Utc::now();
        for _ in 0..4 {
            store.record(key, StrategyOutcome::Success, now);
        }
        let selector = StrategySelector::default().with_feedback(store.clone(), &FeedbackConfig::default());
        assert_eq!(selector.feedback_multiplier(DiagnosisId::SilentDrop, StrategyId::TlsFragment), 1.0);

        store.record(key, StrategyOutcome::Success, now);
        assert_eq!(selector.feedback_multiplier(DiagnosisId::SilentDrop, StrategyId::TlsFragment), 1.5);
    }

    #[test]
    fn test_feedback_penalty_reorders() {
        let store = Arc::new(InMemoryFeedbackStore::new(&FeedbackConfig::default()));
        let key = FeedbackKey::new(DiagnosisId::MultiLayerBlock, StrategyId::UseDoh);
        for _ in 0..6 {
            store.record(key, StrategyOutcome::Failure, Utc::now());
        }
        let selector = StrategySelector::default().with_feedback(store, &FeedbackConfig::default());
        let ranked = selector.rank(&result(DiagnosisId::MultiLayerBlock, 70));
        // UseDoh 100*70/1*0.5 = 3500 vs TlsDisorder 90*70/2 = 3150
        assert_eq!(ranked[0].strategy.id, StrategyId::UseDoh);
        assert!((ranked[0].weight - 3500.0).abs() < 1e-9);
        assert!((ranked[0].feedback_multiplier - 0.5).abs() < f64::EPSILON);
    }

    // ====== Assist Tests ======

    #[test]
    fn test_drop_udp_forced_off_for_dns() {
        let mut d = result(DiagnosisId::DnsHijack, 75);
        d.input.http3_attempt_count = 2;
        d.input.http3_failure_count = 2;
        let plan = StrategySelector::default().select(&d);
        assert!(!plan.drop_udp_443);
        assert!(plan.contains(StrategyId::UseDoh));
    }

    #[test]
    fn test_no_drop_udp_with_tls_timeout() {
        let mut d = result(DiagnosisId::ActiveDpiEdge, 75);
        d.input.has_tls_timeout = true;
        assert!(!StrategySelector::default().select(&d).drop_udp_443);
    }

    #[test]
    fn test_quic_plan_is_assist_only() {
        let mut d = result(DiagnosisId::QuicInterference, 65);
        d.input.udp_unanswered_handshakes = 3;
        let plan = StrategySelector::default().select(&d);
        assert!(plan.strategies.is_empty());
        assert!(plan.drop_udp_443);
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_allow_no_sni() {
        let mut d = result(DiagnosisId::SilentDrop, 80);
        d.input.host_tested_count = 3;
        d.input.host_tested_no_sni_count = 3;
        assert!(StrategySelector::default().select(&d).allow_no_sni);

        d.input.host_tested_no_sni_count = 1;
        assert!(!StrategySelector::default().select(&d).allow_no_sni);

        let mut dns = result(DiagnosisId::DnsHijack, 80);
        dns.input.host_tested_count = 3;
        dns.input.host_tested_no_sni_count = 3;
        assert!(!StrategySelector::default().select(&dns).allow_no_sni);
    }
}
