//! End-to-end scenarios: wire inspection → signals → diagnosis → plan → apply

mod common;

use chrono::Utc;
use dpiscope_core::apply::{ApplyError, ApplyRequest, ApplyService, RollbackStatus};
use dpiscope_core::bypass::{BypassEngine, BypassFilter, InProcessBypassEngine, TlsBypassOptions};
use dpiscope_core::config::{Config, FeedbackConfig, SelectorConfig};
use dpiscope_core::diagnosis::{DiagnosisEngine, DiagnosisId, DiagnosisResult};
use dpiscope_core::feedback::{FeedbackKey, FeedbackStore, InMemoryFeedbackStore, StrategyOutcome};
use dpiscope_core::inspect::{InspectionSnapshot, WireInspectors};
use dpiscope_core::intercept::FilterChain;
use dpiscope_core::packet::{Direction, TcpFlags};
use dpiscope_core::policy::PolicyGates;
use dpiscope_core::signals::{BlockageCode, BlockageSignals, SignalStore, SignalsAdapter};
use dpiscope_core::strategy::{RiskLevel, StrategyId, StrategySelector};
use dpiscope_core::{Error, IntelSession, SessionOutcome};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn adapter(cfg: &Config) -> SignalsAdapter {
    SignalsAdapter::new(
        Arc::new(SignalStore::new(cfg.signals.event_ttl(), cfg.signals.sweep_every)),
        &cfg.signals,
    )
}

fn diagnosis(id: DiagnosisId, confidence: u8) -> DiagnosisResult {
    DiagnosisResult {
        diagnosis_id: id,
        confidence,
        matched_rule: "test",
        notes: Vec::new(),
        evidence: Default::default(),
        input: BlockageSignals::empty("203.0.113.7", Utc::now(), Duration::from_secs(30)),
        diagnosed_at: Utc::now(),
    }
}

// ====== Diagnosis Scenario Tests ======

#[test]
fn test_rst_ttl_anomaly_from_wire_is_active_dpi_edge() {
    let cfg = Config::default();
    let chain = FilterChain::new();
    let inspectors = WireInspectors::new(&cfg.inspect);
    inspectors.attach(&chain);

    let now = Instant::now();
    for (ttl, id) in [(50, 100), (53, 101), (55, 102)] {
        let seg = common::server_segment(TcpFlags::SYN | TcpFlags::ACK, ttl, id, 50000);
        chain.process_raw(&seg, Direction::Inbound, now);
    }
    let rst = common::server_segment(TcpFlags::RST | TcpFlags::ACK, 64, 103, 50000);
    let out = chain.process_raw(&rst, Direction::Inbound, now);
    assert!(!out.dropped);

    let inspection = inspectors.snapshot_for(common::server_ip(), now);
    let suspicious = inspection.suspicious_rst.clone().expect("suspicious RST recorded");
    assert_eq!(suspicious.ttl_delta, 9);

    let a = adapter(&cfg);
    let tested = common::tcp_reset("blocked.example", 120);
    a.observe(&tested, &inspection, None);
    let signals = a.build_snapshot(&tested, &inspection, cfg.signals.window());
    let result = DiagnosisEngine::new(cfg.diagnosis.clone()).diagnose(&signals);

    assert_eq!(result.diagnosis_id, DiagnosisId::ActiveDpiEdge);
    assert_eq!(result.confidence, 75);
}

#[test]
fn test_dns_and_tls_failure_is_multi_layer() {
    let cfg = Config::default();
    let a = adapter(&cfg);
    let mut tested = common::tcp_timeout("blocked.example");
    tested.tcp_ok = true;
    tested.dns_ok = false;
    tested.blockage = Some(BlockageCode::TlsHandshakeTimeout);
    a.observe(&tested, &InspectionSnapshot::default(), None);

    let signals = a.build_snapshot(&tested, &InspectionSnapshot::default(), cfg.signals.window());
    let result = DiagnosisEngine::new(cfg.diagnosis.clone()).diagnose(&signals);
    assert_eq!(result.diagnosis_id, DiagnosisId::MultiLayerBlock);
    assert_eq!(result.confidence, 70);

    let plan = StrategySelector::new(cfg.selector.clone()).select(&result);
    assert_eq!(plan.strategies[0].id, StrategyId::UseDoh);
    assert!(plan.contains(StrategyId::TlsDisorder));
}

#[test]
fn test_retransmissions_with_timeout_is_silent_drop() {
    let cfg = Config::default();
    let a = adapter(&cfg);
    let tested = common::tcp_timeout("slow.example");
    let inspection = InspectionSnapshot {
        retransmissions: 25,
        total_packets: 100,
        ..Default::default()
    };
    a.observe(&tested, &inspection, None);
    let signals = a.build_snapshot(&tested, &inspection, cfg.signals.window());
    let result = DiagnosisEngine::new(cfg.diagnosis.clone()).diagnose(&signals);
    assert_eq!(result.diagnosis_id, DiagnosisId::SilentDrop);
    assert_eq!(result.confidence, 80);

    let plan = StrategySelector::new(cfg.selector.clone()).select(&result);
    let ids: Vec<StrategyId> = plan.strategies.iter().map(|s| s.id).collect();
    assert_eq!(ids, [StrategyId::TlsFragment, StrategyId::DropRst]);
    assert!(!plan.drop_udp_443);
}

// ====== Feedback Tests ======

#[test]
fn test_feedback_boosts_reliable_strategy() {
    let fb_cfg = FeedbackConfig::default();
    let store = Arc::new(InMemoryFeedbackStore::new(&fb_cfg));
    let key = FeedbackKey::new(DiagnosisId::SilentDrop, StrategyId::TlsFragment);
    let now = Utc::now();
    for i in 0..10 {
        let outcome = if i < 8 { StrategyOutcome::Success } else { StrategyOutcome::Failure };
        store.record(key, outcome, now);
    }

    let selector = StrategySelector::new(SelectorConfig::default()).with_feedback(store, &fb_cfg);
    assert!((selector.feedback_multiplier(DiagnosisId::SilentDrop, StrategyId::TlsFragment) - 1.5).abs() < 1e-9);
    assert!((selector.feedback_multiplier(DiagnosisId::SilentDrop, StrategyId::DropRst) - 1.0).abs() < 1e-9);

    let plan = selector.select(&diagnosis(DiagnosisId::SilentDrop, 80));
    assert!(plan.reasoning.contains("(feedback)"));
}

// ====== Apply Tests ======

/// Engine that writes options, then fails whenever fragmentation is asked for
struct RejectingEngine {
    current: Mutex<TlsBypassOptions>,
}

impl BypassEngine for RejectingEngine {
    fn current_options(&self) -> TlsBypassOptions {
        self.current.lock().clone()
    }

    fn apply_options(&self, options: &TlsBypassOptions) -> dpiscope_core::Result<()> {
        *self.current.lock() = options.clone();
        if options.fragment_enabled {
            return Err(Error::Engine("driver rejected fragment".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_failed_apply_restores_previous_options() {
    let cfg = Config::default();
    let engine = Arc::new(RejectingEngine {
        current: Mutex::new(TlsBypassOptions::default()),
    });
    let session = IntelSession::from_config(&cfg, ApplyService::new(engine.clone(), None), None);
    let tested = common::tcp_timeout("slow.example");
    let inspection = InspectionSnapshot {
        retransmissions: 25,
        total_packets: 100,
        ..Default::default()
    };
    session.observe(&tested, &inspection, None);

    let request = ApplyRequest::from_config(&cfg.apply, false, "Cloudflare");
    let err = session
        .evaluate_and_apply(&tested, &inspection, request, &CancellationToken::new(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ApplyError::Failed { .. }));
    assert_eq!(err.execution().rollback_status, RollbackStatus::Done);
    assert_eq!(engine.current_options(), TlsBypassOptions::default());
    assert!(session.active_plan().is_none());
}

#[tokio::test]
async fn test_session_applies_into_live_chain() {
    let cfg = Config::default();
    let chain = Arc::new(FilterChain::new());
    let engine = Arc::new(InProcessBypassEngine::new(
        Arc::new(BypassFilter::new(PolicyGates::default())),
        Arc::clone(&chain),
    ));
    let session = IntelSession::from_config(&cfg, ApplyService::new(engine.clone(), None), None);
    let tested = common::tcp_timeout("slow.example");
    let inspection = InspectionSnapshot {
        retransmissions: 25,
        total_packets: 100,
        ..Default::default()
    };

    let request = ApplyRequest::from_config(&cfg.apply, false, "Cloudflare");
    let outcome = session
        .evaluate_and_apply(&tested, &inspection, request, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(matches!(outcome, SessionOutcome::Applied { .. }));
    assert_eq!(chain.names(), ["bypass"]);

    // The first TLS record is split into the 64-byte preset
    let hello = common::client_hello_packet("slow.example", 50123);
    let out = chain.process_raw(&hello, Direction::Outbound, Instant::now());
    assert!(out.dropped);
    assert!(out.packets.len() >= 2);
    assert_eq!(engine.metrics().client_hellos_fragmented, 1);
}

// ====== Selector Invariant Tests ======

proptest! {
    #[test]
    fn test_selector_invariants(idx in 0usize..DiagnosisId::ALL.len(), confidence in 0u8..=100) {
        let cfg = SelectorConfig::default();
        let selector = StrategySelector::new(cfg.clone());
        let plan = selector.select(&diagnosis(DiagnosisId::ALL[idx], confidence));

        if confidence < cfg.min_confidence {
            prop_assert!(plan.is_empty());
        }
        if confidence < cfg.high_risk_min_confidence {
            prop_assert!(plan.strategies.iter().all(|s| s.risk != RiskLevel::High));
        }
        prop_assert!(plan.strategies.iter().filter(|s| s.id.is_tls_mode()).count() <= 1);
        prop_assert!(plan.strategies.iter().all(|s| !plan.deferred_strategies.iter().any(|d| d.id == s.id)));
        prop_assert!(plan.plan_confidence <= 100);
    }
}
