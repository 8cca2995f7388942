//! Ordered diagnosis rules; the first match wins

use super::{DiagnosisId, DiagnosisResult};
use crate::config::DiagnosisConfig;
use crate::signals::BlockageSignals;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Pure `BlockageSignals -> DiagnosisResult` function, parameterized by
/// thresholds
#[derive(Debug, Clone, Default)]
pub struct DiagnosisEngine {
    cfg: DiagnosisConfig,
}

struct Verdict {
    id: DiagnosisId,
    confidence: u8,
    rule: &'static str,
}

const fn verdict(id: DiagnosisId, confidence: u8, rule: &'static str) -> Verdict {
    Verdict { id, confidence, rule }
}

impl DiagnosisEngine {
    /// Engine with the given thresholds
    pub fn new(cfg: DiagnosisConfig) -> Self {
        Self { cfg }
    }

    /// Diagnose one snapshot
    pub fn diagnose(&self, signals: &BlockageSignals) -> DiagnosisResult {
        let (mut notes, evidence) = describe(signals);
        let v = self.classify(signals);

        if v.rule == "unreliable-sample" {
            notes.insert(0, "Not enough data: few events in the window".to_string());
        }
        if v.id == DiagnosisId::NoBlockage {
            notes.clear();
        }

        debug!(
            host = %signals.host_key,
            diagnosis = %v.id,
            confidence = v.confidence,
            rule = v.rule,
            "diagnosed"
        );

        DiagnosisResult {
            diagnosis_id: v.id,
            confidence: v.confidence,
            matched_rule: v.rule,
            notes,
            evidence,
            input: signals.clone(),
            diagnosed_at: Utc::now(),
        }
    }

    fn classify(&self, s: &BlockageSignals) -> Verdict {
        if s.is_unreliable {
            return verdict(DiagnosisId::Unknown, 25, "unreliable-sample");
        }
        if !s.has_any_flag() {
            return verdict(DiagnosisId::NoBlockage, 80, "no-flags");
        }
        if s.has_dns_failure && s.has_transport_issue() {
            return verdict(DiagnosisId::MultiLayerBlock, 70, "dns+transport");
        }
        if s.has_http_redirect {
            return verdict(DiagnosisId::HttpRedirect, 75, "http-redirect");
        }
        if s.has_fake_ip {
            return verdict(DiagnosisId::DnsHijack, 75, "dns-fake-ip");
        }
        if s.has_dns_failure {
            return verdict(DiagnosisId::DnsHijack, 55, "dns-failure");
        }
        if s.has_tcp_timeout {
            // Timeout alone stays under the selection floor
            return match s.retransmission_rate {
                Some(r) if r >= self.cfg.retx_rate_threshold => {
                    verdict(DiagnosisId::SilentDrop, 80, "tcp-timeout+high-retx")
                }
                _ => verdict(DiagnosisId::SilentDrop, 45, "tcp-timeout-only"),
            };
        }
        if s.has_tcp_reset {
            return self.classify_reset(s);
        }
        if s.has_tls_issue() {
            return if s.has_tls_timeout {
                verdict(DiagnosisId::Unknown, 50, "tls-interference")
            } else if s.has_tls_auth_failure {
                verdict(DiagnosisId::Unknown, 45, "tls-auth-failure")
            } else {
                verdict(DiagnosisId::Unknown, 45, "tls-interference")
            };
        }
        if s.http3_attempt_count > 0
            && s.http3_success_count == 0
            && s.http3_failure_count > 0
            && s.http3_not_supported_count == 0
        {
            let confidence = if s.http3_timeout_count > 0 { 65 } else { 55 };
            return verdict(DiagnosisId::QuicInterference, confidence, "h3-fail-without-tcp-tls");
        }
        verdict(DiagnosisId::Unknown, 40, "fallback")
    }

    fn classify_reset(&self, s: &BlockageSignals) -> Verdict {
        let anomalous = s.rst_ttl_delta.is_some_and(|d| d >= self.cfg.rst_ttl_delta);
        if !anomalous {
            return verdict(DiagnosisId::Unknown, 45, "tcp-rst-only");
        }
        let edge = Duration::from_millis(self.cfg.edge_latency_ms);
        let stateful = Duration::from_millis(self.cfg.stateful_latency_ms);
        match s.rst_latency {
            Some(l) if l <= edge => verdict(DiagnosisId::ActiveDpiEdge, 75, "tcp-rst+ttl-anomaly+fast"),
            Some(l) if l >= stateful => verdict(DiagnosisId::StatefulDpi, 70, "tcp-rst+ttl-anomaly+slow"),
            _ => verdict(DiagnosisId::ActiveDpiEdge, 60, "tcp-rst+ttl-anomaly"),
        }
    }
}

fn describe(s: &BlockageSignals) -> (Vec<String>, BTreeMap<String, String>) {
    let mut notes = Vec::new();
    let mut ev = BTreeMap::new();
    let mut put = |k: &str, v: String| {
        ev.insert(k.to_string(), v);
    };

    put("hostKey", s.host_key.clone());
    put("windowSec", s.window.as_secs().to_string());
    put("sampleSize", s.sample_size.to_string());
    put("unreliable", if s.is_unreliable { "1" } else { "0" }.to_string());

    if s.udp_unanswered_handshakes > 0 {
        notes.push(format!("UDP: unanswered handshakes={}", s.udp_unanswered_handshakes));
        put("udpUnanswered", s.udp_unanswered_handshakes.to_string());
    }
    if s.http3_attempt_count > 0 {
        notes.push(format!(
            "H3: attempts={} ok={} fail={} timeout={} notSupported={}",
            s.http3_attempt_count,
            s.http3_success_count,
            s.http3_failure_count,
            s.http3_timeout_count,
            s.http3_not_supported_count
        ));
        put("h3Attempts", s.http3_attempt_count.to_string());
        put("h3Ok", s.http3_success_count.to_string());
        put("h3Fail", s.http3_failure_count.to_string());
        put("h3Timeout", s.http3_timeout_count.to_string());
        put("h3NotSupported", s.http3_not_supported_count.to_string());
    }
    if s.host_tested_count > 0 {
        put("hostTestedCount", s.host_tested_count.to_string());
        put("hostTestedNoSni", s.host_tested_no_sni_count.to_string());
        if s.host_tested_no_sni_count > 0 {
            notes.push(format!(
                "SNI: missing in {}/{} tests",
                s.host_tested_no_sni_count, s.host_tested_count
            ));
        }
    }
    if s.has_dns_failure {
        notes.push("DNS: failure or status not OK".to_string());
        put("dnsFailure", "1".to_string());
    }
    if s.has_fake_ip {
        notes.push("IP: service-range (fake) address".to_string());
        put("fakeIp", "1".to_string());
    }
    if s.has_http_redirect {
        put("httpRedirect", "1".to_string());
        match s.redirect_to_host.as_deref().filter(|h| !h.trim().is_empty()) {
            Some(host) => {
                notes.push(format!("HTTP: redirect (Location host={host})"));
                put("redirectToHost", host.to_string());
            }
            None => notes.push("HTTP: redirect observed".to_string()),
        }
    }
    if s.has_tcp_timeout {
        notes.push("TCP: timeout".to_string());
        put("tcpTimeout", "1".to_string());
    }
    if s.has_tcp_reset {
        notes.push("TCP: RST observed".to_string());
        put("tcpReset", "1".to_string());
    }
    if let Some(d) = s.rst_ttl_delta {
        notes.push(format!("TCP: rst-ttl-delta={d}"));
        put("rstTtlDelta", d.to_string());
    }
    if let Some(d) = s.rst_ip_id_delta {
        notes.push(format!("TCP: rst-ipid-delta={d}"));
        put("rstIpIdDelta", d.to_string());
    }
    if s.suspicious_rst_count > 0 {
        notes.push(format!("TCP: suspicious-rst-count={}", s.suspicious_rst_count));
        put("suspiciousRstCount", s.suspicious_rst_count.to_string());
    }
    if let Some(l) = s.rst_latency {
        let ms = l.as_millis();
        notes.push(format!("TCP: rst-latency-ms={ms}"));
        put("rstLatencyMs", ms.to_string());
    }
    if s.has_tls_timeout {
        notes.push("TLS: timeout".to_string());
        put("tlsTimeout", "1".to_string());
    }
    if s.has_tls_auth_failure {
        notes.push("TLS: auth failure".to_string());
        put("tlsAuthFailure", "1".to_string());
    }
    if s.has_tls_reset {
        notes.push("TLS: reset observed".to_string());
        put("tlsReset", "1".to_string());
    }
    match s.retransmission_rate {
        Some(r) => {
            let r = r.clamp(0.0, 1.0);
            notes.push(format!("TCP: retx-rate={r:.2}"));
            put("retxRate", format!("{r:.2}"));
        }
        None => put("retxRate", "n/a".to_string()),
    }

    (notes, ev)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals() -> BlockageSignals {
        let mut s = BlockageSignals::empty("203.0.113.7", Utc::now(), Duration::from_secs(30));
        s.sample_size = 3;
        s
    }

    fn engine() -> DiagnosisEngine {
        DiagnosisEngine::default()
    }

    // ====== Rule Order Tests ======

    #[test]
    fn test_unreliable_sample() {
        let mut s = signals();
        s.sample_size = 1;
        s.is_unreliable = true;
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::Unknown);
        assert_eq!(r.confidence, 25);
        assert_eq!(r.matched_rule, "unreliable-sample");
        assert_eq!(r.evidence("unreliable"), Some("1"));
    }

    #[test]
    fn test_no_flags() {
        let r = engine().diagnose(&signals());
        assert_eq!(r.diagnosis_id, DiagnosisId::NoBlockage);
        assert_eq!(r.confidence, 80);
        assert!(r.notes.is_empty());
        assert_eq!(r.evidence("retxRate"), Some("n/a"));
    }

    #[test]
    fn test_dns_plus_tls_is_multilayer() {
        let mut s = signals();
        s.has_dns_failure = true;
        s.has_tls_timeout = true;
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::MultiLayerBlock);
        assert_eq!(r.confidence, 70);
        assert_eq!(r.evidence("dnsFailure"), Some("1"));
        assert_eq!(r.evidence("tlsTimeout"), Some("1"));
    }

    #[test]
    fn test_redirect_before_dns() {
        let mut s = signals();
        s.has_http_redirect = true;
        s.has_fake_ip = true;
        s.redirect_to_host = Some("block.isp.example".to_string());
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::HttpRedirect);
        assert_eq!(r.confidence, 75);
        assert_eq!(r.evidence("redirectToHost"), Some("block.isp.example"));
    }

    #[test]
    fn test_dns_hijack_confidence() {
        let mut s = signals();
        s.has_fake_ip = true;
        assert_eq!(engine().diagnose(&s).confidence, 75);
        s.has_fake_ip = false;
        s.has_dns_failure = true;
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::DnsHijack);
        assert_eq!(r.confidence, 55);
    }

    #[test]
    fn test_tcp_timeout_with_high_retx() {
        let mut s = signals();
        s.has_tcp_timeout = true;
        s.retransmission_rate = Some(0.25);
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::SilentDrop);
        assert_eq!(r.confidence, 80);
        assert_eq!(r.evidence("retxRate"), Some("0.25"));
    }

    #[test]
    fn test_tcp_timeout_alone_below_floor() {
        let mut s = signals();
        s.has_tcp_timeout = true;
        s.retransmission_rate = Some(0.05);
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::SilentDrop);
        assert_eq!(r.confidence, 45);
    }

    // ====== RST Tests ======

    #[test]
    fn test_fast_rst_with_ttl_anomaly_is_edge() {
        let mut s = signals();
        s.has_tcp_reset = true;
        s.rst_ttl_delta = Some(9);
        s.rst_latency = Some(Duration::from_millis(120));
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::ActiveDpiEdge);
        assert_eq!(r.confidence, 75);
        assert_eq!(r.evidence("rstLatencyMs"), Some("120"));
    }

    #[test]
    fn test_slow_rst_is_stateful() {
        let mut s = signals();
        s.has_tcp_reset = true;
        s.rst_ttl_delta = Some(6);
        s.rst_latency = Some(Duration::from_millis(600));
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::StatefulDpi);
        assert_eq!(r.confidence, 70);
    }

    #[test]
    fn test_mid_latency_rst() {
        let mut s = signals();
        s.has_tcp_reset = true;
        s.rst_ttl_delta = Some(6);
        s.rst_latency = Some(Duration::from_millis(300));
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::ActiveDpiEdge);
        assert_eq!(r.confidence, 60);
    }

    #[test]
    fn test_rst_without_anomaly() {
        let mut s = signals();
        s.has_tcp_reset = true;
        s.rst_ttl_delta = Some(2);
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::Unknown);
        assert_eq!(r.confidence, 45);
    }

    #[test]
    fn test_custom_ttl_threshold() {
        let e = DiagnosisEngine::new(DiagnosisConfig {
            rst_ttl_delta: 3,
            ..Default::default()
        });
        let mut s = signals();
        s.has_tcp_reset = true;
        s.rst_ttl_delta = Some(4);
        s.rst_latency = Some(Duration::from_millis(10));
        assert_eq!(e.diagnose(&s).diagnosis_id, DiagnosisId::ActiveDpiEdge);
    }

    // ====== TLS / QUIC Tests ======

    #[test]
    fn test_tls_only() {
        let mut s = signals();
        s.has_tls_timeout = true;
        assert_eq!(engine().diagnose(&s).confidence, 50);
        s.has_tls_timeout = false;
        s.has_tls_auth_failure = true;
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::Unknown);
        assert_eq!(r.confidence, 45);
        assert_eq!(r.matched_rule, "tls-auth-failure");
    }

    #[test]
    fn test_quic_interference() {
        let mut s = signals();
        s.http3_attempt_count = 2;
        s.http3_failure_count = 2;
        s.http3_timeout_count = 1;
        let r = engine().diagnose(&s);
        assert_eq!(r.diagnosis_id, DiagnosisId::QuicInterference);
        assert_eq!(r.confidence, 65);

        s.http3_not_supported_count = 1;
        assert_eq!(engine().diagnose(&s).matched_rule, "fallback");
    }

    #[test]
    fn test_diagnose_is_deterministic() {
        let mut s = signals();
        s.has_tcp_reset = true;
        s.rst_ttl_delta = Some(9);
        let a = engine().diagnose(&s);
        let b = engine().diagnose(&s);
        assert_eq!(a.diagnosis_id, b.diagnosis_id);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.evidence, b.evidence);
    }
}
