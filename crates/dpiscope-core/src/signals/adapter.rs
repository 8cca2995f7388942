//! Turns host-test results and inspector state into stored facts and
//! windowed snapshots

use super::event::{SignalEvent, SignalType, SignalValue};
use super::host_tested::{Http3Status, HostTested};
use super::snapshot::{is_fake_ip, BlockageSignals};
use super::store::SignalStore;
use crate::config::SignalsConfig;
use crate::inspect::InspectionSnapshot;
use crate::progress::{self, ProgressSink};
use crate::signals::blockage::BlockageCode;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Most recent events shown in the gate timeline
const GATE_TIMELINE_TAIL: usize = 6;

/// Writes facts into a [`SignalStore`] and aggregates them back out
#[derive(Debug)]
pub struct SignalsAdapter {
    store: Arc<SignalStore>,
    window: Duration,
    debounce: ChronoDuration,
    gate_cooldown: ChronoDuration,
    last_gate_line: DashMap<String, DateTime<Utc>>,
}

impl SignalsAdapter {
    /// Adapter over `store`
    pub fn new(store: Arc<SignalStore>, cfg: &SignalsConfig) -> Self {
        Self {
            store,
            window: cfg.window(),
            debounce: ChronoDuration::seconds(i64::try_from(cfg.debounce_secs).unwrap_or(i64::MAX / 1000)),
            gate_cooldown: ChronoDuration::seconds(i64::try_from(cfg.gate_cooldown_secs).unwrap_or(i64::MAX / 1000)),
            last_gate_line: DashMap::new(),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<SignalStore> {
        &self.store
    }

    /// Bucket key for a host-test record
    pub fn host_key(tested: &HostTested) -> String {
        tested.host_key()
    }

    /// Record a host test and the current inspector view, now
    pub fn observe(&self, tested: &HostTested, inspection: &InspectionSnapshot, progress: Option<&dyn ProgressSink>) {
        self.observe_at(tested, inspection, progress, Utc::now());
    }

    /// Record a host test and the current inspector view at `now`
    #[instrument(level = "debug", skip_all, fields(host = %tested.host_key()))]
    pub fn observe_at(
        &self,
        tested: &HostTested,
        inspection: &InspectionSnapshot,
        progress: Option<&dyn ProgressSink>,
        now: DateTime<Utc>,
    ) {
        let host_key = tested.host_key();

        let mut event = SignalEvent::new(
            host_key.as_str(),
            SignalType::HostTested,
            now,
            "host-tester",
            SignalValue::HostTested(Box::new(tested.clone())),
        );
        if let Some(code) = tested.blockage {
            event = event.with_reason(code.as_str());
        }
        event = event
            .with_meta("port", tested.port.to_string())
            .with_meta("dns", flag(tested.dns_ok))
            .with_meta("tcp", flag(tested.tcp_ok))
            .with_meta("tls", flag(tested.tls_ok));
        if let Some(ip) = tested.remote_ip {
            event = event.with_meta("ip", ip.to_string());
        }
        if let Some(sni) = tested.sni.as_deref().filter(|s| !s.trim().is_empty()) {
            event = event.with_meta("sni", sni);
        }
        self.store.append_at(event, now);

        self.append_inspection(&host_key, inspection, now);
        self.report_gate(&host_key, now, progress);
    }

    fn append_inspection(&self, host_key: &str, inspection: &InspectionSnapshot, now: DateTime<Utc>) {
        if inspection.total_packets > 0 {
            self.append_debounced(
                SignalEvent::new(
                    host_key,
                    SignalType::TcpRetransStats,
                    now,
                    "retrans-tracker",
                    SignalValue::Retrans {
                        retransmissions: inspection.retransmissions,
                        total_packets: inspection.total_packets,
                    },
                ),
                now,
            );
        }

        if let Some(rst) = &inspection.suspicious_rst {
            self.append_debounced(
                SignalEvent::new(
                    host_key,
                    SignalType::SuspiciousRstObserved,
                    now,
                    "rst-inspector",
                    SignalValue::SuspiciousRst {
                        source: rst.source,
                        rst_ttl: rst.rst_ttl,
                        ttl_delta: rst.ttl_delta,
                        ip_id_delta: rst.ip_id_delta,
                    },
                )
                .with_reason(format!(
                    "TTL={} (expected {}-{})",
                    rst.rst_ttl, rst.ttl_range.min, rst.ttl_range.max
                )),
                now,
            );
        }

        if let Some(redirect) = &inspection.redirect {
            self.append_debounced(
                SignalEvent::new(
                    host_key,
                    SignalType::HttpRedirectObserved,
                    now,
                    "http-redirect-detector",
                    SignalValue::HttpRedirect {
                        target_host: redirect.target_host.clone(),
                        target_etld: redirect.target_etld.clone(),
                        burst_count: inspection.redirect_burst_count,
                    },
                )
                .with_reason(redirect.target_host.clone()),
                now,
            );
        }

        if inspection.udp_unanswered > 0 {
            self.append_debounced(
                SignalEvent::new(
                    host_key,
                    SignalType::UdpHandshakeUnanswered,
                    now,
                    "udp-handshake-tracker",
                    SignalValue::UdpUnanswered {
                        count: inspection.udp_unanswered,
                    },
                )
                .with_reason(inspection.udp_unanswered.to_string()),
                now,
            );
        }
    }

    /// Append unless an event of the same type landed within the debounce
    fn append_debounced(&self, event: SignalEvent, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.store.try_get_latest(&event.host_key, event.kind) {
            if now - last.observed_at < self.debounce {
                return false;
            }
        }
        self.store.append_at(event, now);
        true
    }

    fn report_gate(&self, host_key: &str, now: DateTime<Utc>, progress: Option<&dyn ProgressSink>) {
        let Some(sink) = progress else {
            return;
        };
        if let Some(last) = self.last_gate_line.get(host_key) {
            if now - *last < self.gate_cooldown {
                return;
            }
        }

        let recent = self.store.read_window(host_key, self.window, now);
        if recent.len() < 3 || !recent.iter().any(|e| e.kind == SignalType::HostTested) {
            return;
        }
        let kinds: BTreeSet<SignalType> = recent.iter().map(|e| e.kind).collect();
        if kinds.len() < 3 || !kinds.iter().any(|k| *k != SignalType::HostTested) {
            return;
        }
        if recent.windows(2).any(|w| w[0].observed_at > w[1].observed_at) {
            return;
        }

        let tail = &recent[recent.len().saturating_sub(GATE_TIMELINE_TAIL)..];
        let base = tail[0].observed_at;
        let timeline = tail
            .iter()
            .map(|e| format!("{}(+{}ms)", e.kind, (e.observed_at - base).num_milliseconds().max(0)))
            .collect::<Vec<_>>()
            .join("→");

        progress::emit(
            Some(sink),
            &format!("[INTEL][GATE1] hostKey={} recentCount={} timeline={}", host_key, recent.len(), timeline),
        );
        self.last_gate_line.insert(host_key.to_string(), now);
    }

    /// Aggregate the host's facts over `window`, now
    pub fn build_snapshot(&self, tested: &HostTested, inspection: &InspectionSnapshot, window: Duration) -> BlockageSignals {
        self.build_snapshot_at(tested, inspection, window, Utc::now())
    }

    /// Aggregate the host's facts over `window` ending at `now`
    pub fn build_snapshot_at(
        &self,
        tested: &HostTested,
        inspection: &InspectionSnapshot,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BlockageSignals {
        let host_key = tested.host_key();
        let events = self.store.read_window(&host_key, window, now);
        let mut s = BlockageSignals::empty(host_key, now, window);

        let mut rst_events = 0u32;
        for e in &events {
            match e.kind {
                SignalType::SuspiciousRstObserved => rst_events += 1,
                SignalType::HostTested => {
                    if let Some(t) = e.as_host_tested() {
                        s.host_tested_count += 1;
                        if t.is_no_sni() {
                            s.host_tested_no_sni_count += 1;
                        }
                        count_http3(&mut s, t.http3);
                    }
                }
                _ => {}
            }
        }
        s.suspicious_rst_count = if rst_events == 0 && inspection.suspicious_rst.is_some() {
            1
        } else {
            rst_events
        };

        s.has_dns_failure = !tested.dns_ok || tested.dns_status.is_failure();
        s.has_fake_ip = tested.remote_ip.is_some_and(is_fake_ip) || tested.blockage == Some(BlockageCode::FakeIp);
        s.has_tcp_timeout = tested.blockage.is_some_and(BlockageCode::is_tcp_timeout);
        s.has_tcp_reset = tested.blockage.is_some_and(BlockageCode::is_tcp_reset) || s.suspicious_rst_count > 0;
        s.has_tls_timeout = tested.blockage == Some(BlockageCode::TlsHandshakeTimeout);
        s.has_tls_auth_failure = tested.blockage == Some(BlockageCode::TlsAuthFailure);
        // Connected, then reset before the handshake finished
        s.has_tls_reset = tested.tcp_ok && !tested.tls_ok && tested.blockage == Some(BlockageCode::TcpConnectionReset);

        s.retransmission_rate = retrans_rate(inspection.retransmissions, inspection.total_packets).or_else(|| {
            events.iter().rev().find_map(|e| match e.value {
                SignalValue::Retrans {
                    retransmissions,
                    total_packets,
                } => retrans_rate(retransmissions, total_packets),
                _ => None,
            })
        });

        s.redirect_to_host = inspection.redirect.as_ref().map(|r| r.target_host.clone()).or_else(|| {
            events.iter().rev().find_map(|e| match &e.value {
                SignalValue::HttpRedirect { target_host, .. } if !target_host.is_empty() => Some(target_host.clone()),
                _ => None,
            })
        });
        s.has_http_redirect =
            inspection.redirect.is_some() || events.iter().any(|e| e.kind == SignalType::HttpRedirectObserved);

        let udp_event = events.iter().rev().find_map(|e| match e.value {
            SignalValue::UdpUnanswered { count } => Some(count),
            _ => None,
        });
        s.udp_unanswered_handshakes = inspection.udp_unanswered.max(udp_event.unwrap_or(0));

        let rst_deltas = inspection
            .suspicious_rst
            .as_ref()
            .map(|r| (r.ttl_delta, r.ip_id_delta))
            .or_else(|| {
                events.iter().rev().find_map(|e| match e.value {
                    SignalValue::SuspiciousRst {
                        ttl_delta, ip_id_delta, ..
                    } => Some((ttl_delta, ip_id_delta)),
                    _ => None,
                })
            });
        if let Some((ttl_delta, ip_id_delta)) = rst_deltas {
            s.rst_ttl_delta = Some(ttl_delta);
            s.rst_ip_id_delta = ip_id_delta;
        }
        if s.has_tcp_reset {
            s.rst_latency = tested
                .tcp_latency_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);
        }

        s.sample_size = u32::try_from(events.len()).unwrap_or(u32::MAX);
        s.is_unreliable = events.len() < 2 && !s.has_strong_fact();

        debug!(
            host = %s.host_key,
            samples = s.sample_size,
            unreliable = s.is_unreliable,
            "built blockage snapshot"
        );
        s
    }
}

fn flag(v: bool) -> &'static str {
    if v {
        "1"
    } else {
        "0"
    }
}

#[allow(clippy::cast_precision_loss)]
fn retrans_rate(retransmissions: u64, total: u64) -> Option<f64> {
    (total > 0).then(|| (retransmissions as f64 / total as f64).clamp(0.0, 1.0))
}

fn count_http3(s: &mut BlockageSignals, status: Http3Status) {
    if !status.attempted() {
        return;
    }
    s.http3_attempt_count += 1;
    match status {
        Http3Status::Ok => s.http3_success_count += 1,
        Http3Status::Timeout => {
            s.http3_timeout_count += 1;
            s.http3_failure_count += 1;
        }
        Http3Status::NotSupported => s.http3_not_supported_count += 1,
        Http3Status::Failed => s.http3_failure_count += 1,
        Http3Status::NotAttempted => {}
    }
}
