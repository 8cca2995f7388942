//! The packet filter that executes [`TlsBypassOptions`]

use super::options::TlsBypassOptions;
use super::techniques::{
    auto_ttl, fake_client_hello, fragment_plan, host_split_offset, split_segments, ttl_copy,
};
use crate::error::Result;
use crate::inspect::{FlowKey, RstInspector};
use crate::intercept::{FilterContext, FilterVerdict, PacketFilter};
use crate::packet::Packet;
use crate::policy::{DecisionGraph, FlowPolicy, FlowProtocol, PolicyAction, PolicyGates, TlsStage};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Name the filter registers under
pub const BYPASS_FILTER_NAME: &str = "bypass";

/// Policy strategy selecting the TLS technique per destination
pub const STRATEGY_TLS_BYPASS: &str = "tls_bypass";
/// Parameter of [`STRATEGY_TLS_BYPASS`] naming the technique
pub const PARAM_TLS_STRATEGY: &str = "tls_strategy";
/// Policy strategy enabling Host tricks on TCP/80
pub const STRATEGY_HTTP_HOST_TRICKS: &str = "http_host_tricks";
/// Policy strategy enabling the TTL trick on TCP/443
pub const STRATEGY_TTL_TRICK: &str = "ttl_trick";

/// ClientHello handling for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Leave it alone
    None,
    /// Split in order
    Fragment,
    /// Split and send back to front
    Disorder,
    /// Decoy only
    Fake,
    /// Decoy, then split in order
    FakeFragment,
    /// Decoy, then split back to front
    FakeDisorder,
}

impl TlsMode {
    /// Mode described by `options`
    pub fn from_options(options: &TlsBypassOptions) -> Self {
        match (options.fake_enabled, options.disorder_enabled, options.fragment_enabled) {
            (false, true, _) => Self::Disorder,
            (false, false, true) => Self::Fragment,
            (false, false, false) => Self::None,
            (true, true, _) => Self::FakeDisorder,
            (true, false, true) => Self::FakeFragment,
            (true, false, false) => Self::Fake,
        }
    }

    fn sends_fake(self) -> bool {
        matches!(self, Self::Fake | Self::FakeFragment | Self::FakeDisorder)
    }

    fn splits(self) -> Option<bool> {
        match self {
            Self::Fragment | Self::FakeFragment => Some(false),
            Self::Disorder | Self::FakeDisorder => Some(true),
            _ => None,
        }
    }
}

impl FromStr for TlsMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let norm: String = s.trim().chars().filter(|c| *c != '_' && *c != '-').collect();
        match norm.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "fragment" => Ok(Self::Fragment),
            "disorder" => Ok(Self::Disorder),
            "fake" => Ok(Self::Fake),
            "fakefragment" => Ok(Self::FakeFragment),
            "fakedisorder" => Ok(Self::FakeDisorder),
            _ => Err(crate::Error::config_value(PARAM_TLS_STRATEGY, format!("unknown TLS mode '{s}'"))),
        }
    }
}

/// Point-in-time copy of [`BypassMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BypassMetricsSnapshot {
    /// ClientHellos seen on TCP/443
    pub client_hellos_observed: u64,
    /// ClientHellos too short to split
    pub client_hellos_short: u64,
    /// ClientHellos without SNI
    pub client_hellos_no_sni: u64,
    /// ClientHellos split into segments
    pub client_hellos_fragmented: u64,
    /// Decoys injected
    pub fakes_sent: u64,
    /// Low-TTL copies injected
    pub ttl_copies_sent: u64,
    /// Inbound RSTs dropped
    pub rst_dropped: u64,
    /// Outbound UDP/443 datagrams dropped
    pub udp443_dropped: u64,
    /// HTTP requests split at the Host header
    pub http_host_tricks: u64,
    /// Packets where a policy picked the action
    pub policy_decisions: u64,
}

/// Counters updated from the receive loop
#[derive(Debug, Default)]
pub struct BypassMetrics {
    client_hellos_observed: AtomicU64,
    client_hellos_short: AtomicU64,
    client_hellos_no_sni: AtomicU64,
    client_hellos_fragmented: AtomicU64,
    fakes_sent: AtomicU64,
    ttl_copies_sent: AtomicU64,
    rst_dropped: AtomicU64,
    udp443_dropped: AtomicU64,
    http_host_tricks: AtomicU64,
    policy_decisions: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BypassMetrics {
    /// Current values
    pub fn snapshot(&self) -> BypassMetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BypassMetricsSnapshot {
            client_hellos_observed: load(&self.client_hellos_observed),
            client_hellos_short: load(&self.client_hellos_short),
            client_hellos_no_sni: load(&self.client_hellos_no_sni),
            client_hellos_fragmented: load(&self.client_hellos_fragmented),
            fakes_sent: load(&self.fakes_sent),
            ttl_copies_sent: load(&self.ttl_copies_sent),
            rst_dropped: load(&self.rst_dropped),
            udp443_dropped: load(&self.udp443_dropped),
            http_host_tricks: load(&self.http_host_tricks),
            policy_decisions: load(&self.policy_decisions),
        }
    }
}

/// Executes the current [`TlsBypassOptions`] on the interception chain.
///
/// Options and the decision graph are swapped atomically from outside; each
/// packet works on one consistent snapshot of both.
pub struct BypassFilter {
    options: RwLock<Arc<TlsBypassOptions>>,
    graph: RwLock<Option<Arc<DecisionGraph>>>,
    gates: PolicyGates,
    ttl_source: Option<Arc<RstInspector>>,
    faked_flows: DashMap<FlowKey, Instant>,
    host_tricked_flows: DashMap<FlowKey, Instant>,
    metrics: BypassMetrics,
}

impl std::fmt::Debug for BypassFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BypassFilter")
            .field("options", &self.options.read().to_readable_strategy())
            .field("gates", &self.gates)
            .field("has_graph", &self.graph.read().is_some())
            .finish_non_exhaustive()
    }
}

impl BypassFilter {
    /// Filter with all techniques off
    pub fn new(gates: PolicyGates) -> Self {
        Self {
            options: RwLock::new(Arc::new(TlsBypassOptions::default())),
            graph: RwLock::new(None),
            gates,
            ttl_source: None,
            faked_flows: DashMap::new(),
            host_tricked_flows: DashMap::new(),
            metrics: BypassMetrics::default(),
        }
    }

    /// Use the RST inspector's TTL baselines for auto-TTL
    #[must_use]
    pub fn with_ttl_source(mut self, inspector: Arc<RstInspector>) -> Self {
        self.ttl_source = Some(inspector);
        self
    }

    /// Replace the options
    pub fn set_options(&self, options: TlsBypassOptions) {
        debug!(strategy = %options.to_readable_strategy(), "bypass options swapped");
        *self.options.write() = Arc::new(options);
    }

    /// Current options
    pub fn options(&self) -> TlsBypassOptions {
        self.options.read().as_ref().clone()
    }

    /// Replace the decision graph
    pub fn set_decision_graph(&self, graph: Option<Arc<DecisionGraph>>) {
        *self.graph.write() = graph;
    }

    /// Counter values
    pub fn metrics(&self) -> BypassMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Forget per-flow markers older than `idle`
    pub fn cleanup(&self, now: Instant, idle: Duration) {
        self.faked_flows.retain(|_, at| now.duration_since(*at) < idle);
        self.host_tricked_flows.retain(|_, at| now.duration_since(*at) < idle);
    }

    fn gated_graph(&self, gate: bool) -> Option<Arc<DecisionGraph>> {
        if gate {
            self.graph.read().clone()
        } else {
            None
        }
    }

    fn record_policy(&self, policy: &FlowPolicy) {
        bump(&self.metrics.policy_decisions);
        trace!(policy = %policy.id, action = %policy.action, "policy decision");
    }

    fn handle_udp443(&self, packet: &Packet, opts: &TlsBypassOptions) -> FilterVerdict {
        if !opts.drop_udp_443 {
            return FilterVerdict::Pass;
        }
        let drop = if opts.drop_udp_443_global {
            true
        } else if let Some(graph) = self.gated_graph(self.gates.udp443) {
            match graph.evaluate_udp443(packet.dst_addr) {
                Some(policy) => {
                    self.record_policy(policy);
                    policy.action.drops_packet()
                }
                None => false,
            }
        } else {
            true
        };
        if drop {
            bump(&self.metrics.udp443_dropped);
            FilterVerdict::Drop
        } else {
            FilterVerdict::Pass
        }
    }

    fn handle_http(&self, packet: &Packet, ctx: &mut FilterContext, opts: &TlsBypassOptions) -> Result<FilterVerdict> {
        if !packet.is_http_request() {
            return Ok(FilterVerdict::Pass);
        }
        let enabled = match self.gated_graph(self.gates.tcp80) {
            Some(graph) => graph
                .candidates(Some(FlowProtocol::Tcp), Some(80), None)
                .into_iter()
                .find(|p| is_strategy(&p.action, STRATEGY_HTTP_HOST_TRICKS) && p.condition.matches_tcp(packet.dst_addr, None))
                .map(|p| self.record_policy(p))
                .is_some(),
            None => opts.http_host_tricks_enabled,
        };
        if !enabled {
            return Ok(FilterVerdict::Pass);
        }
        let Some(split) = host_split_offset(packet.payload()) else {
            return Ok(FilterVerdict::Pass);
        };
        let flow = FlowKey::of(packet);
        if self.host_tricked_flows.insert(flow, ctx.now()).is_some() {
            return Ok(FilterVerdict::Pass);
        }
        let plan = fragment_plan(packet.payload_len(), &[u32::try_from(split).unwrap_or(u32::MAX)]);
        let Some(plan) = plan else {
            return Ok(FilterVerdict::Pass);
        };
        for segment in split_segments(packet, &plan)? {
            ctx.inject(segment);
        }
        bump(&self.metrics.http_host_tricks);
        trace!(%flow, split, "host header split");
        Ok(FilterVerdict::Drop)
    }

    fn tls_mode_for(&self, packet: &Packet, sni: Option<&str>, opts: &TlsBypassOptions) -> TlsMode {
        let fallback = TlsMode::from_options(opts);
        let Some(graph) = self.gated_graph(self.gates.tcp443) else {
            return fallback;
        };
        let stage = if sni.is_some() { TlsStage::ClientHello } else { TlsStage::NoSni };
        let selected = graph.evaluate_tcp443_client_hello(packet.dst_addr, stage, sni).or_else(|| {
            (stage == TlsStage::NoSni)
                .then(|| graph.evaluate_tcp443_client_hello(packet.dst_addr, TlsStage::ClientHello, sni))
                .flatten()
        });
        let mode = selected.and_then(|p| match &p.action {
            PolicyAction::Strategy { strategy_id, parameters } if strategy_id.eq_ignore_ascii_case(STRATEGY_TLS_BYPASS) => {
                let mode = parameters.get(PARAM_TLS_STRATEGY)?.parse::<TlsMode>().ok()?;
                self.record_policy(p);
                Some(mode)
            }
            _ => None,
        });
        mode.unwrap_or(fallback)
    }

    fn ttl_trick_allowed(&self, packet: &Packet, sni: Option<&str>) -> bool {
        match self.gated_graph(self.gates.ttl_block) {
            Some(graph) => graph
                .evaluate_tcp443_client_hello(packet.dst_addr, TlsStage::ClientHello, sni)
                .is_some_and(|p| is_strategy(&p.action, STRATEGY_TTL_TRICK)),
            None => true,
        }
    }

    fn decoy_ttl(&self, packet: &Packet, opts: &TlsBypassOptions) -> u8 {
        if opts.auto_ttl_enabled {
            let observed = self
                .ttl_source
                .as_ref()
                .and_then(|src| src.ttl_baseline(packet.dst_addr))
                .and_then(|b| u8::try_from(b.last).ok())
                .and_then(auto_ttl);
            if let Some(ttl) = observed {
                return ttl;
            }
        }
        opts.ttl_trick_value
    }

    fn handle_client_hello(
        &self,
        packet: &Packet,
        ctx: &mut FilterContext,
        opts: &TlsBypassOptions,
    ) -> Result<FilterVerdict> {
        bump(&self.metrics.client_hellos_observed);
        let sni = packet.extract_sni();
        if sni.is_none() {
            bump(&self.metrics.client_hellos_no_sni);
            if !opts.allow_no_sni {
                return Ok(FilterVerdict::Pass);
            }
        }

        let mode = self.tls_mode_for(packet, sni.as_deref(), opts);
        let ttl = self.decoy_ttl(packet, opts);

        if opts.ttl_trick_enabled && self.ttl_trick_allowed(packet, sni.as_deref()) {
            ctx.inject(ttl_copy(packet, ttl));
            bump(&self.metrics.ttl_copies_sent);
        }

        if mode.sends_fake() || (opts.bad_checksum_enabled && mode != TlsMode::None) {
            let flow = FlowKey::of(packet);
            if self.faked_flows.insert(flow, ctx.now()).is_none() {
                let ttl = (!opts.bad_checksum_enabled).then_some(ttl);
                ctx.inject(fake_client_hello(packet, opts.bad_checksum_enabled, ttl)?);
                bump(&self.metrics.fakes_sent);
            }
        }

        let Some(reverse) = mode.splits() else {
            return Ok(FilterVerdict::Pass);
        };
        let Some(plan) = fragment_plan(packet.payload_len(), &opts.fragment_sizes) else {
            bump(&self.metrics.client_hellos_short);
            return Ok(FilterVerdict::Pass);
        };
        let mut segments = split_segments(packet, &plan)?;
        if reverse {
            segments.reverse();
        }
        for segment in segments {
            ctx.inject(segment);
        }
        bump(&self.metrics.client_hellos_fragmented);
        Ok(FilterVerdict::Drop)
    }
}

fn is_strategy(action: &PolicyAction, id: &str) -> bool {
    matches!(action, PolicyAction::Strategy { strategy_id, .. } if strategy_id.eq_ignore_ascii_case(id))
}

impl PacketFilter for BypassFilter {
    fn name(&self) -> &str {
        BYPASS_FILTER_NAME
    }

    fn priority(&self) -> i32 {
        // After the passive inspectors have seen the original packet
        -100
    }

    fn process(&self, packet: &mut Packet, ctx: &mut FilterContext) -> Result<FilterVerdict> {
        let opts = Arc::clone(&self.options.read());
        if !opts.is_any_enabled() || packet.is_fragment {
            return Ok(FilterVerdict::Pass);
        }

        if packet.is_inbound() {
            if opts.drop_rst_enabled && packet.is_rst() {
                bump(&self.metrics.rst_dropped);
                return Ok(FilterVerdict::Drop);
            }
            return Ok(FilterVerdict::Pass);
        }

        if packet.is_udp() && packet.dst_port == 443 {
            return Ok(self.handle_udp443(packet, &opts));
        }
        if !packet.is_tcp() || packet.payload_len() == 0 {
            return Ok(FilterVerdict::Pass);
        }
        match packet.dst_port {
            80 => self.handle_http(packet, ctx, &opts),
            443 if packet.is_tls_client_hello() => self.handle_client_hello(packet, ctx, &opts),
            _ => Ok(FilterVerdict::Pass),
        }
    }
}
