//! One diagnosis/bypass session
//!
//! [`IntelSession`] owns the pieces of one run and wires them in order:
//! observe, diagnose, select, check dominance, apply, record feedback.
//! What worked for a target is remembered in a small LRU keyed by target,
//! so one host's success never leaks into another host's decisions.

use crate::apply::{ApplyError, ApplyOutcome, ApplyRequest, ApplyService};
use crate::config::Config;
use crate::diagnosis::{DiagnosisEngine, DiagnosisId, DiagnosisResult};
use crate::feedback::{FeedbackKey, FeedbackStore, StrategyOutcome};
use crate::groups::{normalize_key, GroupAttachmentStore, TOKEN_ALLOW_NO_SNI, TOKEN_DROP_UDP_443};
use crate::inspect::{etld_plus_one, InspectionSnapshot};
use crate::progress::{emit, ProgressSink};
use crate::signals::{BlockageSignals, HostTested, SignalStore, SignalsAdapter};
use crate::strategy::{plan_signature, BypassPlan, PlanSelector, StrategyId, StrategySelector};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use lru::LruCache;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bounded target → plan signature map, least recently used evicted first
#[derive(Debug)]
pub struct WorkingPlanMemory {
    entries: LruCache<String, String>,
}

impl WorkingPlanMemory {
    /// Memory holding at most `capacity` targets (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Remember `signature` as working for `target`
    pub fn remember(&mut self, target: &str, signature: &str) {
        self.entries.put(target.to_string(), signature.to_string());
    }

    /// Signature for `target`; marks it as recently used
    pub fn get(&mut self, target: &str) -> Option<String> {
        self.entries.get(target).cloned()
    }

    /// Forget `target`
    pub fn forget(&mut self, target: &str) -> bool {
        self.entries.pop(target).is_some()
    }

    /// Number of remembered targets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing remembered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Signals, diagnosis and plan for one target
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Normalized target key
    pub target: String,
    /// Aggregated signals
    pub signals: BlockageSignals,
    /// Diagnosis over the signals
    pub diagnosis: DiagnosisResult,
    /// Selected plan
    pub plan: BypassPlan,
}

/// What one evaluate-and-apply cycle did
#[derive(Debug)]
pub enum SessionOutcome {
    /// The plan was empty
    NoAction(Box<Evaluation>),
    /// A plan covering this one already worked for the target
    AlreadyWorking {
        /// The evaluation
        evaluation: Box<Evaluation>,
        /// Remembered signature
        signature: String,
    },
    /// Everything the plan asks for is already active
    Dominated {
        /// The evaluation
        evaluation: Box<Evaluation>,
        /// Signature of the active plan
        active_signature: String,
    },
    /// The plan was applied
    Applied {
        /// The evaluation
        evaluation: Box<Evaluation>,
        /// Apply result
        outcome: Box<ApplyOutcome>,
    },
}

impl SessionOutcome {
    /// Evaluation behind the outcome
    pub fn evaluation(&self) -> &Evaluation {
        match self {
            Self::NoAction(evaluation)
            | Self::AlreadyWorking { evaluation, .. }
            | Self::Dominated { evaluation, .. }
            | Self::Applied { evaluation, .. } => evaluation,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingPlan {
    diagnosis: DiagnosisId,
    strategies: Vec<StrategyId>,
    signature: String,
}

#[derive(Debug)]
struct SessionState {
    working: WorkingPlanMemory,
    active: Option<BypassPlan>,
    pending: HashMap<String, PendingPlan>,
}

/// Orchestrates one session
pub struct IntelSession {
    adapter: SignalsAdapter,
    diagnosis: DiagnosisEngine,
    selector: StrategySelector,
    apply: ApplyService,
    feedback: Option<Arc<dyn FeedbackStore>>,
    groups: Option<Arc<GroupAttachmentStore>>,
    window: Duration,
    state: Mutex<SessionState>,
}

impl IntelSession {
    /// Session over the given parts
    pub fn new(
        adapter: SignalsAdapter,
        diagnosis: DiagnosisEngine,
        selector: StrategySelector,
        apply: ApplyService,
        window: Duration,
        memory: usize,
    ) -> Self {
        Self {
            adapter,
            diagnosis,
            selector,
            apply,
            feedback: None,
            groups: None,
            window,
            state: Mutex::new(SessionState {
                working: WorkingPlanMemory::new(memory),
                active: None,
                pending: HashMap::new(),
            }),
        }
    }

    /// Session wired from `cfg`; `feedback` both weights selection and
    /// receives outcomes
    pub fn from_config(cfg: &Config, apply: ApplyService, feedback: Option<Arc<dyn FeedbackStore>>) -> Self {
        let store = Arc::new(SignalStore::new(cfg.signals.event_ttl(), cfg.signals.sweep_every));
        let mut selector = StrategySelector::new(cfg.selector.clone());
        if let Some(fb) = &feedback {
            selector = selector.with_feedback(Arc::clone(fb), &cfg.feedback);
        }
        let mut session = Self::new(
            SignalsAdapter::new(store, &cfg.signals),
            DiagnosisEngine::new(cfg.diagnosis.clone()),
            selector,
            apply,
            cfg.signals.window(),
            cfg.apply.session_memory,
        );
        session.feedback = feedback;
        session
    }

    /// Record outcomes into `store`
    pub fn with_feedback(mut self, store: Arc<dyn FeedbackStore>) -> Self {
        self.feedback = Some(store);
        self
    }

    /// Attach applied plans to host groups
    pub fn with_groups(mut self, groups: Arc<GroupAttachmentStore>) -> Self {
        self.groups = Some(groups);
        self
    }

    /// The signals adapter
    pub fn adapter(&self) -> &SignalsAdapter {
        &self.adapter
    }

    /// The apply service
    pub fn apply_service(&self) -> &ApplyService {
        &self.apply
    }

    /// Target key of a test result
    pub fn target_of(tested: &HostTested) -> String {
        normalize_key(&tested.host_key())
    }

    /// Feed one test result and the wire inspection into the signal store
    pub fn observe(&self, tested: &HostTested, inspection: &InspectionSnapshot, progress: Option<&dyn ProgressSink>) {
        self.adapter.observe(tested, inspection, progress);
    }

    /// Diagnose and plan for the target of `tested`
    pub fn evaluate(&self, tested: &HostTested, inspection: &InspectionSnapshot) -> Evaluation {
        self.evaluate_at(tested, inspection, Utc::now())
    }

    /// [`Self::evaluate`] at a given time
    pub fn evaluate_at(&self, tested: &HostTested, inspection: &InspectionSnapshot, now: DateTime<Utc>) -> Evaluation {
        let signals = self.adapter.build_snapshot_at(tested, inspection, self.window, now);
        let diagnosis = self.diagnosis.diagnose(&signals);
        let plan = self.selector.select(&diagnosis);
        Evaluation {
            target: Self::target_of(tested),
            signals,
            diagnosis,
            plan,
        }
    }

    /// Evaluate, skip redundant plans, apply the rest.
    ///
    /// A plan is skipped when its actions are a subset of what already
    /// worked for this target, or of what is active. An apply that fails
    /// leaves the active plan unchanged.
    pub async fn evaluate_and_apply(
        &self,
        tested: &HostTested,
        inspection: &InspectionSnapshot,
        request: ApplyRequest,
        cancel: &CancellationToken,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<SessionOutcome, ApplyError> {
        let evaluation = Box::new(self.evaluate(tested, inspection));
        if evaluation.plan.is_empty() {
            emit(
                progress,
                &format!(
                    "[INTEL] {}: {} ({}%), nothing to apply",
                    evaluation.target, evaluation.diagnosis.diagnosis_id, evaluation.diagnosis.confidence
                ),
            );
            return Ok(SessionOutcome::NoAction(evaluation));
        }

        let signature = plan_signature(&evaluation.plan);
        {
            let mut state = self.state.lock();
            if let Some(working) = state.working.get(&evaluation.target) {
                if PlanSelector::is_dominated_signature(&signature, &working) {
                    emit(
                        progress,
                        &format!("[INTEL] {}: plan {signature} already worked ({working})", evaluation.target),
                    );
                    return Ok(SessionOutcome::AlreadyWorking {
                        evaluation,
                        signature: working,
                    });
                }
            }
            if let Some(active) = &state.active {
                if PlanSelector::is_dominated(&evaluation.plan, active) {
                    let active_signature = plan_signature(active);
                    emit(
                        progress,
                        &format!("[INTEL] {}: plan {signature} covered by active {active_signature}", evaluation.target),
                    );
                    return Ok(SessionOutcome::Dominated {
                        evaluation,
                        active_signature,
                    });
                }
            }
        }

        let outcome = self
            .apply
            .apply_plan_with_rollback(&evaluation.plan, request, cancel, progress)
            .await?;

        {
            let mut state = self.state.lock();
            match &mut state.active {
                Some(active) => merge_plan(active, &evaluation.plan),
                None => state.active = Some(evaluation.plan.clone()),
            }
            state.pending.insert(
                evaluation.target.clone(),
                PendingPlan {
                    diagnosis: evaluation.diagnosis.diagnosis_id,
                    strategies: evaluation.plan.strategies.iter().map(|s| s.id).collect(),
                    signature: signature.clone(),
                },
            );
        }
        self.attach_to_group(tested, &evaluation.plan);
        info!(target_key = %evaluation.target, plan = %signature, "bypass plan applied");

        Ok(SessionOutcome::Applied {
            evaluation,
            outcome: Box::new(outcome),
        })
    }

    fn attach_to_group(&self, tested: &HostTested, plan: &BypassPlan) {
        let Some(groups) = &self.groups else {
            return;
        };
        let Some(host) = tested.hostname.as_deref().map(normalize_key).filter(|h| !h.is_empty()) else {
            return;
        };
        let group = groups
            .pinned_group(&host)
            .or_else(|| etld_plus_one(&host))
            .unwrap_or_else(|| host.clone());
        let endpoints: Vec<String> = tested
            .remote_ip
            .map(|ip| SocketAddr::new(ip, tested.port).to_string())
            .into_iter()
            .collect();
        groups.update_attachment_from_apply(&group, &host, &endpoints, &plan_tokens(plan));
        debug!(group = %group, host = %host, "group attachment updated");
    }

    /// Report whether the last applied plan for `target` helped.
    ///
    /// Every strategy of that plan gets one feedback record. Success
    /// remembers the plan as working for the target; failure forgets it.
    /// Returns the number of strategies recorded.
    pub fn record_outcome(&self, target: &str, outcome: StrategyOutcome) -> usize {
        if outcome == StrategyOutcome::Unknown {
            return 0;
        }
        let key = normalize_key(target);
        let pending = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.remove(&key) else {
                return 0;
            };
            match outcome {
                StrategyOutcome::Success => state.working.remember(&key, &pending.signature),
                StrategyOutcome::Failure | StrategyOutcome::Unknown => {
                    state.working.forget(&key);
                }
            }
            pending
        };

        let Some(store) = &self.feedback else {
            return 0;
        };
        let now = Utc::now();
        for &strategy in &pending.strategies {
            store.record(FeedbackKey::new(pending.diagnosis, strategy), outcome, now);
        }
        pending.strategies.len()
    }

    /// Signature that last worked for `target`
    pub fn working_signature(&self, target: &str) -> Option<String> {
        self.state.lock().working.get(&normalize_key(target))
    }

    /// Union of everything applied in this session
    pub fn active_plan(&self) -> Option<BypassPlan> {
        self.state.lock().active.clone()
    }

    /// Forget the active plan, e.g. after the bypass was switched off
    pub fn clear_active(&self) {
        self.state.lock().active = None;
    }
}

fn merge_plan(active: &mut BypassPlan, plan: &BypassPlan) {
    for strategy in &plan.strategies {
        if !active.contains(strategy.id) {
            active.strategies.push(strategy.clone());
        }
    }
    active.drop_udp_443 |= plan.drop_udp_443;
    active.allow_no_sni |= plan.allow_no_sni;
}

fn plan_tokens(plan: &BypassPlan) -> String {
    let mut tokens: Vec<&str> = plan
        .strategies
        .iter()
        .filter(|s| s.id != StrategyId::None)
        .map(|s| s.id.as_str())
        .collect();
    if plan.drop_udp_443 {
        tokens.push(TOKEN_DROP_UDP_443);
    }
    if plan.allow_no_sni {
        tokens.push(TOKEN_ALLOW_NO_SNI);
    }
    tokens.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::{BypassEngine, BypassFilter, InProcessBypassEngine};
    use crate::feedback::InMemoryFeedbackStore;
    use crate::intercept::FilterChain;
    use crate::policy::PolicyGates;
    use crate::signals::BlockageCode;
    use std::net::IpAddr;

    fn ip() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn session(cfg: &Config) -> (IntelSession, Arc<InProcessBypassEngine>, Arc<InMemoryFeedbackStore>) {
        let engine = Arc::new(InProcessBypassEngine::new(
            Arc::new(BypassFilter::new(PolicyGates::default())),
            Arc::new(FilterChain::new()),
        ));
        let feedback = Arc::new(InMemoryFeedbackStore::new(&cfg.feedback));
        let apply = ApplyService::new(Arc::clone(&engine) as Arc<dyn BypassEngine>, None);
        let session = IntelSession::from_config(cfg, apply, Some(Arc::clone(&feedback) as Arc<dyn FeedbackStore>));
        (session, engine, feedback)
    }

    fn silent_drop() -> (HostTested, InspectionSnapshot) {
        let mut tested = HostTested::ok("video.example.com", Some(ip()), Utc::now());
        tested.tcp_ok = false;
        tested.tls_ok = false;
        tested.blockage = Some(BlockageCode::TcpConnectTimeout);
        let inspection = InspectionSnapshot {
            retransmissions: 25,
            total_packets: 100,
            ..Default::default()
        };
        (tested, inspection)
    }

    fn request() -> ApplyRequest {
        ApplyRequest::from_config(&Config::default().apply, false, "Cloudflare")
    }

    // ====== Memory Tests ======

    #[test]
    fn test_memory_evicts_least_recent() {
        let mut m = WorkingPlanMemory::new(2);
        m.remember("a", "TlsFragment|U0|N0");
        m.remember("b", "DropRst|U0|N0");
        assert!(m.get("a").is_some());
        m.remember("c", "UseDoh|U0|N0");
        assert_eq!(m.len(), 2);
        assert!(m.get("b").is_none());
        assert_eq!(m.get("a").as_deref(), Some("TlsFragment|U0|N0"));
    }

    #[test]
    fn test_memory_replaces_and_forgets() {
        let mut m = WorkingPlanMemory::new(0);
        m.remember("a", "x|U0|N0");
        m.remember("a", "y|U0|N0");
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("a").as_deref(), Some("y|U0|N0"));
        assert!(m.forget("a"));
        assert!(m.is_empty());
    }

    // ====== Evaluate Tests ======

    #[test]
    fn test_evaluate_silent_drop() {
        let (s, _, _) = session(&Config::default());
        let (tested, inspection) = silent_drop();
        s.observe(&tested, &inspection, None);
        let e = s.evaluate(&tested, &inspection);
        assert_eq!(e.target, "203.0.113.7");
        assert_eq!(e.diagnosis.diagnosis_id, DiagnosisId::SilentDrop);
        assert_eq!(e.diagnosis.confidence, 80);
        assert!(e.plan.contains(StrategyId::TlsFragment));
        assert!(e.plan.contains(StrategyId::DropRst));
    }

    // ====== Cycle Tests ======

    #[tokio::test]
    async fn test_apply_then_dominated() {
        let (s, engine, _) = session(&Config::default());
        let (tested, inspection) = silent_drop();
        let cancel = CancellationToken::new();

        let first = s
            .evaluate_and_apply(&tested, &inspection, request(), &cancel, None)
            .await
            .unwrap();
        assert!(matches!(first, SessionOutcome::Applied { .. }));
        let options = engine.current_options();
        assert!(options.fragment_enabled);
        assert!(options.drop_rst_enabled);

        let second = s
            .evaluate_and_apply(&tested, &inspection, request(), &cancel, None)
            .await
            .unwrap();
        match second {
            SessionOutcome::Dominated { active_signature, .. } => {
                assert_eq!(active_signature, "DropRst,TlsFragment|U0|N0");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_remembered_per_target() {
        let (s, _, feedback) = session(&Config::default());
        let (tested, inspection) = silent_drop();
        let cancel = CancellationToken::new();
        s.evaluate_and_apply(&tested, &inspection, request(), &cancel, None)
            .await
            .unwrap();

        assert_eq!(s.record_outcome("203.0.113.7", StrategyOutcome::Success), 2);
        assert_eq!(s.record_outcome("203.0.113.7", StrategyOutcome::Success), 0);
        assert_eq!(s.working_signature("203.0.113.7").as_deref(), Some("DropRst,TlsFragment|U0|N0"));
        assert!(s.working_signature("198.51.100.1").is_none());

        let stats = feedback
            .stats(FeedbackKey::new(DiagnosisId::SilentDrop, StrategyId::TlsFragment))
            .unwrap();
        assert_eq!(stats.success_count, 1);

        s.clear_active();
        let again = s
            .evaluate_and_apply(&tested, &inspection, request(), &cancel, None)
            .await
            .unwrap();
        assert!(matches!(again, SessionOutcome::AlreadyWorking { .. }));
    }

    #[tokio::test]
    async fn test_failure_forgets_working_plan() {
        let (s, _, feedback) = session(&Config::default());
        let (tested, inspection) = silent_drop();
        let cancel = CancellationToken::new();
        s.evaluate_and_apply(&tested, &inspection, request(), &cancel, None)
            .await
            .unwrap();
        s.record_outcome("203.0.113.7", StrategyOutcome::Failure);
        assert!(s.working_signature("203.0.113.7").is_none());
        let stats = feedback
            .stats(FeedbackKey::new(DiagnosisId::SilentDrop, StrategyId::DropRst))
            .unwrap();
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_clean_host_is_no_action() {
        let (s, engine, _) = session(&Config::default());
        let tested = HostTested::ok("example.com", Some(ip()), Utc::now());
        s.observe(&tested, &InspectionSnapshot::default(), None);
        s.observe(&tested, &InspectionSnapshot::default(), None);
        let out = s
            .evaluate_and_apply(&tested, &InspectionSnapshot::default(), request(), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert!(matches!(out, SessionOutcome::NoAction(_)));
        assert!(!engine.current_options().is_any_enabled());
    }

    #[tokio::test]
    async fn test_apply_attaches_group() {
        let (s, _, _) = session(&Config::default());
        let groups = Arc::new(GroupAttachmentStore::new());
        let s = s.with_groups(Arc::clone(&groups));
        let (tested, inspection) = silent_drop();
        s.evaluate_and_apply(&tested, &inspection, request(), &CancellationToken::new(), None)
            .await
            .unwrap();

        let snapshot = groups.participation_snapshot("example.com");
        assert_eq!(snapshot.attachments.len(), 1);
        assert_eq!(snapshot.attachments[0].host_key, "video.example.com");
        assert_eq!(snapshot.attachments[0].candidate_ip_endpoints, ["203.0.113.7:443"]);
    }

    #[test]
    fn test_plan_tokens() {
        let mut plan = BypassPlan::empty(DiagnosisId::SilentDrop, 80, "x");
        plan.drop_udp_443 = true;
        assert_eq!(plan_tokens(&plan), "DROP_UDP_443");
    }
}
