//! Run command - live diagnose-and-bypass session

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use dpiscope_core::apply::{ApplyRequest, ApplyService, DnsController};
use dpiscope_core::bypass::{BypassFilter, InProcessBypassEngine};
use dpiscope_core::config::Config;
use dpiscope_core::feedback::{FeedbackStore, InMemoryFeedbackStore, JsonFileFeedbackStore, StrategyOutcome};
use dpiscope_core::groups::GroupAttachmentStore;
use dpiscope_core::inspect::{InspectionSnapshot, WireInspectors};
use dpiscope_core::policy::PolicyGates;
use dpiscope_core::progress::ProgressSink;
use dpiscope_core::{FilterChain, HostTested, IntelSession, SessionOutcome};
use dpiscope_platform::{resolve_filter, NetshDnsController, PlatformError, TrafficEngine};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{diagnose, policy};

/// How often idle inspector and bypass state is dropped
const HOUSEKEEPING_EVERY: Duration = Duration::from_secs(30);

/// Run command arguments
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Host test results, one JSON object per line (default: stdin)
    #[arg(long, value_name = "FILE")]
    pub results: Option<PathBuf>,

    /// Flow policy file compiled into the bypass filter
    #[arg(long, value_name = "FILE")]
    pub policies: Option<PathBuf>,

    /// Capture filter: a preset (all, web) or a WinDivert filter expression
    #[arg(long, default_value = "all")]
    pub filter: String,

    /// Skip packet capture and work from host results alone
    #[arg(long)]
    pub no_capture: bool,

    /// Print one JSON object per evaluated record
    #[arg(long)]
    pub json: bool,
}

/// Counters printed when the session ends
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Records evaluated
    pub records: u64,
    /// Lines that did not parse
    pub invalid: u64,
    /// Plans applied
    pub applied: u64,
    /// Records whose plan was empty
    pub no_action: u64,
    /// Plans skipped as already working or covered by the active plan
    pub skipped: u64,
    /// Apply calls that failed and were rolled back
    pub failed: u64,
    /// Feedback records written
    pub feedback_records: u64,
}

/// One evaluated record, as printed with `--json`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutcomeLine<'a> {
    target: &'a str,
    action: &'static str,
    diagnosis: String,
    confidence: u8,
    strategies: Vec<&'static str>,
    doh_enabled: bool,
}

/// Whether a follow-up test shows the last plan helped
pub fn outcome_of(tested: &HostTested) -> StrategyOutcome {
    if tested.blockage.is_none() && tested.tcp_ok {
        StrategyOutcome::Success
    } else {
        StrategyOutcome::Failure
    }
}

fn action_name(outcome: &SessionOutcome) -> &'static str {
    match outcome {
        SessionOutcome::NoAction(_) => "no-action",
        SessionOutcome::AlreadyWorking { .. } => "already-working",
        SessionOutcome::Dominated { .. } => "dominated",
        SessionOutcome::Applied { .. } => "applied",
    }
}

/// Everything one `run` wires together
pub struct LiveSession {
    config: Config,
    inspectors: WireInspectors,
    bypass: Arc<InProcessBypassEngine>,
    session: IntelSession,
    dns: Option<Arc<dyn DnsController>>,
    feedback: Arc<dyn FeedbackStore>,
    groups: Arc<GroupAttachmentStore>,
    traffic: TrafficEngine,
    progress: Arc<dyn ProgressSink>,
    doh_enabled: bool,
    dns_preset: String,
    json: bool,
    summary: RunSummary,
}

impl LiveSession {
    /// Build the chain, inspectors, bypass engine and session from `config`
    pub fn build(config: &Config, args: &RunArgs) -> Result<Self> {
        let progress: Arc<dyn ProgressSink> = Arc::new(|line: &str| eprintln!("{}", line.dimmed()));

        let chain = Arc::new(FilterChain::new());
        let inspectors = WireInspectors::new(&config.inspect);
        inspectors.attach(&chain);

        let filter = BypassFilter::new(PolicyGates::from_env()).with_ttl_source(Arc::clone(&inspectors.rst));
        let bypass = Arc::new(InProcessBypassEngine::new(Arc::new(filter), Arc::clone(&chain)));
        if let Some(path) = &args.policies {
            let graph = policy::load_graph(path)?;
            info!(policies = graph.len(), keys = graph.key_count(), "Loaded flow policies");
            bypass.set_decision_graph(Some(graph));
        }

        let dns: Option<Arc<dyn DnsController>> = match &config.apply.dns_adapter {
            Some(adapter) => {
                info!(adapter = %adapter, preset = %config.apply.dns_preset, "DoH changes target adapter");
                Some(Arc::new(NetshDnsController::new(adapter)))
            }
            None => {
                debug!("No DNS adapter configured; DoH steps will be skipped");
                None
            }
        };

        let feedback: Arc<dyn FeedbackStore> = match &config.feedback.path {
            Some(path) => Arc::new(JsonFileFeedbackStore::open(path, &config.feedback)),
            None => Arc::new(InMemoryFeedbackStore::new(&config.feedback)),
        };

        let groups = Arc::new(GroupAttachmentStore::new());
        if let Some(path) = &config.groups.path {
            groups.load_best_effort(path);
        }

        let apply = ApplyService::new(Arc::clone(&bypass) as _, dns.clone());
        let session = IntelSession::from_config(config, apply, Some(Arc::clone(&feedback))).with_groups(Arc::clone(&groups));
        let traffic = TrafficEngine::new(chain).with_progress(Arc::clone(&progress));

        Ok(Self {
            config: config.clone(),
            inspectors,
            bypass,
            session,
            dns,
            feedback,
            groups,
            traffic,
            progress,
            doh_enabled: false,
            dns_preset: config.apply.dns_preset.clone(),
            json: args.json,
            summary: RunSummary::default(),
        })
    }

    /// Open the kernel capture with an already resolved filter and start
    /// the receive thread
    ///
    /// A platform without capture support is reported and tolerated.
    pub fn start_capture(&self, filter: &str) -> Result<()> {
        info!(filter = %filter, "Opening packet capture");

        match self.traffic.start(|| dpiscope_platform::open_capture(&filter)) {
            Ok(()) => {
                info!("Packet capture started - waiting for traffic...");
                Ok(())
            }
            Err(PlatformError::Unsupported(os)) => {
                warn!(os, "Packet capture is not available on this platform; using host results only");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to start packet capture - is the driver installed and the process elevated?"),
        }
    }

    /// Counters so far
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Feed host results from `reader` until it ends or `cancel` fires
    pub async fn process<R>(&mut self, reader: R, cancel: &CancellationToken) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_EVERY);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Interrupted, stopping input");
                    break;
                }
                _ = housekeeping.tick() => self.housekeeping(),
                line = lines.next_line() => match line.context("Failed to read host results")? {
                    Some(line) => self.handle_line(&line, cancel).await,
                    None => break,
                },
            }
        }
        Ok(())
    }

    async fn handle_line(&mut self, line: &str, cancel: &CancellationToken) {
        if line.trim().is_empty() {
            return;
        }
        match diagnose::parse_line(line) {
            Ok(tested) => self.handle(&tested, cancel).await,
            Err(e) => {
                self.summary.invalid += 1;
                warn!(error = %e, "Skipping invalid host result");
            }
        }
    }

    async fn handle(&mut self, tested: &HostTested, cancel: &CancellationToken) {
        self.summary.records += 1;
        let target = IntelSession::target_of(tested);

        let recorded = self.session.record_outcome(&target, outcome_of(tested));
        if recorded > 0 {
            self.summary.feedback_records += recorded as u64;
            debug!(target_key = %target, recorded, outcome = ?outcome_of(tested), "recorded plan outcome");
        }

        let inspection = tested
            .remote_ip
            .map(|ip| self.inspectors.snapshot_for(ip, Instant::now()))
            .unwrap_or_else(InspectionSnapshot::default);
        let progress = Some(self.progress.as_ref());
        self.session.observe(tested, &inspection, progress);

        let request = ApplyRequest::from_config(&self.config.apply, self.doh_enabled, self.dns_preset.clone());
        match self
            .session
            .evaluate_and_apply(tested, &inspection, request, cancel, progress)
            .await
        {
            Ok(outcome) => {
                match &outcome {
                    SessionOutcome::Applied { outcome: applied, .. } => {
                        self.summary.applied += 1;
                        self.doh_enabled = applied.planned.doh_enabled;
                        self.dns_preset.clone_from(&applied.planned.dns_preset);
                    }
                    SessionOutcome::NoAction(_) => self.summary.no_action += 1,
                    SessionOutcome::AlreadyWorking { .. } | SessionOutcome::Dominated { .. } => {
                        self.summary.skipped += 1;
                    }
                }
                self.report(&target, &outcome);
            }
            Err(e) => {
                self.summary.failed += 1;
                error!(target_key = %target, error = %e, rollback = ?e.execution().rollback_status, "Apply failed");
            }
        }
    }

    fn report(&self, target: &str, outcome: &SessionOutcome) {
        let evaluation = outcome.evaluation();
        let plan = &evaluation.plan;
        let strategies: Vec<&'static str> = plan.strategies.iter().map(|s| s.id.as_str()).collect();

        if self.json {
            let line = OutcomeLine {
                target,
                action: action_name(outcome),
                diagnosis: evaluation.diagnosis.diagnosis_id.to_string(),
                confidence: evaluation.diagnosis.confidence,
                strategies,
                doh_enabled: self.doh_enabled,
            };
            match serde_json::to_string(&line) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!(error = %e, "Failed to serialize outcome"),
            }
            return;
        }

        let action = match outcome {
            SessionOutcome::Applied { .. } => action_name(outcome).green(),
            SessionOutcome::NoAction(_) => action_name(outcome).normal(),
            _ => action_name(outcome).yellow(),
        };
        println!(
            "{} {} ({}%) {} [{}]",
            target.bold(),
            evaluation.diagnosis.diagnosis_id,
            evaluation.diagnosis.confidence,
            action,
            strategies.join(", ")
        );
    }

    fn housekeeping(&self) {
        let now = Instant::now();
        self.inspectors.cleanup(now);
        self.bypass.filter().cleanup(now, self.config.inspect.flow_idle());
    }

    /// Stop capture, restore DNS, persist state
    pub async fn shutdown(&mut self) {
        if self.traffic.is_running() {
            if let Err(e) = self.traffic.stop() {
                warn!(error = %e, "Traffic engine did not stop cleanly");
            }
        }

        if self.doh_enabled {
            if let Some(dns) = &self.dns {
                match dns.restore().await {
                    Ok(()) => {
                        info!("DNS settings restored");
                        self.doh_enabled = false;
                    }
                    Err(e) => error!(error = %e, "Failed to restore DNS settings"),
                }
            }
        }

        if let Some(path) = &self.config.groups.path {
            self.groups.persist_best_effort(path);
        }
        self.feedback.prune(Utc::now());
    }

    fn print_summary(&self) {
        let s = &self.summary;
        println!();
        println!("{}", "Session summary".bold());
        println!(
            "  records: {}  applied: {}  no-action: {}  skipped: {}  failed: {}  invalid: {}",
            s.records, s.applied, s.no_action, s.skipped, s.failed, s.invalid
        );
        println!("  feedback records: {}", s.feedback_records);
        if let Some(plan) = self.session.active_plan() {
            let ids: Vec<&str> = plan.strategies.iter().map(|st| st.id.as_str()).collect();
            println!("  active plan: [{}]", ids.join(", "));
        }

        let engine = self.traffic.stats();
        if engine.received > 0 {
            println!(
                "  packets: {} received, {} reinjected, {} dropped, {} errors",
                engine.received,
                engine.reinjected,
                engine.dropped,
                engine.recv_errors + engine.send_errors
            );
            let m = self.bypass.metrics();
            println!(
                "  bypass: {} ClientHellos, {} fragmented, {} fakes, {} RST dropped, {} UDP/443 dropped",
                m.client_hellos_observed, m.client_hellos_fragmented, m.fakes_sent, m.rst_dropped, m.udp443_dropped
            );
        }
    }
}

/// Capture filter for `args`, checked before anything is set up
fn capture_filter(args: &RunArgs) -> Result<Option<String>> {
    if args.no_capture {
        return Ok(None);
    }
    let filter = resolve_filter(&args.filter).with_context(|| format!("Invalid --filter '{}'", args.filter))?;
    Ok(Some(filter))
}

async fn run(args: RunArgs, config: &Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal, shutting down...");
        on_interrupt.cancel();
    })
    .context("Failed to set signal handler")?;

    let capture_filter = capture_filter(&args)?;
    let mut live = LiveSession::build(config, &args)?;
    match &capture_filter {
        Some(filter) => live.start_capture(filter)?,
        None => warn!("Packet capture disabled; wire inspectors stay empty"),
    }

    let result = match &args.results {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            live.process(BufReader::new(file), &cancel).await
        }
        None => {
            info!("Reading host results from stdin");
            live.process(BufReader::new(tokio::io::stdin()), &cancel).await
        }
    };

    live.shutdown().await;
    live.print_summary();
    info!("dpiscope stopped");
    result
}

/// Execute the run command
pub fn execute(args: RunArgs, config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dpiscope-worker")
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(args, config))
}
