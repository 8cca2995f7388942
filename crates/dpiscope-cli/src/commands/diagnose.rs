//! Diagnose command - offline diagnosis of recorded host tests

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use dpiscope_core::config::Config;
use dpiscope_core::feedback::{FeedbackStore, JsonFileFeedbackStore};
use dpiscope_core::inspect::InspectionSnapshot;
use dpiscope_core::signals::{SignalStore, SignalsAdapter};
use dpiscope_core::{BypassPlan, DiagnosisEngine, DiagnosisResult, HostTested, StrategySelector};
use serde::Serialize;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Diagnose command arguments
#[derive(Args, Debug)]
pub struct DiagnoseArgs {
    /// Host test results: a JSON array or one JSON object per line ("-" for stdin)
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Diagnosis and plan for one host
#[derive(Debug, Serialize)]
pub struct HostReport {
    /// Host key the records were bucketed under
    pub host: String,
    /// Records seen for the host
    pub records: usize,
    /// Verdict
    pub diagnosis: DiagnosisResult,
    /// Plan selected for the verdict
    pub plan: BypassPlan,
}

/// Parse host test records from a JSON array or JSON lines
pub fn read_host_results(reader: impl Read) -> Result<Vec<HostTested>> {
    let mut reader = BufReader::new(reader);
    let mut content = String::new();
    reader.read_to_string(&mut content).context("Failed to read host results")?;

    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content).context("Invalid host results array");
    }

    let mut results = Vec::new();
    for (n, line) in content.as_bytes().lines().enumerate() {
        let line = line.context("Failed to read host results")?;
        if line.trim().is_empty() {
            continue;
        }
        let tested = parse_line(&line).with_context(|| format!("Invalid host result on line {}", n + 1))?;
        results.push(tested);
    }
    Ok(results)
}

/// Parse one JSON-lines record
pub fn parse_line(line: &str) -> Result<HostTested> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Replay `results` through the signal store and diagnose each host
///
/// Each record is stored at its own test time. Every host is then diagnosed
/// from its latest record, in the order hosts first appeared.
pub fn diagnose_all(config: &Config, results: &[HostTested], feedback: Option<Arc<dyn FeedbackStore>>) -> Vec<HostReport> {
    let store = Arc::new(SignalStore::new(config.signals.event_ttl(), config.signals.sweep_every));
    let adapter = SignalsAdapter::new(store, &config.signals);
    let engine = DiagnosisEngine::new(config.diagnosis.clone());
    let mut selector = StrategySelector::new(config.selector.clone());
    if let Some(store) = feedback {
        selector = selector.with_feedback(store, &config.feedback);
    }

    let inspection = InspectionSnapshot::default();
    let mut order: Vec<String> = Vec::new();
    for tested in results {
        adapter.observe_at(tested, &inspection, None, tested.tested_at);
        let key = tested.host_key();
        if !order.contains(&key) {
            order.push(key);
        }
    }

    order
        .into_iter()
        .filter_map(|host| {
            let records: Vec<&HostTested> = results.iter().filter(|t| t.host_key() == host).collect();
            let last = *records.last()?;
            let signals = adapter.build_snapshot_at(last, &inspection, config.signals.window(), last.tested_at);
            let diagnosis = engine.diagnose(&signals);
            let plan = selector.select(&diagnosis);
            debug!(host = %host, diagnosis = %diagnosis.diagnosis_id, strategies = plan.strategies.len(), "host diagnosed");
            Some(HostReport {
                host,
                records: records.len(),
                diagnosis,
                plan,
            })
        })
        .collect()
}

/// Execute diagnose command
pub fn execute(args: DiagnoseArgs, config: &Config) -> Result<()> {
    let results = if args.input.as_os_str() == "-" {
        read_host_results(std::io::stdin().lock())?
    } else {
        let file = std::fs::File::open(&args.input)
            .with_context(|| format!("Failed to open {}", args.input.display()))?;
        read_host_results(file)?
    };
    info!(records = results.len(), "Loaded host results");

    let feedback = config.feedback.path.as_ref().map(|path| {
        let store: Arc<dyn FeedbackStore> = Arc::new(JsonFileFeedbackStore::open(path, &config.feedback));
        store
    });

    let reports = diagnose_all(config, &results, feedback);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports).context("Failed to serialize reports")?);
    } else {
        print_reports(&reports);
    }
    Ok(())
}

fn print_reports(reports: &[HostReport]) {
    if reports.is_empty() {
        println!("No host results.");
        return;
    }

    for report in reports {
        let d = &report.diagnosis;
        let verdict = format!("{} ({}%)", d.diagnosis_id, d.confidence);
        let verdict = if d.diagnosis_id == dpiscope_core::DiagnosisId::NoBlockage {
            verdict.green()
        } else {
            verdict.yellow()
        };
        println!("{} {}", report.host.bold(), verdict);
        println!("  rule: {}  records: {}", d.matched_rule, report.records);
        for note in &d.notes {
            println!("  - {note}");
        }

        let plan = &report.plan;
        if plan.is_empty() {
            println!("  plan: none ({})", plan.reasoning);
        } else {
            let ids: Vec<&str> = plan.strategies.iter().map(|s| s.id.as_str()).collect();
            println!("  plan: [{}]", ids.join(", ").cyan());
            if plan.drop_udp_443 {
                println!("  assist: drop UDP 443");
            }
            if plan.allow_no_sni {
                println!("  assist: allow ClientHello without SNI");
            }
        }
        for deferred in &plan.deferred_strategies {
            println!("  deferred: {} ({})", deferred.id, deferred.reason);
        }
        println!();
    }
}
