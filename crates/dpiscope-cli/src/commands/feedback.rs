//! Feedback command - inspect and prune the strategy outcome file

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use dpiscope_core::config::Config;
use dpiscope_core::feedback::{FeedbackDocument, FeedbackStore, JsonFileFeedbackStore};
use std::path::{Path, PathBuf};
use tracing::info;

/// Feedback command arguments
#[derive(Args, Debug)]
pub struct FeedbackArgs {
    #[command(subcommand)]
    pub action: FeedbackAction,

    /// Feedback file (default: feedback.path from the config)
    #[arg(long, global = true, value_name = "FILE")]
    pub file: Option<PathBuf>,
}

/// Feedback subcommands
#[derive(Subcommand, Debug)]
pub enum FeedbackAction {
    /// List recorded outcomes per (diagnosis, strategy)
    Show {
        /// Print the stored JSON document
        #[arg(long)]
        json: bool,
    },

    /// Drop expired entries and enforce the size cap
    Prune,
}

fn resolve_path(explicit: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    match explicit.or_else(|| config.feedback.path.clone()) {
        Some(path) => Ok(path),
        None => bail!("No feedback file: set feedback.path in the config or pass --file"),
    }
}

/// Execute feedback command
pub fn execute(args: FeedbackArgs, config: &Config) -> Result<()> {
    let path = resolve_path(args.file, config)?;
    let store = JsonFileFeedbackStore::open(&path, &config.feedback);

    match args.action {
        FeedbackAction::Show { json } => show(&store, json),
        FeedbackAction::Prune => prune(&store, &path),
    }
}

fn show(store: &JsonFileFeedbackStore, json: bool) -> Result<()> {
    let stats = store.snapshot();
    if json {
        let doc = FeedbackDocument::from_stats(&stats, Utc::now());
        println!("{}", serde_json::to_string_pretty(&doc).context("Failed to serialize feedback")?);
        return Ok(());
    }

    println!("Feedback file: {}", store.path().display());
    if stats.is_empty() {
        println!("  (no outcomes recorded)");
        return Ok(());
    }

    println!(
        "  {:<18} {:<22} {:>7} {:>7} {:>6}  {}",
        "DIAGNOSIS", "STRATEGY", "SUCCESS", "FAILURE", "RATE", "UPDATED"
    );
    for (key, s) in &stats {
        println!(
            "  {:<18} {:<22} {:>7} {:>7} {:>5.0}%  {}",
            key.diagnosis.as_str(),
            key.strategy.as_str(),
            s.success_count,
            s.failure_count,
            s.success_rate() * 100.0,
            s.last_updated.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn prune(store: &JsonFileFeedbackStore, path: &Path) -> Result<()> {
    let before = store.snapshot().len();
    store.prune(Utc::now());
    let after = store.snapshot().len();

    info!(path = %path.display(), before, after, "Pruned feedback");
    println!("Pruned {} entr{} ({} kept)", before - after, if before - after == 1 { "y" } else { "ies" }, after);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use dpiscope_core::config::FeedbackConfig;
    use dpiscope_core::diagnosis::DiagnosisId;
    use dpiscope_core::feedback::{FeedbackKey, StrategyOutcome};
    use dpiscope_core::strategy::StrategyId;

    #[test]
    fn test_resolve_path_prefers_flag() {
        let mut config = Config::default();
        assert!(resolve_path(None, &config).is_err());

        config.feedback.path = Some(PathBuf::from("from-config.json"));
        assert_eq!(resolve_path(None, &config).unwrap(), PathBuf::from("from-config.json"));
        assert_eq!(
            resolve_path(Some(PathBuf::from("flag.json")), &config).unwrap(),
            PathBuf::from("flag.json")
        );
    }

    #[test]
    fn test_prune_drops_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.json");
        let cfg = FeedbackConfig::default();
        let store = JsonFileFeedbackStore::open(&path, &cfg);

        let fresh = FeedbackKey::new(DiagnosisId::SilentDrop, StrategyId::TlsFragment);
        let stale = FeedbackKey::new(DiagnosisId::DnsHijack, StrategyId::UseDoh);
        store.record(fresh, StrategyOutcome::Success, Utc::now());
        store.record(stale, StrategyOutcome::Failure, Utc::now() - Duration::days(90));
        assert_eq!(store.snapshot().len(), 2);

        prune(&store, &path).unwrap();
        let reopened = JsonFileFeedbackStore::open(&path, &cfg);
        assert!(reopened.stats(fresh).is_some());
        assert!(reopened.stats(stale).is_none());
    }

    #[test]
    fn test_show_empty_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileFeedbackStore::open(dir.path().join("feedback.json"), &FeedbackConfig::default());
        assert!(show(&store, false).is_ok());
        assert!(show(&store, true).is_ok());
    }
}
