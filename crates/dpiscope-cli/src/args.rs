//! Command-line argument parsing

use crate::commands::Command;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// dpiscope - DPI blockage diagnosis and bypass planning
///
/// Turns host test results and wire observations into a diagnosis, picks a
/// bypass plan for it, and applies the plan with rollback on failure.
#[derive(Parser, Debug)]
#[command(name = "dpiscope")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (default: ./dpiscope.toml, then the user config dir)
    #[arg(short = 'c', long, global = true, value_name = "FILE", env = "DPISCOPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format for logs
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Log file path
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Run in quiet mode (errors only, no banner)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
    /// Compact format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;

    #[test]
    fn test_verbose() {
        let args = Args::parse_from(["dpiscope", "-v", "config", "show"]);
        assert_eq!(args.verbose, 1);

        let args = Args::parse_from(["dpiscope", "config", "show", "-vvv"]);
        assert_eq!(args.verbose, 3);
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let args = Args::parse_from(["dpiscope", "diagnose", "results.json", "-c", "custom.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(args.command, Command::Diagnose(_)));
    }

    #[test]
    fn test_log_format() {
        let args = Args::parse_from(["dpiscope", "--log-format", "json", "feedback", "show"]);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Args::try_parse_from(["dpiscope"]).is_err());
    }
}
