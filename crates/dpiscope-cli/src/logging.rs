//! Logging initialization

use anyhow::{Context, Result};
use dpiscope_core::config::LoggingConfig;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Args, LogFormat};

/// Default level: `-q` and `-v` win, then the config file
fn default_level(args: &Args, cfg: &LoggingConfig) -> Level {
    if args.quiet {
        return Level::ERROR;
    }
    match args.verbose {
        0 => cfg.level.parse().unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialize logging based on CLI arguments and the `[logging]` section
///
/// `RUST_LOG` refines the default level. The returned guard flushes the
/// file writer and must live until exit.
pub fn init(args: &Args, cfg: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level(args, cfg).into())
        .from_env_lossy();

    let log_file = args.log_file.as_ref().or(cfg.file.as_ref());
    let (file_writer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let format = if cfg.json_format && args.log_format == LogFormat::Text {
        LogFormat::Json
    } else {
        args.log_format
    };

    // Logs go to stderr; stdout carries command output
    match format {
        LogFormat::Text => {
            let console = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(args.verbose >= 2)
                .with_thread_ids(args.verbose >= 3)
                .with_file(args.verbose >= 3)
                .with_line_number(args.verbose >= 3);
            let file = file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w));
            tracing_subscriber::registry().with(env_filter).with(console).with(file).init();
        }
        LogFormat::Json => {
            let console = fmt::layer().json().with_writer(std::io::stderr);
            let file = file_writer.map(|w| fmt::layer().json().with_writer(w));
            tracing_subscriber::registry().with(env_filter).with(console).with(file).init();
        }
        LogFormat::Compact => {
            let console = fmt::layer().compact().with_writer(std::io::stderr);
            let file = file_writer.map(|w| fmt::layer().compact().with_ansi(false).with_writer(w));
            tracing_subscriber::registry().with(env_filter).with(console).with(file).init();
        }
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_level_precedence() {
        let cfg = LoggingConfig {
            level: "warn".into(),
            ..LoggingConfig::default()
        };

        let args = Args::parse_from(["dpiscope", "config", "show"]);
        assert_eq!(default_level(&args, &cfg), Level::WARN);

        let args = Args::parse_from(["dpiscope", "-vv", "config", "show"]);
        assert_eq!(default_level(&args, &cfg), Level::TRACE);

        let args = Args::parse_from(["dpiscope", "-q", "-v", "config", "show"]);
        assert_eq!(default_level(&args, &cfg), Level::ERROR);
    }

    #[test]
    fn test_unparseable_config_level_falls_back() {
        let cfg = LoggingConfig {
            level: "chatty".into(),
            ..LoggingConfig::default()
        };
        let args = Args::parse_from(["dpiscope", "config", "show"]);
        assert_eq!(default_level(&args, &cfg), Level::INFO);
    }
}
