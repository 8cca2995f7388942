//! dpiscope CLI
//!
//! Command-line interface for blockage diagnosis and DPI bypass planning.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use args::Args;
use commands::config::LoadedConfig;
use commands::Command;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    #[cfg(windows)]
    let _ = colored::control::set_virtual_terminal(true);

    // `config init` must work even when the existing file is broken
    let loaded = match &args.command {
        Command::Config(c) if c.is_init() => LoadedConfig::default(),
        _ => commands::config::load(args.config.as_deref())?,
    };

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = logging::init(&args, &loaded.config.logging)?;

    if !args.quiet && atty::is(atty::Stream::Stdout) && matches!(args.command, Command::Run(_)) {
        print_banner();
    }

    let result = run(args, &loaded);

    if let Err(ref e) = result {
        error!("Fatal error: {:#}", e);
    }

    result
}

fn run(args: Args, loaded: &LoadedConfig) -> Result<()> {
    match args.command {
        Command::Run(run_args) => commands::run::execute(run_args, &loaded.config),
        Command::Diagnose(diagnose_args) => commands::diagnose::execute(diagnose_args, &loaded.config),
        Command::Policy(policy_args) => commands::policy::execute(policy_args),
        Command::Feedback(feedback_args) => commands::feedback::execute(feedback_args, &loaded.config),
        Command::Config(config_args) => commands::config::execute(config_args, loaded),
        Command::Completions(comp_args) => commands::completions::execute(comp_args),
    }
}

fn print_banner() {
    use colored::Colorize;

    println!();
    println!("{}", "╔═══════════════════════════════════════════════════════╗".cyan());
    println!(
        "{}{}{}",
        "║  ".cyan(),
        format!("dpiscope v{:<42}", env!("CARGO_PKG_VERSION")).green().bold(),
        " ║".cyan()
    );
    println!(
        "{}{}{}",
        "║  ".cyan(),
        format!("{:<52}", "Blockage diagnosis and DPI bypass").white(),
        " ║".cyan()
    );
    println!("{}", "╚═══════════════════════════════════════════════════════╝".cyan());
    println!();
}
