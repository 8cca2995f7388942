//! CLI commands

pub mod completions;
pub mod config;
pub mod diagnose;
pub mod feedback;
pub mod policy;
pub mod run;

use clap::Subcommand;

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Capture traffic and diagnose/apply from host test results (main command)
    Run(run::RunArgs),

    /// Diagnose recorded host test results without touching the network
    Diagnose(diagnose::DiagnoseArgs),

    /// Flow policy files
    Policy(policy::PolicyArgs),

    /// Strategy feedback statistics
    Feedback(feedback::FeedbackArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Generate shell completions
    Completions(completions::CompletionsArgs),
}
