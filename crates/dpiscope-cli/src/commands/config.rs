//! Config command - configuration management

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use dpiscope_core::config::Config;
use std::path::{Path, PathBuf};
use tracing::info;

/// File names tried in the working directory
const LOCAL_CANDIDATES: [&str; 2] = ["dpiscope.toml", "config.toml"];

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a configuration file with every default spelled out
    Init {
        /// Output file path
        #[arg(short, long, default_value = "dpiscope.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show,

    /// Validate a configuration file
    Validate {
        /// Config file to validate (default: the discovered one)
        file: Option<PathBuf>,
    },

    /// Show config file locations
    Paths,
}

impl ConfigArgs {
    /// Whether the command creates a config rather than reading one
    pub fn is_init(&self) -> bool {
        matches!(self.action, ConfigAction::Init { .. })
    }
}

/// Configuration plus where it came from
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    /// Parsed configuration
    pub config: Config,
    /// Source file, `None` for built-in defaults
    pub path: Option<PathBuf>,
}

fn user_config_file() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "dpiscope").map(|dirs| dirs.config_dir().join("dpiscope.toml"))
}

/// First existing config file: working directory, then user config dir
pub fn find_config_file() -> Option<PathBuf> {
    LOCAL_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .chain(user_config_file())
        .find(|path| path.exists())
}

/// Load `explicit`, or the discovered file, or defaults
///
/// An explicit path that does not exist is an error; discovery silently
/// falls back to defaults.
pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };
    let Some(path) = path else {
        return Ok(LoadedConfig::default());
    };

    let config = Config::load(&path).with_context(|| format!("Failed to load config from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(LoadedConfig {
        config,
        path: Some(path),
    })
}

/// Execute config command
pub fn execute(args: ConfigArgs, loaded: &LoadedConfig) -> Result<()> {
    match args.action {
        ConfigAction::Init { output, force } => init_config(&output, force),
        ConfigAction::Show => show_config(loaded),
        ConfigAction::Validate { file } => validate_config(file.as_deref().or(loaded.path.as_deref())),
        ConfigAction::Paths => show_paths(),
    }
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let toml_str = Config::default().to_toml().context("Failed to serialize config")?;
    let content = format!(
        "# dpiscope configuration\n\
         # Every section is optional; missing keys keep these defaults.\n\n\
         {toml_str}"
    );

    std::fs::write(output, content).with_context(|| format!("Failed to write config to {}", output.display()))?;

    info!(path = %output.display(), "Generated config file");
    println!("Configuration file generated: {}", output.display());
    Ok(())
}

fn show_config(loaded: &LoadedConfig) -> Result<()> {
    match &loaded.path {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# Built-in defaults (no config file found)"),
    }
    let toml_str = loaded.config.to_toml().context("Failed to serialize config")?;
    println!("{toml_str}");
    Ok(())
}

fn validate_config(file: Option<&Path>) -> Result<()> {
    let Some(file) = file else {
        bail!("No configuration file given or found");
    };
    let config = Config::load(file).with_context(|| format!("Failed to load config from {}", file.display()))?;
    config.validate().context("Configuration validation failed")?;

    println!("✓ Configuration is valid");
    println!("  Min confidence: {}", config.selector.min_confidence);
    println!("  High-risk confidence: {}", config.selector.high_risk_min_confidence);
    println!("  Apply timeout: {} ms", config.apply.timeout_ms);
    println!("  DNS changes allowed: {}", config.apply.allow_dns_changes);
    match &config.feedback.path {
        Some(path) => println!("  Feedback file: {}", path.display()),
        None => println!("  Feedback file: (in memory)"),
    }

    Ok(())
}

fn show_paths() -> Result<()> {
    println!("Configuration file search paths:");
    println!();
    for (i, name) in LOCAL_CANDIDATES.iter().enumerate() {
        println!("  {}. ./{}", i + 1, name);
    }
    if let Some(path) = user_config_file() {
        println!("  {}. {}", LOCAL_CANDIDATES.len() + 1, path.display());
    }
    println!();
    println!("DPISCOPE_CONFIG or -c/--config overrides the search.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpiscope.toml");

        init_config(&path, false).unwrap();
        assert!(validate_config(Some(&path)).is_ok());

        // Refuses to clobber without --force
        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
    }

    #[test]
    fn test_load_explicit_missing_file() {
        let err = load(Some(Path::new("/definitely/not/dpiscope.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to load config"));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[selector]\nmin_confidence = 90\nhigh_risk_min_confidence = 60\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[apply]\ntimeout_ms = 2500\n").unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.config.apply.timeout_ms, 2500);
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
    }
}
