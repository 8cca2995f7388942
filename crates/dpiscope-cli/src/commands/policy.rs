//! Policy command - compile and probe flow policy files

use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use colored::Colorize;
use dpiscope_core::policy::{DecisionGraph, FlowPolicy, PolicySet, TlsStage};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Policy command arguments
#[derive(Args, Debug)]
pub struct PolicyArgs {
    #[command(subcommand)]
    pub action: PolicyAction,
}

/// Policy subcommands
#[derive(Subcommand, Debug)]
pub enum PolicyAction {
    /// Compile a policy file and report conflicts
    Check {
        /// Policy file (TOML, or JSON by extension)
        file: PathBuf,

        /// Show which policy a UDP/443 packet to this address hits
        #[arg(long, value_name = "IP")]
        udp443: Option<IpAddr>,

        /// Show which policy a TCP/443 TLS packet to this address hits
        #[arg(long, value_name = "IP")]
        tls: Option<IpAddr>,

        /// TLS stage for --tls
        #[arg(long, value_enum, default_value = "client-hello")]
        stage: StageArg,

        /// Server name carried by the --tls packet
        #[arg(long, value_name = "HOST")]
        sni: Option<String>,
    },
}

/// TLS stage as typed on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StageArg {
    /// First client flight
    ClientHello,
    /// ClientHello without SNI
    NoSni,
}

impl From<StageArg> for TlsStage {
    fn from(stage: StageArg) -> Self {
        match stage {
            StageArg::ClientHello => TlsStage::ClientHello,
            StageArg::NoSni => TlsStage::NoSni,
        }
    }
}

/// Load and compile a policy file
///
/// Conflicts come back as an error listing every pair.
pub fn load_graph(path: &Path) -> Result<DecisionGraph> {
    let set = PolicySet::load(path).with_context(|| format!("Failed to load policies from {}", path.display()))?;
    let graph = set.compile()?;
    Ok(graph)
}

/// Execute policy command
pub fn execute(args: PolicyArgs) -> Result<()> {
    match args.action {
        PolicyAction::Check {
            file,
            udp443,
            tls,
            stage,
            sni,
        } => check(&file, udp443, tls, stage.into(), sni.as_deref()),
    }
}

fn check(
    file: &Path,
    udp443: Option<IpAddr>,
    tls: Option<IpAddr>,
    stage: TlsStage,
    sni: Option<&str>,
) -> Result<()> {
    let set = PolicySet::load(file).with_context(|| format!("Failed to load policies from {}", file.display()))?;
    let graph = match set.compile() {
        Ok(graph) => graph,
        Err(err) if !err.invalid.is_empty() => {
            println!("{} {} invalid condition(s)", "✗".red(), err.invalid.len());
            for line in &err.invalid {
                println!("  {line}");
            }
            return Err(err.into());
        }
        Err(err) => {
            println!("{} {} conflict(s)", "✗".red(), err.conflicts.len());
            for conflict in &err.conflicts {
                println!("  {conflict}");
            }
            return Err(err.into());
        }
    };

    println!("{} {} policies compiled into {} keys", "✓".green(), graph.len(), graph.key_count());
    for policy in graph.policies() {
        println!("  {policy}");
    }

    if let Some(ip) = udp443 {
        print_probe(&format!("UDP/443 -> {ip}"), graph.evaluate_udp443(ip));
    }
    if let Some(ip) = tls {
        print_probe(
            &format!("TCP/443 {stage} -> {ip}"),
            graph.evaluate_tcp443_client_hello(ip, stage, sni),
        );
    }
    Ok(())
}

fn print_probe(label: &str, hit: Option<&FlowPolicy>) {
    match hit {
        Some(policy) => println!("{label}: {} ({})", policy.id.bold(), policy.action),
        None => println!("{label}: no policy"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIC_OFF: &str = r#"
[[policy]]
id = "quic-off"
priority = 10
action = { kind = "Strategy", strategy_id = "drop_udp_443" }
match = { proto = "Udp", port = 443 }
"#;

    const CONFLICTING: &str = r#"
[[policy]]
id = "pass-quic"
action = { kind = "Pass" }
match = { proto = "Udp", port = 443 }

[[policy]]
id = "block-quic"
action = { kind = "Block" }
match = { proto = "Udp", port = 443 }
"#;

    fn write(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_graph_and_probe() {
        let (_dir, path) = write(QUIC_OFF);
        let graph = load_graph(&path).unwrap();
        assert_eq!(graph.len(), 1);

        let hit = graph.evaluate_udp443("203.0.113.9".parse().unwrap()).unwrap();
        assert_eq!(hit.id, "quic-off");
        assert!(check(&path, Some("203.0.113.9".parse().unwrap()), None, TlsStage::ClientHello, None).is_ok());
    }

    #[test]
    fn test_conflicts_fail_check() {
        let (_dir, path) = write(CONFLICTING);
        let err = load_graph(&path).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("pass-quic"));
        assert!(message.contains("block-quic"));
        assert!(check(&path, None, None, TlsStage::ClientHello, None).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(load_graph(Path::new("/nope/policies.toml")).is_err());
    }

    #[test]
    fn test_stage_conversion() {
        assert_eq!(TlsStage::from(StageArg::NoSni), TlsStage::NoSni);
        assert_eq!(TlsStage::from(StageArg::ClientHello), TlsStage::ClientHello);
    }
}
