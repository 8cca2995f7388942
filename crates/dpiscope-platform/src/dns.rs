//! System resolver control through `netsh`
//!
//! Implements the core [`DnsController`] seam: point one adapter at a DNS
//! preset with DoH encryption registered for both resolvers, and put the
//! adapter back the way it was. The previous settings are read once, before
//! the first change, and kept until a successful restore.

use dpiscope_core::apply::{DnsController, DnsFuture, DnsPreset};
use dpiscope_core::Error;
use parking_lot::Mutex;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause after switching resolvers so the stack picks them up before DoH
/// registration
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Exit status and stdout of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status was zero
    pub success: bool,
    /// Captured stdout, lossily decoded
    pub stdout: String,
}

/// Future returned by [`CommandRunner::run`]
pub type CommandFuture = Pin<Box<dyn Future<Output = std::io::Result<CommandOutput>> + Send + 'static>>;

/// Runs an external program
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and collect its output
    fn run(&self, program: &str, args: Vec<String>) -> CommandFuture;
}

/// [`CommandRunner`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    fn run(&self, program: &str, args: Vec<String>) -> CommandFuture {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&args).kill_on_drop(true);
        Box::pin(async move {
            let out = cmd.output().await?;
            Ok(CommandOutput {
                success: out.status.success(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            })
        })
    }
}

/// Resolver configuration captured before the first change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavedDns {
    /// Resolvers came from DHCP
    Dhcp,
    /// Statically configured IPv4 resolvers, in order
    Static(Vec<Ipv4Addr>),
}

impl SavedDns {
    /// Interpret `netsh interface ipv4 show dns` output
    ///
    /// Anything that does not list a static resolver is treated as DHCP.
    pub fn parse(output: &str) -> Self {
        let statically = output.contains("Statically Configured") || output.contains("Настроено статически");
        if output.contains("DHCP") && !statically {
            return Self::Dhcp;
        }

        let servers: Vec<Ipv4Addr> = output
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect();
        if servers.is_empty() {
            Self::Dhcp
        } else {
            Self::Static(servers)
        }
    }
}

/// [`DnsController`] that drives `netsh` for one network adapter
pub struct NetshDnsController<R: CommandRunner = TokioCommandRunner> {
    adapter: Arc<str>,
    runner: Arc<R>,
    saved: Arc<Mutex<Option<SavedDns>>>,
}

impl NetshDnsController<TokioCommandRunner> {
    /// Controller for `adapter` (the interface name `netsh` knows)
    pub fn new(adapter: impl AsRef<str>) -> Self {
        Self::with_runner(adapter, TokioCommandRunner)
    }
}

impl<R: CommandRunner + 'static> NetshDnsController<R> {
    /// Controller using a custom command runner
    pub fn with_runner(adapter: impl AsRef<str>, runner: R) -> Self {
        Self {
            adapter: Arc::from(adapter.as_ref()),
            runner: Arc::new(runner),
            saved: Arc::new(Mutex::new(None)),
        }
    }

    /// Settings that a restore would bring back
    pub fn saved(&self) -> Option<SavedDns> {
        self.saved.lock().clone()
    }
}

async fn netsh<R: CommandRunner + ?Sized>(runner: &R, args: &[&str]) -> dpiscope_core::Result<CommandOutput> {
    let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
    debug!(?args, "netsh");
    runner
        .run("netsh", args)
        .await
        .map_err(|e| Error::Dns(format!("netsh could not run: {e}")))
}

async fn set_servers<R: CommandRunner + ?Sized>(runner: &R, adapter: &str, servers: &[String]) -> dpiscope_core::Result<()> {
    let name = format!("name={adapter}");
    let Some((primary, rest)) = servers.split_first() else {
        return Err(Error::Dns("no resolver to set".into()));
    };

    let out = netsh(runner, &["interface", "ipv4", "set", "dns", name.as_str(), "static", primary.as_str()]).await?;
    if !out.success {
        return Err(Error::Dns(format!("could not set {primary} on {adapter}")));
    }
    for (i, server) in rest.iter().enumerate() {
        let index = format!("index={}", i + 2);
        let out = netsh(runner, &["interface", "ipv4", "add", "dns", name.as_str(), server.as_str(), index.as_str()]).await?;
        if !out.success {
            warn!(server = %server, adapter, "could not add secondary resolver");
        }
    }
    Ok(())
}

async fn enable_encryption<R: CommandRunner + ?Sized>(runner: &R, server: &str, template: &str) {
    let server_arg = format!("server={server}");
    // Stale registration would make the add fail
    let _ = netsh(runner, &["dns", "delete", "encryption", server_arg.as_str()]).await;

    let template_arg = format!("dohtemplate={template}");
    match netsh(
        runner,
        &["dns", "add", "encryption", server_arg.as_str(), template_arg.as_str(), "autoupgrade=yes", "udpfallback=no"],
    )
    .await
    {
        Ok(out) if out.success => debug!(server, template, "DoH template registered"),
        Ok(out) => warn!(server, output = %out.stdout.trim(), "DoH registration rejected"),
        Err(e) => warn!(server, error = %e, "DoH registration failed"),
    }
}

async fn flush_cache<R: CommandRunner + ?Sized>(runner: &R) {
    if let Err(e) = runner.run("ipconfig", vec!["/flushdns".to_string()]).await {
        warn!(error = %e, "DNS cache flush failed");
    }
}

impl<R: CommandRunner + 'static> DnsController for NetshDnsController<R> {
    fn enable_doh(&self, preset: &str) -> DnsFuture {
        let preset = DnsPreset::resolve(preset);
        let adapter = Arc::clone(&self.adapter);
        let runner = Arc::clone(&self.runner);
        let saved = Arc::clone(&self.saved);

        Box::pin(async move {
            let needs_backup = saved.lock().is_none();
            if needs_backup {
                let name = format!("name={adapter}");
                let out = netsh(runner.as_ref(), &["interface", "ipv4", "show", "dns", name.as_str()]).await?;
                if !out.success {
                    return Err(Error::Dns(format!("could not read resolvers of {adapter}")));
                }
                let previous = SavedDns::parse(&out.stdout);
                info!(adapter = %adapter, previous = ?previous, "saved resolver settings");
                *saved.lock() = Some(previous);
            }

            let servers = [preset.primary_ip.to_string(), preset.secondary_ip.to_string()];
            set_servers(runner.as_ref(), &adapter, &servers).await?;
            tokio::time::sleep(SETTLE_DELAY).await;

            enable_encryption(runner.as_ref(), preset.primary_ip, preset.primary_doh).await;
            enable_encryption(runner.as_ref(), preset.secondary_ip, preset.secondary_doh).await;
            flush_cache(runner.as_ref()).await;

            info!(adapter = %adapter, preset = preset.name, "DoH enabled");
            Ok(())
        })
    }

    fn restore(&self) -> DnsFuture {
        let adapter = Arc::clone(&self.adapter);
        let runner = Arc::clone(&self.runner);
        let saved = Arc::clone(&self.saved);

        Box::pin(async move {
            let previous = saved.lock().clone();
            let Some(previous) = previous else {
                return Err(Error::Dns("no saved resolver settings".into()));
            };

            match &previous {
                SavedDns::Dhcp => {
                    let name = format!("name={adapter}");
                    let out = netsh(runner.as_ref(), &["interface", "ipv4", "set", "dns", name.as_str(), "source=dhcp"]).await?;
                    if !out.success {
                        return Err(Error::Dns(format!("could not switch {adapter} back to DHCP")));
                    }
                }
                SavedDns::Static(servers) => {
                    let servers: Vec<String> = servers.iter().map(ToString::to_string).collect();
                    set_servers(runner.as_ref(), &adapter, &servers).await?;
                }
            }
            flush_cache(runner.as_ref()).await;

            *saved.lock() = None;
            info!(adapter = %adapter, restored = ?previous, "resolver settings restored");
            Ok(())
        })
    }
}
