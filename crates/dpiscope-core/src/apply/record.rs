//! Execution records of an apply call

use crate::bypass::TlsBypassOptions;
use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// State captured before an apply; the rollback target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BypassApplyStateSnapshot {
    /// Bypass options in force
    pub options: TlsBypassOptions,
    /// DoH active
    pub doh_enabled: bool,
    /// Selected DNS preset name
    pub dns_preset: String,
}

impl fmt::Display for BypassApplyStateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; DoH={}; DNS={}",
            self.options.to_readable_strategy(),
            if self.doh_enabled { "on" } else { "off" },
            self.dns_preset
        )
    }
}

/// Outcome of one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    /// Phase began (only recorded when it carries details)
    Start,
    /// Finished
    Ok,
    /// Finished with an error
    Failed,
    /// Deliberately not executed
    Skipped,
    /// Interrupted by cancellation or timeout
    Canceled,
    /// Another phase started before this one finished
    Abandoned,
}

/// One entry of the phase trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    /// Phase name, e.g. `apply_tls_options`
    pub name: String,
    /// Outcome
    pub status: PhaseStatus,
    /// Time spent in the phase
    pub elapsed_ms: u64,
    /// Free-form details
    pub details: String,
}

/// Final status of an apply call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyStatus {
    /// Everything applied
    Applied,
    /// Canceled by the caller
    Canceled,
    /// Deadline passed
    TimedOut,
    /// Core apply failed
    Failed,
    /// Another apply was running
    Busy,
}

/// Whether the pre-apply state had to be restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStatus {
    /// Nothing was changed, or nothing failed
    NotNeeded,
    /// Restored
    Done,
    /// Restoring failed at least partially
    Failed,
}

/// Everything known about one apply call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyExecution {
    /// Final status
    pub status: ApplyStatus,
    /// Error text for failures
    pub error: Option<String>,
    /// Rollback outcome
    pub rollback_status: RollbackStatus,
    /// State before the call
    pub before: BypassApplyStateSnapshot,
    /// Phase running when the call ended abnormally
    pub current_phase: Option<String>,
    /// Phase trail
    pub phases: Vec<PhaseTiming>,
    /// Wall time of the whole call
    pub total_elapsed_ms: u64,
}

fn millis_since(at: Instant) -> u64 {
    u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Records phase timings; at most one phase is open at a time
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    phases: Vec<PhaseTiming>,
    started: Instant,
    current: Option<(String, Instant)>,
}

impl PhaseTracker {
    pub(crate) fn new() -> Self {
        Self {
            phases: Vec::new(),
            started: Instant::now(),
            current: None,
        }
    }

    pub(crate) fn start(&mut self, name: &str, details: &str) {
        if self.current.is_some() {
            self.finish(PhaseStatus::Abandoned, "phase switched without finish");
        }
        if !details.is_empty() {
            self.phases.push(PhaseTiming {
                name: name.to_string(),
                status: PhaseStatus::Start,
                elapsed_ms: 0,
                details: details.to_string(),
            });
        }
        self.current = Some((name.to_string(), Instant::now()));
    }

    pub(crate) fn finish(&mut self, status: PhaseStatus, details: &str) {
        if let Some((name, at)) = self.current.take() {
            self.phases.push(PhaseTiming {
                name,
                status,
                elapsed_ms: millis_since(at),
                details: details.to_string(),
            });
        }
    }

    pub(crate) fn current(&self) -> Option<String> {
        self.current.as_ref().map(|(name, _)| name.clone())
    }

    pub(crate) fn into_execution(
        self,
        status: ApplyStatus,
        error: Option<String>,
        rollback_status: RollbackStatus,
        before: BypassApplyStateSnapshot,
        current_phase: Option<String>,
    ) -> ApplyExecution {
        ApplyExecution {
            status,
            error,
            rollback_status,
            before,
            current_phase,
            total_elapsed_ms: millis_since(self.started),
            phases: self.phases,
        }
    }
}
