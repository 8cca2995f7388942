//! Transactional apply with rollback

use super::dns::DnsController;
use super::planned::{build_planned_state, PlannedState};
use super::record::{
    ApplyExecution, ApplyStatus, BypassApplyStateSnapshot, PhaseStatus, PhaseTracker, RollbackStatus,
};
use crate::bypass::BypassEngine;
use crate::config::ApplyConfig;
use crate::progress::{emit, ProgressSink};
use crate::strategy::BypassPlan;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Per-call inputs besides the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    /// Soft deadline; `None` or zero means none
    pub timeout: Option<Duration>,
    /// DoH currently active
    pub doh_enabled: bool,
    /// DNS preset currently selected
    pub dns_preset: String,
    /// Consent for system DNS changes
    pub allow_dns_changes: bool,
}

impl ApplyRequest {
    /// Request with timeout and consent taken from `cfg`
    pub fn from_config(cfg: &ApplyConfig, doh_enabled: bool, dns_preset: impl Into<String>) -> Self {
        Self {
            timeout: Some(cfg.timeout()),
            doh_enabled,
            dns_preset: dns_preset.into(),
            allow_dns_changes: cfg.allow_dns_changes,
        }
    }
}

/// Successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// State now in force
    pub planned: PlannedState,
    /// Phase trail
    pub execution: ApplyExecution,
}

/// Why an apply call did not complete
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The caller canceled; state was rolled back
    #[error("bypass apply canceled (rollback {:?})", .0.rollback_status)]
    Canceled(Box<ApplyExecution>),

    /// The deadline passed; state was rolled back
    #[error("bypass apply timed out (rollback {:?})", .0.rollback_status)]
    TimedOut(Box<ApplyExecution>),

    /// Applying the core options failed; state was rolled back
    #[error("bypass apply failed: {source}")]
    Failed {
        /// Execution record
        execution: Box<ApplyExecution>,
        /// Original error
        #[source]
        source: crate::Error,
    },

    /// Another apply on the same engine is in progress
    #[error("another bypass apply is in progress")]
    Busy(Box<ApplyExecution>),
}

impl ApplyError {
    /// Execution record of the failed call
    pub fn execution(&self) -> &ApplyExecution {
        match self {
            Self::Canceled(e) | Self::TimedOut(e) | Self::Busy(e) => e,
            Self::Failed { execution, .. } => execution,
        }
    }
}

enum Failure {
    Interrupted,
    Core(crate::Error),
}

/// Cancels the linked token when the deadline passes; disarmed on drop
struct Deadline(JoinHandle<()>);

impl Deadline {
    fn arm(token: CancellationToken, after: Duration) -> Self {
        Self(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        }))
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Touched {
    options: bool,
    dns: bool,
}

fn checkpoint(token: &CancellationToken) -> Result<(), Failure> {
    if token.is_cancelled() {
        Err(Failure::Interrupted)
    } else {
        Ok(())
    }
}

async fn guarded<T>(fut: impl Future<Output = T>, token: &CancellationToken) -> Result<T, Failure> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Failure::Interrupted),
        out = fut => Ok(out),
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Applies bypass plans to one engine, one call at a time.
///
/// Every call snapshots the engine first. A core failure, a cancellation or
/// a timeout after that point restores the snapshot before the error is
/// returned; DoH changes are best-effort and never trigger a rollback on
/// their own.
pub struct ApplyService {
    engine: Arc<dyn BypassEngine>,
    dns: Option<Arc<dyn DnsController>>,
    serial: tokio::sync::Mutex<()>,
}

impl ApplyService {
    /// Service over `engine`; without `dns` every DoH step is skipped
    pub fn new(engine: Arc<dyn BypassEngine>, dns: Option<Arc<dyn DnsController>>) -> Self {
        Self {
            engine,
            dns,
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// The engine being driven
    pub fn engine(&self) -> &Arc<dyn BypassEngine> {
        &self.engine
    }

    /// Apply `plan`, rolling back to the pre-call state on failure.
    ///
    /// `cancel` is observed between every step; the request timeout cancels a
    /// child of it. Concurrent calls are rejected with [`ApplyError::Busy`].
    #[instrument(level = "debug", skip_all, fields(diagnosis = %plan.for_diagnosis, confidence = plan.plan_confidence))]
    pub async fn apply_plan_with_rollback(
        &self,
        plan: &BypassPlan,
        request: ApplyRequest,
        cancel: &CancellationToken,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let before = BypassApplyStateSnapshot {
            options: self.engine.current_options(),
            doh_enabled: request.doh_enabled,
            dns_preset: request.dns_preset.trim().to_string(),
        };

        let Ok(_serial) = self.serial.try_lock() else {
            warn!("apply rejected: another apply is in progress");
            emit(progress, "[APPLY] Rejected: another apply is in progress");
            let exec = PhaseTracker::new().into_execution(ApplyStatus::Busy, None, RollbackStatus::NotNeeded, before, None);
            return Err(ApplyError::Busy(Box::new(exec)));
        };

        let strategies = if plan.strategies.is_empty() {
            "(none)".to_string()
        } else {
            plan.strategies.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(", ")
        };
        emit(
            progress,
            &format!(
                "[APPLY] Apply requested: diagnosis={} conf={}% strategies={strategies}",
                plan.for_diagnosis, plan.plan_confidence
            ),
        );
        if !plan.reasoning.is_empty() {
            emit(progress, &format!("[APPLY] Reasoning: {}", plan.reasoning));
        }
        let timeout = request.timeout.filter(|t| !t.is_zero());
        emit(
            progress,
            &format!(
                "[APPLY] Timeout={}; before={before}",
                timeout.map_or_else(|| "none".to_string(), |t| format!("{:.2}s", t.as_secs_f64()))
            ),
        );

        let linked = cancel.child_token();
        let _deadline = timeout.map(|t| Deadline::arm(linked.clone(), t));
        let mut tracker = PhaseTracker::new();
        let mut touched = Touched::default();

        let result = self
            .run(plan, &strategies, &request, &before, &linked, &mut tracker, &mut touched, progress)
            .await;

        match result {
            Ok(planned) => {
                emit(
                    progress,
                    &format!(
                        "[APPLY] Apply complete: after={}; DoH={}; DNS={}",
                        planned.options.to_readable_strategy(),
                        on_off(planned.doh_enabled),
                        planned.dns_preset
                    ),
                );
                let execution =
                    tracker.into_execution(ApplyStatus::Applied, None, RollbackStatus::NotNeeded, before, None);
                info!(elapsed_ms = execution.total_elapsed_ms, "bypass plan applied");
                Ok(ApplyOutcome { planned, execution })
            }
            Err(failure) => {
                let current_phase = tracker.current();
                let (status, error, reason) = match failure {
                    Failure::Interrupted if cancel.is_cancelled() => (ApplyStatus::Canceled, None, "cancel".to_string()),
                    Failure::Interrupted => (ApplyStatus::TimedOut, None, "timeout".to_string()),
                    Failure::Core(e) => {
                        let text = e.to_string();
                        (ApplyStatus::Failed, Some(e), text)
                    }
                };
                let phase_status = if status == ApplyStatus::Failed {
                    PhaseStatus::Failed
                } else {
                    PhaseStatus::Canceled
                };
                tracker.finish(phase_status, &reason);
                warn!(?status, reason = %reason, phase = ?current_phase, "apply aborted; rolling back");
                emit(progress, &format!("[APPLY] Apply {reason}; rollback to: {before}"));

                let rollback_status = if touched.options || touched.dns {
                    self.rollback(&before, touched.dns, &mut tracker, progress).await
                } else {
                    emit(progress, "[APPLY] Rollback skipped: nothing was applied");
                    RollbackStatus::NotNeeded
                };
                emit(progress, &format!("[APPLY] Rollback complete ({rollback_status:?})"));

                let execution = Box::new(tracker.into_execution(
                    status,
                    error.as_ref().map(ToString::to_string),
                    rollback_status,
                    before,
                    current_phase,
                ));
                Err(match (status, error) {
                    (ApplyStatus::Canceled, _) => ApplyError::Canceled(execution),
                    (ApplyStatus::TimedOut, _) => ApplyError::TimedOut(execution),
                    (_, Some(source)) => ApplyError::Failed { execution, source },
                    (_, None) => ApplyError::Failed {
                        execution,
                        source: crate::Error::Engine(reason),
                    },
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        plan: &BypassPlan,
        strategies: &str,
        request: &ApplyRequest,
        before: &BypassApplyStateSnapshot,
        token: &CancellationToken,
        tracker: &mut PhaseTracker,
        touched: &mut Touched,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<PlannedState, Failure> {
        checkpoint(token)?;

        tracker.start("plan_build", &format!("strategies={strategies}"));
        let mut planned = build_planned_state(before, plan, progress);
        tracker.finish(PhaseStatus::Ok, "");
        emit(
            progress,
            &format!(
                "[APPLY] Target={}; DoH={}; DNS={}",
                planned.options.to_readable_strategy(),
                on_off(planned.doh_enabled),
                planned.dns_preset
            ),
        );
        checkpoint(token)?;

        tracker.start("apply_tls_options", "");
        emit(progress, "[APPLY] Applying bypass options...");
        // A failing engine may have changed something already
        touched.options = true;
        self.engine.apply_options(&planned.options).map_err(Failure::Core)?;
        tracker.finish(PhaseStatus::Ok, "");
        emit(progress, "[APPLY] Bypass options applied");
        checkpoint(token)?;

        let mut doh_after = before.doh_enabled;
        if planned.doh_enabled != before.doh_enabled {
            let direction = if planned.doh_enabled { "enable" } else { "disable" };
            match self.dns.as_ref().filter(|_| request.allow_dns_changes) {
                Some(dns) => {
                    tracker.start("apply_doh", &format!("direction={direction} preset={}", planned.dns_preset));
                    emit(progress, &format!("[APPLY] Applying DoH ({direction})"));
                    touched.dns = true;
                    let op = if planned.doh_enabled {
                        dns.enable_doh(&planned.dns_preset)
                    } else {
                        dns.restore()
                    };
                    match guarded(op, token).await? {
                        Ok(()) => {
                            doh_after = planned.doh_enabled;
                            tracker.finish(PhaseStatus::Ok, "");
                            emit(progress, &format!("[DoH] DoH {}", if doh_after { "enabled" } else { "disabled" }));
                        }
                        Err(e) => {
                            doh_after = false;
                            warn!(error = %e, direction, "DoH change failed; continuing");
                            tracker.finish(PhaseStatus::Failed, &e.to_string());
                            emit(progress, &format!("[DoH] Failed: {e}"));
                        }
                    }
                    checkpoint(token)?;
                }
                None => {
                    let reason = if request.allow_dns_changes { "no_controller" } else { "no_consent" };
                    tracker.start("apply_doh_skipped", &format!("reason={reason} direction={direction}"));
                    tracker.finish(PhaseStatus::Skipped, reason);
                    emit(progress, &format!("[APPLY] DoH/DNS skipped: {reason} (direction={direction})"));
                }
            }
        }
        planned.doh_enabled = doh_after;
        Ok(planned)
    }

    async fn rollback(
        &self,
        before: &BypassApplyStateSnapshot,
        dns_touched: bool,
        tracker: &mut PhaseTracker,
        progress: Option<&dyn ProgressSink>,
    ) -> RollbackStatus {
        let mut ok = true;

        tracker.start("rollback_tls_options", "");
        match self.engine.apply_options(&before.options) {
            Ok(()) => tracker.finish(PhaseStatus::Ok, ""),
            Err(e) => {
                ok = false;
                warn!(error = %e, "rollback of bypass options failed");
                tracker.finish(PhaseStatus::Failed, &e.to_string());
            }
        }

        if let Some(dns) = self.dns.as_ref().filter(|_| dns_touched) {
            tracker.start("rollback_dns", "");
            let op = if before.doh_enabled {
                dns.enable_doh(&before.dns_preset)
            } else {
                dns.restore()
            };
            match op.await {
                Ok(()) => tracker.finish(PhaseStatus::Ok, ""),
                Err(e) => {
                    ok = false;
                    warn!(error = %e, "rollback of DNS settings failed");
                    tracker.finish(PhaseStatus::Failed, &e.to_string());
                }
            }
        }

        let status = if ok { RollbackStatus::Done } else { RollbackStatus::Failed };
        if !ok {
            emit(progress, "[APPLY] Rollback incomplete; state may differ from the snapshot");
        }
        status
    }
}
