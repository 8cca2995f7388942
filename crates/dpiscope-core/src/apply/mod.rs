//! Applying bypass plans
//!
//! A call moves through `plan_build`, `apply_tls_options` and the optional
//! DoH step. Anything that goes wrong after the pre-apply snapshot, be it an
//! engine error, a cancellation or the deadline, restores that snapshot
//! before the error reaches the caller.

mod dns;
mod planned;
mod record;
mod service;

#[cfg(test)]
pub use dns::MockDnsController;
pub use dns::{DnsController, DnsFuture, DnsPreset, DNS_PRESETS};
pub use planned::{build_planned_state, PlannedState};
pub use record::{
    ApplyExecution, ApplyStatus, BypassApplyStateSnapshot, PhaseStatus, PhaseTiming, RollbackStatus,
};
pub use service::{ApplyError, ApplyOutcome, ApplyRequest, ApplyService};
