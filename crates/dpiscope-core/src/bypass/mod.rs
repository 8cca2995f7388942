//! Bypass execution
//!
//! [`TlsBypassOptions`] is the single value describing what the data path
//! does. [`BypassFilter`] executes it on the interception chain, optionally
//! deferring per-destination choices to a compiled [`DecisionGraph`]. The
//! apply pipeline only ever talks to the [`BypassEngine`] seam.
//!
//! [`DecisionGraph`]: crate::policy::DecisionGraph

mod engine;
mod filter;
mod options;
pub mod techniques;

pub use engine::{BypassEngine, InProcessBypassEngine};
#[cfg(test)]
pub use engine::MockBypassEngine;
pub use filter::{
    BypassFilter, BypassMetrics, BypassMetricsSnapshot, TlsMode, BYPASS_FILTER_NAME, PARAM_TLS_STRATEGY,
    STRATEGY_HTTP_HOST_TRICKS, STRATEGY_TLS_BYPASS, STRATEGY_TTL_TRICK,
};
pub use options::{TlsBypassOptions, DEFAULT_TTL_TRICK_VALUE};
