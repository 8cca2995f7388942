//! Seam between the apply pipeline and the live bypass filter

use super::filter::{BypassFilter, BypassMetricsSnapshot, BYPASS_FILTER_NAME};
use super::options::TlsBypassOptions;
use crate::error::Result;
use crate::intercept::{FilterChain, PacketFilter};
use crate::policy::DecisionGraph;
use std::sync::Arc;
use tracing::info;

/// Something that can take a new [`TlsBypassOptions`] and report the one in
/// force.
#[cfg_attr(test, mockall::automock)]
pub trait BypassEngine: Send + Sync {
    /// Options currently in effect
    fn current_options(&self) -> TlsBypassOptions;

    /// Make `options` the options in effect
    fn apply_options(&self, options: &TlsBypassOptions) -> Result<()>;
}

/// [`BypassEngine`] backed by a [`BypassFilter`] on an in-process chain.
///
/// The filter sits on the chain only while some technique is enabled.
pub struct InProcessBypassEngine {
    filter: Arc<BypassFilter>,
    chain: Arc<FilterChain>,
}

impl InProcessBypassEngine {
    /// Wrap `filter`; nothing is registered until options are applied
    pub fn new(filter: Arc<BypassFilter>, chain: Arc<FilterChain>) -> Self {
        Self { filter, chain }
    }

    /// The wrapped filter
    pub fn filter(&self) -> &Arc<BypassFilter> {
        &self.filter
    }

    /// Swap the decision graph used by policy-driven paths
    pub fn set_decision_graph(&self, graph: Option<DecisionGraph>) {
        self.filter.set_decision_graph(graph.map(Arc::new));
    }

    /// Filter counters
    pub fn metrics(&self) -> BypassMetricsSnapshot {
        self.filter.metrics()
    }
}

impl BypassEngine for InProcessBypassEngine {
    fn current_options(&self) -> TlsBypassOptions {
        self.filter.options()
    }

    fn apply_options(&self, options: &TlsBypassOptions) -> Result<()> {
        let options = options.normalize();
        let active = options.is_any_enabled();
        info!(strategy = %options.to_readable_strategy(), sizes = %options.fragment_sizes_as_text(), "applying bypass options");
        self.filter.set_options(options);
        if active {
            self.chain.register(Arc::clone(&self.filter) as Arc<dyn PacketFilter>);
        } else {
            self.chain.remove(BYPASS_FILTER_NAME);
        }
        Ok(())
    }
}
