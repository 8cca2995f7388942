//! Packet interception chain
//!
//! Every captured packet walks an ordered list of [`PacketFilter`]s. A filter
//! may inspect the packet, rewrite it in place, queue extra packets for
//! injection, or veto it. The first veto stops the walk and the packet is not
//! re-injected. A filter that returns `Err` is treated as having passed the
//! packet, so a single broken filter cannot black-hole traffic.
//!
//! Registration swaps an immutable `Arc<[..]>` snapshot under a lock; the
//! receive loop clones the `Arc` once per packet and never holds the lock
//! while filters run.

mod context;

pub use context::{ChainStats, ChainStatsSnapshot, FilterContext};

use crate::error::Result;
use crate::packet::{Direction, Packet};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{instrument, trace, warn};

/// Minimum spacing between two error logs for the same filter
pub const FILTER_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Decision returned by a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Continue with the next filter
    Pass,
    /// Stop and do not re-inject the packet
    Drop,
}

/// A stage of the interception chain
pub trait PacketFilter: Send + Sync {
    /// Unique name, used for removal and error logging
    fn name(&self) -> &str;

    /// Higher runs first
    fn priority(&self) -> i32 {
        0
    }

    /// Inspect and optionally mutate one packet
    fn process(&self, packet: &mut Packet, ctx: &mut FilterContext) -> Result<FilterVerdict>;
}

/// Result of running one packet through the chain
#[derive(Debug)]
pub struct ChainOutcome {
    /// Final verdict
    pub verdict: FilterVerdict,
    /// Packets queued by filters, to be sent before the original
    pub injected: Vec<Packet>,
    /// Whether the original packet bytes were changed
    pub modified: bool,
}

/// Packets to put back on the wire for one captured buffer, in send order
#[derive(Debug, Default)]
pub struct Reinjection {
    /// Buffers to send
    pub packets: Vec<Bytes>,
    /// The original packet was vetoed
    pub dropped: bool,
}

/// Ordered, hot-swappable set of packet filters
pub struct FilterChain {
    filters: RwLock<Arc<[Arc<dyn PacketFilter>]>>,
    registration: Mutex<()>,
    last_error_log: Mutex<HashMap<String, Instant>>,
    stats: ChainStats,
}

impl FilterChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(Arc::from(Vec::new())),
            registration: Mutex::new(()),
            last_error_log: Mutex::new(HashMap::new()),
            stats: ChainStats::default(),
        }
    }

    fn rebuild(&self, f: impl FnOnce(&mut Vec<Arc<dyn PacketFilter>>)) {
        let _guard = self.registration.lock();
        let mut next: Vec<Arc<dyn PacketFilter>> = self.filters.read().iter().cloned().collect();
        f(&mut next);
        // Stable sort keeps registration order among equal priorities.
        next.sort_by_key(|flt| std::cmp::Reverse(flt.priority()));
        *self.filters.write() = Arc::from(next);
    }

    /// Add a filter; a filter with the same name is replaced
    pub fn register(&self, filter: Arc<dyn PacketFilter>) {
        let name = filter.name().to_string();
        self.rebuild(|list| {
            list.retain(|f| f.name() != name);
            list.push(filter);
        });
        trace!(filter = %name, "filter registered");
    }

    /// Remove a filter by name; returns whether one was removed
    pub fn remove(&self, name: &str) -> bool {
        let mut removed = false;
        self.rebuild(|list| {
            let before = list.len();
            list.retain(|f| f.name() != name);
            removed = list.len() != before;
        });
        removed
    }

    /// Remove every filter
    pub fn clear(&self) {
        self.rebuild(Vec::clear);
    }

    /// Number of registered filters
    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    /// Whether no filter is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Filter names in execution order
    pub fn names(&self) -> Vec<String> {
        self.filters.read().iter().map(|f| f.name().to_string()).collect()
    }

    /// Chain counters
    pub fn stats(&self) -> ChainStatsSnapshot {
        self.stats.snapshot()
    }

    fn snapshot(&self) -> Arc<[Arc<dyn PacketFilter>]> {
        Arc::clone(&self.filters.read())
    }

    fn log_filter_error(&self, name: &str, err: &crate::Error, now: Instant) {
        self.stats.record_filter_error();
        let mut last = self.last_error_log.lock();
        let due = last
            .get(name)
            .map_or(true, |at| now.duration_since(*at) >= FILTER_ERROR_LOG_INTERVAL);
        if due {
            last.insert(name.to_string(), now);
            warn!(filter = %name, error = %err, "filter failed; passing packet through");
        }
    }

    /// Run one parsed packet through every filter
    #[instrument(level = "trace", skip(self, packet), fields(
        direction = ?packet.direction,
        protocol = %packet.protocol,
        dst_port = packet.dst_port
    ))]
    pub fn process(&self, packet: &mut Packet, now: Instant) -> ChainOutcome {
        let started = Instant::now();
        let mut ctx = FilterContext::new(now);
        let mut verdict = FilterVerdict::Pass;

        for filter in self.snapshot().iter() {
            match filter.process(packet, &mut ctx) {
                Ok(FilterVerdict::Pass) => {}
                Ok(FilterVerdict::Drop) => {
                    trace!(filter = filter.name(), "packet vetoed");
                    verdict = FilterVerdict::Drop;
                    break;
                }
                Err(err) => self.log_filter_error(filter.name(), &err, now),
            }
        }

        let injected = ctx.take_injected();
        self.stats
            .record(verdict == FilterVerdict::Drop, injected.len(), started.elapsed(), now);
        ChainOutcome {
            verdict,
            injected,
            modified: ctx.is_modified(),
        }
    }

    /// Parse a captured buffer, run the chain, and produce the buffers to
    /// re-inject.
    ///
    /// Unparseable input is passed through byte-for-byte. Modified and
    /// injected packets get fresh checksums.
    pub fn process_raw(&self, data: &[u8], direction: Direction, now: Instant) -> Reinjection {
        let mut packet = match Packet::from_bytes(data, direction) {
            Ok(p) => p,
            Err(err) => {
                self.stats.record_parse_error();
                trace!(error = %err, head = %hex::encode(&data[..data.len().min(24)]), "unparseable packet passed through");
                return Reinjection {
                    packets: vec![Bytes::copy_from_slice(data)],
                    dropped: false,
                };
            }
        };

        let outcome = self.process(&mut packet, now);
        let mut packets = Vec::with_capacity(outcome.injected.len() + 1);
        for mut extra in outcome.injected {
            if !extra.checksums_frozen() {
                extra.recalculate_checksums();
            }
            packets.push(extra.to_bytes());
        }
        let dropped = outcome.verdict == FilterVerdict::Drop;
        if !dropped {
            if outcome.modified {
                packet.recalculate_checksums();
            }
            packets.push(packet.to_bytes());
        }
        Reinjection { packets, dropped }
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBuilder;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named {
        name: &'static str,
        priority: i32,
        verdict: FilterVerdict,
        calls: AtomicUsize,
    }

    impl Named {
        fn new(name: &'static str, priority: i32, verdict: FilterVerdict) -> Arc<Self> {
            Arc::new(Self {
                name,
                priority,
                verdict,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl PacketFilter for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn process(&self, _packet: &mut Packet, _ctx: &mut FilterContext) -> Result<FilterVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict)
        }
    }

    struct Failing;

    impl PacketFilter for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn priority(&self) -> i32 {
            100
        }

        fn process(&self, _packet: &mut Packet, _ctx: &mut FilterContext) -> Result<FilterVerdict> {
            Err(Error::filter("failing", "boom"))
        }
    }

    fn raw_packet() -> Vec<u8> {
        PacketBuilder::tcp_v4()
            .src_ip_v4([10, 0, 0, 1])
            .dst_ip_v4([93, 184, 216, 34])
            .dst_port(443)
            .payload(b"data")
            .build()
    }

    // ====== Ordering Tests ======

    #[test]
    fn test_filters_sorted_by_priority_desc() {
        let chain = FilterChain::new();
        chain.register(Named::new("low", 1, FilterVerdict::Pass));
        chain.register(Named::new("high", 50, FilterVerdict::Pass));
        chain.register(Named::new("mid", 10, FilterVerdict::Pass));
        assert_eq!(chain.names(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_register_same_name_replaces() {
        let chain = FilterChain::new();
        chain.register(Named::new("x", 1, FilterVerdict::Pass));
        chain.register(Named::new("x", 2, FilterVerdict::Drop));
        assert_eq!(chain.len(), 1);
        assert!(chain.remove("x"));
        assert!(!chain.remove("x"));
        assert!(chain.is_empty());
    }

    // ====== Verdict Tests ======

    #[test]
    fn test_first_drop_stops_chain() {
        let chain = FilterChain::new();
        let dropper = Named::new("dropper", 10, FilterVerdict::Drop);
        let after = Named::new("after", 1, FilterVerdict::Pass);
        chain.register(dropper.clone());
        chain.register(after.clone());

        let out = chain.process_raw(&raw_packet(), Direction::Outbound, Instant::now());
        assert!(out.dropped);
        assert!(out.packets.is_empty());
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.stats().dropped, 1);
    }

    #[test]
    fn test_filter_error_treated_as_pass() {
        let chain = FilterChain::new();
        let next = Named::new("next", 1, FilterVerdict::Pass);
        chain.register(Arc::new(Failing));
        chain.register(next.clone());

        let raw = raw_packet();
        let out = chain.process_raw(&raw, Direction::Outbound, Instant::now());
        assert!(!out.dropped);
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0].as_ref(), raw.as_slice());
        assert_eq!(next.calls.load(Ordering::SeqCst), 1);
        assert_eq!(chain.stats().filter_errors, 1);
    }

    #[test]
    fn test_unparseable_passes_through_unmodified() {
        let chain = FilterChain::new();
        let spy = Named::new("spy", 1, FilterVerdict::Drop);
        chain.register(spy.clone());

        let garbage = [0x45u8, 0x00, 0xFF];
        let out = chain.process_raw(&garbage, Direction::Inbound, Instant::now());
        assert!(!out.dropped);
        assert_eq!(out.packets[0].as_ref(), &garbage);
        assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.stats().parse_errors, 1);
    }
}
