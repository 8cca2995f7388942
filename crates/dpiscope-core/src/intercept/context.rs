//! Per-packet filter context and chain statistics

use crate::packet::Packet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Scratch state handed to each filter while one packet walks the chain
#[derive(Debug)]
pub struct FilterContext {
    now: Instant,
    injected: Vec<Packet>,
    modified: bool,
}

impl FilterContext {
    /// Context stamped with the given receive time
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            injected: Vec::new(),
            modified: false,
        }
    }

    /// Receive time of the packet being processed
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Queue an extra packet to be sent ahead of the current one
    pub fn inject(&mut self, packet: Packet) {
        self.injected.push(packet);
    }

    /// Record that the current packet's bytes were changed
    pub fn mark_modified(&mut self) {
        self.modified = true;
    }

    /// Whether any filter changed the packet
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Number of packets queued so far
    pub fn injected_len(&self) -> usize {
        self.injected.len()
    }

    pub(crate) fn take_injected(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.injected)
    }
}

/// Point-in-time copy of [`ChainStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChainStatsSnapshot {
    /// Packets walked through the chain
    pub processed: u64,
    /// Packets vetoed by a filter
    pub dropped: u64,
    /// Extra packets queued by filters
    pub injected: u64,
    /// Filter `Err` returns (each treated as pass)
    pub filter_errors: u64,
    /// Raw buffers that failed to parse and were passed through untouched
    pub parse_errors: u64,
    /// Mean processing time over the last completed one-second window
    pub avg_process_micros: f64,
}

#[derive(Debug)]
struct PerfWindow {
    started: Instant,
    total: Duration,
    samples: u32,
}

/// Counters updated from the receive loop
#[derive(Debug)]
pub struct ChainStats {
    processed: AtomicU64,
    dropped: AtomicU64,
    injected: AtomicU64,
    filter_errors: AtomicU64,
    parse_errors: AtomicU64,
    avg_micros_bits: AtomicU64,
    window: Mutex<PerfWindow>,
}

impl Default for ChainStats {
    fn default() -> Self {
        Self {
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            injected: AtomicU64::new(0),
            filter_errors: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            avg_micros_bits: AtomicU64::new(0f64.to_bits()),
            window: Mutex::new(PerfWindow {
                started: Instant::now(),
                total: Duration::ZERO,
                samples: 0,
            }),
        }
    }
}

impl ChainStats {
    pub(crate) fn record(&self, dropped: bool, injected: usize, elapsed: Duration, now: Instant) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.injected.fetch_add(injected as u64, Ordering::Relaxed);

        let mut window = self.window.lock();
        window.total += elapsed;
        window.samples += 1;
        if now.duration_since(window.started) >= Duration::from_secs(1) {
            let avg = window.total.as_secs_f64() * 1_000_000.0 / f64::from(window.samples.max(1));
            self.avg_micros_bits.store(avg.to_bits(), Ordering::Relaxed);
            tracing::trace!(avg_micros = avg, samples = window.samples, "filter chain timing");
            window.started = now;
            window.total = Duration::ZERO;
            window.samples = 0;
        }
    }

    pub(crate) fn record_filter_error(&self) {
        self.filter_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values
    pub fn snapshot(&self) -> ChainStatsSnapshot {
        ChainStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            injected: self.injected.load(Ordering::Relaxed),
            filter_errors: self.filter_errors.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            avg_process_micros: f64::from_bits(self.avg_micros_bits.load(Ordering::Relaxed)),
        }
    }
}
