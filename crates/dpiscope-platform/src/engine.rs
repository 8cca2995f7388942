//! Traffic engine
//!
//! Owns the capture handle on a dedicated thread and runs every received
//! packet through the core [`FilterChain`]. The chain decides; the engine
//! only moves bytes: receive, process, reinject whatever the chain returns.

use crate::error::{PlatformError, Result};
use crate::traits::PacketCapture;
use dpiscope_core::intercept::{ChainStatsSnapshot, FilterChain};
use dpiscope_core::progress::{emit, ProgressSink};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Opening the capture handle slower than this is reported
pub const OPEN_SLOW: Duration = Duration::from_millis(500);
/// A full start slower than this is reported
pub const START_SLOW: Duration = Duration::from_millis(1500);
/// Waiting for the receive thread longer than this is reported
pub const STOP_SLOW: Duration = Duration::from_millis(3000);

/// The loop gives up after this many receive errors in a row
pub const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 100;

/// Counters updated by the receive thread
#[derive(Debug, Default)]
struct EngineStats {
    received: AtomicU64,
    reinjected: AtomicU64,
    dropped: AtomicU64,
    recv_errors: AtomicU64,
    send_errors: AtomicU64,
}

/// Point-in-time copy of the engine and chain counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineStatsSnapshot {
    /// Packets read from the handle
    pub received: u64,
    /// Buffers written back, injected ones included
    pub reinjected: u64,
    /// Captured packets the chain vetoed
    pub dropped: u64,
    /// Failed reads
    pub recv_errors: u64,
    /// Failed writes
    pub send_errors: u64,
    /// Filter chain counters and timing
    pub chain: ChainStatsSnapshot,
}

impl EngineStats {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self, chain: ChainStatsSnapshot) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            reinjected: self.reinjected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            chain,
        }
    }
}

struct Worker {
    thread: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

/// Receive loop driver for one capture handle
pub struct TrafficEngine {
    chain: Arc<FilterChain>,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl TrafficEngine {
    /// Engine driving `chain`
    pub fn new(chain: Arc<FilterChain>) -> Self {
        Self {
            chain,
            stats: Arc::new(EngineStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            progress: None,
        }
    }

    /// Report slow start/stop phases to `sink` as well as the log
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// The chain this engine feeds
    pub fn chain(&self) -> &Arc<FilterChain> {
        &self.chain
    }

    /// Whether the receive thread is alive
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Open a capture handle with `open` and start the receive thread
    ///
    /// # Errors
    /// Fails when already running, when `open` fails, or when the thread
    /// cannot be spawned.
    pub fn start<F>(&self, open: F) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn PacketCapture>>,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(PlatformError::EngineState("already running"));
        }

        let started = Instant::now();
        let capture = open()?;
        let open_elapsed = started.elapsed();
        if open_elapsed >= OPEN_SLOW {
            self.report_slow("capture open", open_elapsed);
        }

        self.stop.store(false, Ordering::Release);
        let (done_tx, done) = mpsc::channel();
        let chain = Arc::clone(&self.chain);
        let stop = Arc::clone(&self.stop);
        let stats = Arc::clone(&self.stats);
        let thread = thread::Builder::new()
            .name("dpiscope-capture".into())
            .spawn(move || {
                let mut capture = capture;
                pump(capture.as_mut(), &chain, &stop, &stats);
                if let Err(e) = capture.close() {
                    warn!(error = %e, "capture close failed");
                }
                let _ = done_tx.send(());
            })?;
        *worker = Some(Worker { thread, done });

        let total = started.elapsed();
        if total >= START_SLOW {
            self.report_slow("start", total);
        }
        info!(elapsed_ms = total.as_millis() as u64, filters = ?self.chain.names(), "traffic engine started");
        Ok(())
    }

    /// Signal the receive thread and wait for it to finish
    ///
    /// The loop notices the stop flag after its current read returns. When
    /// that takes longer than [`STOP_SLOW`] the thread is left to exit on
    /// its own.
    ///
    /// # Errors
    /// Fails when not running or when the receive thread panicked.
    pub fn stop(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Err(PlatformError::EngineState("not running"));
        };

        let started = Instant::now();
        self.stop.store(true, Ordering::Release);

        match worker.done.recv_timeout(STOP_SLOW) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                worker
                    .thread
                    .join()
                    .map_err(|_| PlatformError::CaptureError("capture thread panicked".into()))?;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.report_slow("stop", started.elapsed());
                warn!("receive thread still blocked; detaching");
            }
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            reinjected = stats.reinjected,
            dropped = stats.dropped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "traffic engine stopped"
        );
        Ok(())
    }

    /// Current counters
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot(self.chain.stats())
    }

    fn report_slow(&self, phase: &str, elapsed: Duration) {
        let line = format!(
            "[ENGINE][WARN] {phase} is slow: {}ms filters=[{}]",
            elapsed.as_millis(),
            self.chain.names().join(",")
        );
        warn!("{}", line);
        emit(self.progress.as_deref(), &line);
    }
}

impl Drop for TrafficEngine {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Receive, process and reinject until `stop` is set or the handle dies
fn pump(capture: &mut dyn PacketCapture, chain: &FilterChain, stop: &AtomicBool, stats: &EngineStats) {
    let mut consecutive_errors = 0u32;

    while !stop.load(Ordering::Acquire) {
        let captured = match capture.recv() {
            Ok(captured) => {
                consecutive_errors = 0;
                captured
            }
            Err(_) if stop.load(Ordering::Acquire) => break,
            Err(PlatformError::HandleError(msg)) => {
                error!(error = %msg, "capture handle lost");
                break;
            }
            Err(e) => {
                EngineStats::bump(&stats.recv_errors, 1);
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                    error!(error = %e, consecutive_errors, "giving up on capture handle");
                    break;
                }
                debug!(error = %e, "recv failed");
                continue;
            }
        };
        EngineStats::bump(&stats.received, 1);

        let out = chain.process_raw(&captured.data, captured.direction, Instant::now());
        if out.dropped {
            EngineStats::bump(&stats.dropped, 1);
        }

        // The original, when kept, is always last
        let original_at = (!out.dropped).then(|| out.packets.len().saturating_sub(1));
        for (i, buf) in out.packets.iter().enumerate() {
            let addr = if Some(i) == original_at {
                captured.address.clone()
            } else {
                captured.address.clone().as_impostor()
            };
            match capture.send(buf, &addr) {
                Ok(()) => EngineStats::bump(&stats.reinjected, 1),
                // Handle closed between recv and send
                Err(_) if stop.load(Ordering::Acquire) => return,
                Err(e) => {
                    EngineStats::bump(&stats.send_errors, 1);
                    debug!(error = %e, len = buf.len(), "send failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{CapturedPacket, MockPacketCapture, PacketAddress};
    use dpiscope_core::intercept::{FilterContext, FilterVerdict, PacketFilter};
    use dpiscope_core::packet::{Direction, Packet, PacketBuilder, TcpFlags};
    use std::sync::atomic::AtomicUsize;

    fn outbound_segment() -> Vec<u8> {
        PacketBuilder::tcp_v4()
            .src_ip_v4([192, 168, 1, 10])
            .dst_ip_v4([203, 0, 113, 7])
            .src_port(50000)
            .dst_port(443)
            .flags(TcpFlags::PSH | TcpFlags::ACK)
            .payload(b"hello")
            .build()
    }

    /// Mock that yields `packets` in order, then raises the stop flag
    fn scripted(packets: Vec<Vec<u8>>, stop: Arc<AtomicBool>) -> MockPacketCapture {
        let mut mock = MockPacketCapture::new();
        let calls = AtomicUsize::new(0);
        mock.expect_recv().returning(move || {
            let i = calls.fetch_add(1, Ordering::SeqCst);
            match packets.get(i) {
                Some(data) => Ok(CapturedPacket::new(data.clone(), Direction::Outbound)),
                None => {
                    stop.store(true, Ordering::SeqCst);
                    Err(PlatformError::CaptureError("drained".into()))
                }
            }
        });
        mock
    }

    struct DropAll;

    impl PacketFilter for DropAll {
        fn name(&self) -> &str {
            "drop-all"
        }

        fn process(&self, _packet: &mut Packet, _ctx: &mut FilterContext) -> dpiscope_core::Result<FilterVerdict> {
            Ok(FilterVerdict::Drop)
        }
    }

    /// Injects a copy ahead of the original
    struct Duplicate;

    impl PacketFilter for Duplicate {
        fn name(&self) -> &str {
            "duplicate"
        }

        fn process(&self, packet: &mut Packet, ctx: &mut FilterContext) -> dpiscope_core::Result<FilterVerdict> {
            ctx.inject(packet.clone());
            Ok(FilterVerdict::Pass)
        }
    }

    // ====== Receive Loop Tests ======

    #[test]
    fn test_pump_reinjects_unchanged_packet() {
        let stop = Arc::new(AtomicBool::new(false));
        let data = outbound_segment();
        let mut mock = scripted(vec![data.clone()], Arc::clone(&stop));
        mock.expect_send()
            .withf(move |buf: &[u8], addr: &PacketAddress| buf == data.as_slice() && addr.outbound && !addr.impostor)
            .times(1)
            .returning(|_, _| Ok(()));

        let chain = FilterChain::new();
        let stats = EngineStats::default();
        pump(&mut mock, &chain, &stop, &stats);

        let snap = stats.snapshot(chain.stats());
        assert_eq!((snap.received, snap.reinjected, snap.dropped), (1, 1, 0));
        assert_eq!(snap.recv_errors, 0);
    }

    #[test]
    fn test_pump_vetoed_packet_is_not_sent() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut mock = scripted(vec![outbound_segment(), outbound_segment()], Arc::clone(&stop));
        mock.expect_send().never();

        let chain = FilterChain::new();
        chain.register(Arc::new(DropAll));
        let stats = EngineStats::default();
        pump(&mut mock, &chain, &stop, &stats);

        let snap = stats.snapshot(chain.stats());
        assert_eq!((snap.received, snap.dropped, snap.reinjected), (2, 2, 0));
        assert_eq!(snap.chain.dropped, 2);
    }

    #[test]
    fn test_pump_marks_injected_packets_as_impostor() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut mock = scripted(vec![outbound_segment()], Arc::clone(&stop));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        mock.expect_send().times(2).returning(move |_, addr| {
            record.lock().push(addr.impostor);
            Ok(())
        });

        let chain = FilterChain::new();
        chain.register(Arc::new(Duplicate));
        let stats = EngineStats::default();
        pump(&mut mock, &chain, &stop, &stats);

        assert_eq!(*seen.lock(), [true, false]);
        assert_eq!(stats.snapshot(chain.stats()).reinjected, 2);
    }

    #[test]
    fn test_pump_counts_send_errors() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut mock = scripted(vec![outbound_segment()], Arc::clone(&stop));
        mock.expect_send()
            .times(1)
            .returning(|_, _| Err(PlatformError::InjectionError("queue full".into())));

        let chain = FilterChain::new();
        let stats = EngineStats::default();
        pump(&mut mock, &chain, &stop, &stats);

        let snap = stats.snapshot(chain.stats());
        assert_eq!((snap.reinjected, snap.send_errors), (0, 1));
    }

    #[test]
    fn test_pump_gives_up_after_repeated_errors() {
        let stop = AtomicBool::new(false);
        let mut mock = MockPacketCapture::new();
        mock.expect_recv()
            .times(MAX_CONSECUTIVE_RECV_ERRORS as usize)
            .returning(|| Err(PlatformError::CaptureError("bad read".into())));

        let chain = FilterChain::new();
        let stats = EngineStats::default();
        pump(&mut mock, &chain, &stop, &stats);
        assert_eq!(stats.snapshot(chain.stats()).recv_errors, u64::from(MAX_CONSECUTIVE_RECV_ERRORS));
    }

    #[test]
    fn test_pump_exits_on_lost_handle() {
        let stop = AtomicBool::new(false);
        let mut mock = MockPacketCapture::new();
        mock.expect_recv()
            .times(1)
            .returning(|| Err(PlatformError::HandleError("closed".into())));

        let chain = FilterChain::new();
        pump(&mut mock, &chain, &stop, &EngineStats::default());
    }

    // ====== Lifecycle Tests ======

    fn idle_capture() -> MockPacketCapture {
        let mut mock = MockPacketCapture::new();
        mock.expect_recv().returning(|| {
            thread::sleep(Duration::from_millis(2));
            Ok(CapturedPacket::new(outbound_segment(), Direction::Outbound))
        });
        mock.expect_send().returning(|_, _| Ok(()));
        mock.expect_close().times(1).returning(|| Ok(()));
        mock
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let engine = TrafficEngine::new(Arc::new(FilterChain::new()));
        assert!(!engine.is_running());
        assert!(matches!(engine.stop(), Err(PlatformError::EngineState(_))));

        engine.start(|| Ok(Box::new(idle_capture()))).unwrap();
        assert!(engine.is_running());
        assert!(matches!(
            engine.start(|| Ok(Box::new(idle_capture()))),
            Err(PlatformError::EngineState("already running"))
        ));

        thread::sleep(Duration::from_millis(20));
        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.stats().received, engine.stats().reinjected);
    }

    #[test]
    fn test_failed_open_leaves_engine_stopped() {
        let engine = TrafficEngine::new(Arc::new(FilterChain::new()));
        let err = engine
            .start(|| Err(PlatformError::PermissionDenied("not elevated".into())))
            .unwrap_err();
        assert!(matches!(err, PlatformError::PermissionDenied(_)));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_slow_open_is_reported() {
        let lines = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&lines);
        let sink: Arc<dyn ProgressSink> = Arc::new(move |l: &str| captured.lock().push(l.to_string()));
        let engine = TrafficEngine::new(Arc::new(FilterChain::new())).with_progress(sink);

        engine
            .start(|| {
                thread::sleep(OPEN_SLOW + Duration::from_millis(20));
                Ok(Box::new(idle_capture()))
            })
            .unwrap();
        engine.stop().unwrap();

        assert!(lines.lock().iter().any(|l| l.starts_with("[ENGINE][WARN] capture open is slow")));
    }
}
