//! Human-readable progress lines
//!
//! Components that run for a while (the signals adapter, the apply service)
//! report checkpoints as single text lines. Every line also goes to
//! `tracing` at `info` level under the `progress` target, so a headless run
//! keeps the same trail.

use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

/// Receiver of progress lines
pub trait ProgressSink: Send + Sync {
    /// Deliver one line
    fn report(&self, line: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, line: &str) {
        self(line);
    }
}

impl ProgressSink for UnboundedSender<String> {
    fn report(&self, line: &str) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(line.to_string());
    }
}

/// Sink that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnly;

impl ProgressSink for LogOnly {
    fn report(&self, _line: &str) {}
}

/// Log `line` and forward it to `sink` when present
pub fn emit(sink: Option<&dyn ProgressSink>, line: &str) {
    info!(target: "progress", "{}", line);
    if let Some(sink) = sink {
        sink.report(line);
    }
}
