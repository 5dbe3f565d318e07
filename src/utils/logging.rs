use std::io::Write;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Log to stderr; stdout carries the task result.
pub fn init() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_ansi(false)
        .with_writer(std::io::stderr);
    fmt.init();
}

/// Receives task progress as a fraction in `[0, 1]`.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, fraction: f64);
}

/// Writes the host's progress control line (`SOH p STX value`) to stderr.
pub struct HostProgress;

impl ProgressSink for HostProgress {
    fn progress(&self, fraction: f64) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "{}", progress_line(fraction));
        let _ = err.flush();
    }
}

pub fn progress_line(fraction: f64) -> String {
    let clamped = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
    format!("\x01p\x02{}\n", clamped)
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn progress(&self, _fraction: f64) {}
}

/// Keeps every reported value.
#[derive(Default)]
pub struct RecordingProgress {
    values: Mutex<Vec<f64>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> Vec<f64> {
        self.values.lock().clone()
    }

    pub fn last(&self) -> Option<f64> {
        self.values.lock().last().copied()
    }
}

impl ProgressSink for RecordingProgress {
    fn progress(&self, fraction: f64) {
        self.values.lock().push(fraction);
    }
}
