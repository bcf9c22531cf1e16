use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Default minimum spacing between two visible progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Receives the reports that survive rate limiting.
pub type ProgressSink = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// One visible progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub label: String,
    pub current: u64,
    pub total: u64,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    /// Percentage complete, or `None` when the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.current as f64 / self.total as f64 * 100.0)
    }

    /// Percentage with two decimals, `NA` when the total is unknown.
    pub fn percent_display(&self) -> String {
        match self.percent() {
            Some(p) => format!("{p:.2}"),
            None => "NA".into(),
        }
    }
}

fn as_gb(bytes: u64) -> f64 {
    (bytes as f64 / GIB * 100.0).round() / 100.0
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} GiB ({}%) in {:.0}s",
            as_gb(self.current),
            as_gb(self.total),
            self.percent_display(),
            self.elapsed.as_secs_f64()
        )
    }
}

/// Sink that emits each report as a `tracing` event.
pub fn log_sink() -> ProgressSink {
    Arc::new(|snapshot: &ProgressSnapshot| {
        tracing::info!(
            label = %snapshot.label,
            current_gb = as_gb(snapshot.current),
            total_gb = as_gb(snapshot.total),
            percent = %snapshot.percent_display(),
            elapsed_secs = snapshot.elapsed.as_secs(),
            "transfer progress"
        );
    })
}

/// Rate-limited progress sink for a single transfer.
///
/// Producers may call [`report`](Self::report) once per I/O chunk; at most
/// one report per interval reaches the sink. The first report always does.
/// Each transfer owns its own reporter.
pub struct ProgressReporter {
    label: String,
    interval: Duration,
    sink: ProgressSink,
    started: Instant,
    last_emit: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    /// Creates a reporter with the default interval that logs via `tracing`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            interval: DEFAULT_PROGRESS_INTERVAL,
            sink: log_sink(),
            started: Instant::now(),
            last_emit: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_sink(mut self, sink: ProgressSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Records progress; forwards to the sink only if the interval elapsed.
    pub fn report(&self, current: u64, total: u64) {
        let now = Instant::now();
        {
            let mut last = self.last_emit.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = *last
                && now.duration_since(prev) < self.interval
            {
                return;
            }
            *last = Some(now);
        }
        self.emit(now, current, total);
    }

    /// Forwards a final report regardless of the interval.
    pub fn finish(&self, current: u64, total: u64) {
        let now = Instant::now();
        *self.last_emit.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
        self.emit(now, current, total);
    }

    fn emit(&self, now: Instant, current: u64, total: u64) {
        let snapshot = ProgressSnapshot {
            label: self.label.clone(),
            current,
            total,
            elapsed: now.duration_since(self.started),
        };
        (self.sink)(&snapshot);
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("label", &self.label)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
