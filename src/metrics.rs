//! Step metrics and cancellation support.
//!
//! This module provides [`MetricsSink`] for observing how long each stage of
//! the pipeline takes and how many frames were shed under backpressure, and
//! [`CancellationToken`], the single cooperative quit signal shared between
//! a [`Player`](crate::Player) and its worker thread.
//!
//! A sink is injected through
//! [`MediaOptions::with_metrics`](crate::MediaOptions::with_metrics) or
//! [`BridgeOptions::with_metrics`](crate::BridgeOptions::with_metrics); its
//! lifetime is tied to the component that owns the options.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use framepipe::{LogMetrics, MediaOptions};
//!
//! // Log the average demux/decode/mux durations every 500 packets.
//! let options = MediaOptions::new()
//!     .with_name("lobby-camera")
//!     .with_metrics(Arc::new(LogMetrics::new("lobby-camera", 500)));
//! ```

use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

/// A measured stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Step {
    /// Reading one packet from the input container.
    Demux,
    /// Decoding one packet into frames.
    Decode,
    /// Encoding one frame.
    Encode,
    /// Writing one packet to the output container.
    Mux,
    /// Running one user callback.
    Callback,
    /// One full iteration of a worker or bridge loop.
    Iteration,
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Step::Demux => "demux",
            Step::Decode => "decode",
            Step::Encode => "encode",
            Step::Mux => "mux",
            Step::Callback => "callback",
            Step::Iteration => "iteration",
        };
        f.write_str(name)
    }
}

/// Why a frame or event was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DropReason {
    /// A frame collection was full and evicted its oldest item.
    QueueFull,
    /// The async callback channel was full.
    CallbackBacklog,
    /// The bridge consumer had too many frames outstanding.
    SlowConsumer,
}

/// Receives pipeline measurements.
///
/// Implementations must be [`Send`] and [`Sync`]: the worker thread and the
/// async runtime report into the same sink concurrently. Sinks observe but
/// never influence the pipeline.
pub trait MetricsSink: Send + Sync {
    /// Called after a stage completes.
    fn on_step(&self, step: Step, elapsed: Duration);

    /// Called whenever a frame or event is discarded.
    fn on_frame_dropped(&self, reason: DropReason);
}

/// A sink that discards all measurements.
///
/// This is the default when no sink is configured.
pub(crate) struct NoOpMetrics;

impl MetricsSink for NoOpMetrics {
    fn on_step(&self, _step: Step, _elapsed: Duration) {}

    fn on_frame_dropped(&self, _reason: DropReason) {}
}

#[derive(Default)]
struct StepWindow {
    total_count: u64,
    window_count: u64,
    window_duration: Duration,
}

/// A sink that logs the average duration of each step.
///
/// Every `logging_step` samples of a given [`Step`], one `debug` line with
/// the window average is emitted and the window restarts. Drop counts are
/// kept for the lifetime of the sink.
pub struct LogMetrics {
    name: String,
    logging_step: u64,
    windows: Mutex<HashMap<Step, StepWindow>>,
    queue_full: AtomicU64,
    callback_backlog: AtomicU64,
    slow_consumer: AtomicU64,
}

impl LogMetrics {
    /// Create a sink that tags its log lines with `name`.
    ///
    /// `logging_step` is clamped to `1..=u32::MAX`.
    pub fn new(name: impl Into<String>, logging_step: u64) -> Self {
        Self {
            name: name.into(),
            logging_step: logging_step.clamp(1, u64::from(u32::MAX)),
            windows: Mutex::new(HashMap::new()),
            queue_full: AtomicU64::new(0),
            callback_backlog: AtomicU64::new(0),
            slow_consumer: AtomicU64::new(0),
        }
    }

    /// Samples per logged window average.
    pub fn logging_step(&self) -> u64 {
        self.logging_step
    }

    /// How many drops of the given kind were reported.
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.counter(reason).load(Ordering::Relaxed)
    }

    fn counter(&self, reason: DropReason) -> &AtomicU64 {
        match reason {
            DropReason::QueueFull => &self.queue_full,
            DropReason::CallbackBacklog => &self.callback_backlog,
            DropReason::SlowConsumer => &self.slow_consumer,
        }
    }
}

impl MetricsSink for LogMetrics {
    fn on_step(&self, step: Step, elapsed: Duration) {
        let Ok(mut windows) = self.windows.lock() else {
            return;
        };
        let window = windows.entry(step).or_default();
        window.total_count += 1;
        window.window_count += 1;
        window.window_duration += elapsed;

        if window.window_count >= self.logging_step {
            let count = u32::try_from(window.window_count).unwrap_or(u32::MAX);
            let average = window.window_duration / count;
            log::debug!(
                "[{}] {} #{} average duration: {:?}",
                self.name, step, window.total_count, average,
            );
            window.window_count = 0;
            window.window_duration = Duration::ZERO;
        }
    }

    fn on_frame_dropped(&self, reason: DropReason) {
        self.counter(reason).fetch_add(1, Ordering::Relaxed);
    }
}

/// Times a closure and reports it to `sink`.
pub(crate) fn timed<T>(sink: &dyn MetricsSink, step: Step, work: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let output = work();
    sink.on_step(step, started.elapsed());
    output
}

/// Cooperative cancellation token backed by an [`AtomicBool`].
///
/// Clone this token and share it between threads; call
/// [`cancel`](CancellationToken::cancel) from any thread to request that the
/// associated worker stop. Workers check
/// [`is_cancelled`](CancellationToken::is_cancelled) at the top of every
/// iteration and after every decoded frame.
///
/// # Example
///
/// ```
/// use framepipe::CancellationToken;
///
/// let token = CancellationToken::new();
/// assert!(!token.is_cancelled());
///
/// token.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, non-cancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    ///
    /// All clones of this token will observe the cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
