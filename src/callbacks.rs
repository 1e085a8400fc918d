//! User callbacks and their dispatch from the worker thread.
//!
//! A consumer registers either a blocking [`MediaHandler`] or an
//! [`AsyncMediaHandler`], wrapped once in [`MediaCallbacks`]. The choice is
//! made at registration, so the worker never inspects a callback at call
//! time:
//!
//! - **sync** handlers run inline on the worker thread, in decode order.
//!   An error from a per-frame or segment callback ends the run.
//! - **async** handlers are fed through a bounded channel into a task on the
//!   tokio runtime, which spawns one task per event. Start order matches
//!   decode order; completion order is not guaranteed, so handlers must not
//!   assume mutual exclusion. When the channel is full, per-frame events are
//!   dropped (and reported to the metrics sink) instead of stalling decode;
//!   lifecycle and segment events wait for room. Once the run is told to
//!   quit they wait at most [`QUIT_GRACE`], so a caller that blocks the
//!   runtime thread in `Player::close` cannot deadlock the worker.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chrono::{DateTime, Local};
//! use framepipe::{AsyncMediaHandler, CallbackResult, MediaCallbacks, Player};
//! use image::RgbImage;
//!
//! struct Detector;
//!
//! #[async_trait::async_trait]
//! impl AsyncMediaHandler for Detector {
//!     async fn on_video_frame(
//!         &self,
//!         image: Arc<RgbImage>,
//!         _start: DateTime<Local>,
//!         _last: DateTime<Local>,
//!     ) -> CallbackResult {
//!         println!("{}x{}", image.width(), image.height());
//!         Ok(())
//!     }
//! }
//!
//! let player = Player::new("rtsp://10.0.0.7/stream1")
//!     .with_callbacks(MediaCallbacks::asynchronous(Detector));
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use image::RgbImage;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::PipelineError;
use crate::frame::AudioSamples;
use crate::metrics::{CancellationToken, DropReason, MetricsSink, Step, timed};

/// How long a lifecycle or segment event may wait for channel room after
/// the run was told to quit.
pub const QUIT_GRACE: Duration = Duration::from_millis(200);

/// Poll interval while waiting for channel room.
const SEND_RETRY: Duration = Duration::from_millis(1);

/// Error type user callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result type of every callback.
pub type CallbackResult = Result<(), CallbackError>;

/// Blocking callbacks, run on the worker thread.
///
/// Every method has a no-op default; implement only what you need.
pub trait MediaHandler: Send + Sync {
    /// The input was opened and the worker is about to read packets.
    fn on_container_begin(&self) -> CallbackResult {
        Ok(())
    }

    /// The worker left its loop, for whatever reason.
    fn on_container_end(&self) -> CallbackResult {
        Ok(())
    }

    /// A video frame was decoded. `start` is when the current segment (or
    /// demux pass) began, `last` when this frame's packet was read.
    fn on_video_frame(
        &self,
        image: Arc<RgbImage>,
        start: DateTime<Local>,
        last: DateTime<Local>,
    ) -> CallbackResult {
        let _ = (image, start, last);
        Ok(())
    }

    /// A uniform 20 ms chunk of stereo 48 kHz audio is ready.
    fn on_audio_frame(
        &self,
        samples: Arc<AudioSamples>,
        start: DateTime<Local>,
        last: DateTime<Local>,
    ) -> CallbackResult {
        let _ = (samples, start, last);
        Ok(())
    }

    /// A segment was archived as `destination_dir/directory/filename`.
    fn on_segment_complete(
        &self,
        directory: &str,
        filename: &str,
        start: DateTime<Local>,
        last: DateTime<Local>,
    ) -> CallbackResult {
        let _ = (directory, filename, start, last);
        Ok(())
    }
}

/// Async callbacks, run as tasks on the tokio runtime.
///
/// Mirrors [`MediaHandler`]; every method has a no-op default.
#[async_trait]
pub trait AsyncMediaHandler: Send + Sync {
    /// The input was opened and the worker is about to read packets.
    async fn on_container_begin(&self) -> CallbackResult {
        Ok(())
    }

    /// The worker left its loop, for whatever reason.
    async fn on_container_end(&self) -> CallbackResult {
        Ok(())
    }

    /// A video frame was decoded.
    async fn on_video_frame(
        &self,
        image: Arc<RgbImage>,
        start: DateTime<Local>,
        last: DateTime<Local>,
    ) -> CallbackResult {
        let _ = (image, start, last);
        Ok(())
    }

    /// A uniform 20 ms chunk of stereo 48 kHz audio is ready.
    async fn on_audio_frame(
        &self,
        samples: Arc<AudioSamples>,
        start: DateTime<Local>,
        last: DateTime<Local>,
    ) -> CallbackResult {
        let _ = (samples, start, last);
        Ok(())
    }

    /// A segment was archived as `destination_dir/directory/filename`.
    async fn on_segment_complete(
        &self,
        directory: &str,
        filename: &str,
        start: DateTime<Local>,
        last: DateTime<Local>,
    ) -> CallbackResult {
        let _ = (directory, filename, start, last);
        Ok(())
    }
}

/// A registered callback set, sync or async.
#[derive(Clone)]
pub enum MediaCallbacks {
    /// Run inline on the worker thread.
    Sync(Arc<dyn MediaHandler>),
    /// Run as tasks on a tokio runtime.
    Async(Arc<dyn AsyncMediaHandler>),
}

impl MediaCallbacks {
    /// Register a blocking handler.
    pub fn sync(handler: impl MediaHandler + 'static) -> Self {
        MediaCallbacks::Sync(Arc::new(handler))
    }

    /// Register an async handler.
    pub fn asynchronous(handler: impl AsyncMediaHandler + 'static) -> Self {
        MediaCallbacks::Async(Arc::new(handler))
    }

    /// `true` for async handlers.
    pub fn is_async(&self) -> bool {
        matches!(self, MediaCallbacks::Async(_))
    }
}

impl std::fmt::Debug for MediaCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaCallbacks::Sync(_) => f.write_str("MediaCallbacks::Sync"),
            MediaCallbacks::Async(_) => f.write_str("MediaCallbacks::Async"),
        }
    }
}

/// One callback invocation, captured on the worker thread.
#[derive(Debug)]
pub(crate) enum MediaEvent {
    ContainerBegin,
    ContainerEnd,
    VideoFrame {
        image: Arc<RgbImage>,
        start: DateTime<Local>,
        last: DateTime<Local>,
    },
    AudioFrame {
        samples: Arc<AudioSamples>,
        start: DateTime<Local>,
        last: DateTime<Local>,
    },
    SegmentComplete {
        directory: String,
        filename: String,
        start: DateTime<Local>,
        last: DateTime<Local>,
    },
}

impl MediaEvent {
    fn name(&self) -> &'static str {
        match self {
            MediaEvent::ContainerBegin => "container-begin",
            MediaEvent::ContainerEnd => "container-end",
            MediaEvent::VideoFrame { .. } => "video-frame",
            MediaEvent::AudioFrame { .. } => "audio-frame",
            MediaEvent::SegmentComplete { .. } => "segment-complete",
        }
    }

    fn is_frame(&self) -> bool {
        matches!(self, MediaEvent::VideoFrame { .. } | MediaEvent::AudioFrame { .. })
    }

    fn deliver_blocking(self, handler: &dyn MediaHandler) -> CallbackResult {
        match self {
            MediaEvent::ContainerBegin => handler.on_container_begin(),
            MediaEvent::ContainerEnd => handler.on_container_end(),
            MediaEvent::VideoFrame { image, start, last } => handler.on_video_frame(image, start, last),
            MediaEvent::AudioFrame { samples, start, last } => handler.on_audio_frame(samples, start, last),
            MediaEvent::SegmentComplete {
                directory,
                filename,
                start,
                last,
            } => handler.on_segment_complete(&directory, &filename, start, last),
        }
    }

    async fn deliver(self, handler: &dyn AsyncMediaHandler) -> CallbackResult {
        match self {
            MediaEvent::ContainerBegin => handler.on_container_begin().await,
            MediaEvent::ContainerEnd => handler.on_container_end().await,
            MediaEvent::VideoFrame { image, start, last } => {
                handler.on_video_frame(image, start, last).await
            }
            MediaEvent::AudioFrame { samples, start, last } => {
                handler.on_audio_frame(samples, start, last).await
            }
            MediaEvent::SegmentComplete {
                directory,
                filename,
                start,
                last,
            } => handler.on_segment_complete(&directory, &filename, start, last).await,
        }
    }
}

enum Route {
    Discard,
    Inline(Arc<dyn MediaHandler>),
    Channel(Sender<MediaEvent>),
}

/// Routes events from the worker thread to the registered handler.
pub(crate) struct Dispatcher {
    route: Route,
    metrics: Arc<dyn MetricsSink>,
    quit: CancellationToken,
}

impl Dispatcher {
    /// Build a dispatcher. Async handlers need `runtime`; the returned task
    /// forwards events until the dispatcher is dropped.
    pub(crate) fn new(
        callbacks: Option<&MediaCallbacks>,
        runtime: Option<&Handle>,
        capacity: usize,
        metrics: Arc<dyn MetricsSink>,
        quit: CancellationToken,
    ) -> Result<(Self, Option<JoinHandle<()>>), PipelineError> {
        let (route, task) = match callbacks {
            None => (Route::Discard, None),
            Some(MediaCallbacks::Sync(handler)) => (Route::Inline(handler.clone()), None),
            Some(MediaCallbacks::Async(handler)) => {
                let runtime = runtime.ok_or(PipelineError::NoRuntime)?;
                let (sender, receiver) = mpsc::channel(capacity.max(1));
                let task = runtime.spawn(forward(receiver, handler.clone(), metrics.clone()));
                (Route::Channel(sender), Some(task))
            }
        };
        Ok((
            Self {
                route,
                metrics,
                quit,
            },
            task,
        ))
    }

    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Callback`] when an inline handler fails.
    pub(crate) fn dispatch(&self, event: MediaEvent) -> Result<(), PipelineError> {
        match &self.route {
            Route::Discard => Ok(()),
            Route::Inline(handler) => {
                let name = event.name();
                timed(&*self.metrics, Step::Callback, || event.deliver_blocking(&**handler))
                    .map_err(|e| PipelineError::Callback(format!("{name}: {e}")))
            }
            Route::Channel(sender) => {
                if event.is_frame() {
                    match sender.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(event)) => {
                            log::debug!("Callback backlog full, dropping {} event", event.name());
                            self.metrics.on_frame_dropped(DropReason::CallbackBacklog);
                        }
                        Err(TrySendError::Closed(event)) => {
                            log::warn!("Callback task is gone, dropping {} event", event.name());
                        }
                    }
                } else {
                    self.send_lifecycle(sender, event);
                }
                Ok(())
            }
        }
    }

    /// Wait for room until the event is queued, or until [`QUIT_GRACE`] has
    /// passed since the run was told to quit.
    ///
    /// The forwarding task may share a current-thread runtime with a caller
    /// blocked in `Player::close`, so nothing here may wait unbounded.
    fn send_lifecycle(&self, sender: &Sender<MediaEvent>, mut event: MediaEvent) {
        let mut quit_seen: Option<Instant> = None;
        loop {
            match sender.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Closed(event)) => {
                    log::warn!("Callback task is gone, dropping {} event", event.name());
                    return;
                }
                Err(TrySendError::Full(pending)) => event = pending,
            }
            if self.quit.is_cancelled() {
                let since = *quit_seen.get_or_insert_with(Instant::now);
                if since.elapsed() >= QUIT_GRACE {
                    log::warn!(
                        "Callback backlog still full after quit, dropping {} event",
                        event.name()
                    );
                    return;
                }
            }
            thread::sleep(SEND_RETRY);
        }
    }
}

async fn forward(
    mut receiver: Receiver<MediaEvent>,
    handler: Arc<dyn AsyncMediaHandler>,
    metrics: Arc<dyn MetricsSink>,
) {
    while let Some(event) = receiver.recv().await {
        let handler = handler.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let name = event.name();
            let started = Instant::now();
            if let Err(e) = event.deliver(&*handler).await {
                log::error!("Async {} callback failed: {}", name, e);
            }
            metrics.on_step(Step::Callback, started.elapsed());
        });
    }
    log::debug!("Callback forwarding finished");
}
