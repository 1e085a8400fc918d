//! Container lifecycle and the worker thread of a single run.
//!
//! A [`Player`] is configured with an input address, an optional
//! [`Destination`], optional [`MediaCallbacks`] and [`MediaOptions`]. `open()`
//! validates the archive directories, opens the containers on a dedicated
//! worker thread and returns once decoding can start. `close()` stops the
//! worker, waits for its teardown and reports how the run ended.
//!
//! A player runs at most once per `open()`. For automatic reconnection wrap
//! it in a [`Supervisor`](crate::Supervisor).
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use framepipe::{MediaOptions, PipelineError, Player};
//!
//! # async fn example() -> Result<(), PipelineError> {
//! let mut player = Player::new("recording.mp4")
//!     .with_options(MediaOptions::new().with_name("lobby").with_max_frame_queue(4));
//! player.open()?;
//!
//! if let Some(video) = player.video() {
//!     let frame = video.get(Some(Duration::from_secs(5))).await?;
//!     println!("first frame at {:?}s", frame.time());
//! }
//!
//! player.close()?;
//! # Ok(())
//! # }
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::archive;
use crate::callbacks::MediaCallbacks;
use crate::configuration::{Destination, MediaOptions};
use crate::engine::MediaEngine;
use crate::error::PipelineError;
use crate::ffmpeg::FfmpegEngine;
use crate::frame_collection::FrameCollection;
use crate::metrics::CancellationToken;
use crate::worker::{self, Ready, RunPhase, WorkerConfig};

struct Session {
    quit: CancellationToken,
    worker: JoinHandle<Result<(), PipelineError>>,
    phase: watch::Receiver<RunPhase>,
    ready: Ready,
}

impl Session {
    fn close_collections(&self) {
        if let Some(video) = &self.ready.video {
            video.close();
        }
        if let Some(audio) = &self.ready.audio {
            audio.close();
        }
    }
}

/// Decodes one input on a background thread, optionally re-muxing it to a
/// file or an archived HLS output.
pub struct Player {
    address: String,
    destination: Option<Destination>,
    callbacks: Option<MediaCallbacks>,
    options: MediaOptions,
    engine: Arc<dyn MediaEngine>,
    runtime: Option<Handle>,
    session: Option<Session>,
}

impl Player {
    /// A closed player for `address` with default options and the FFmpeg
    /// engine.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            destination: None,
            callbacks: None,
            options: MediaOptions::default(),
            engine: Arc::new(FfmpegEngine::new()),
            runtime: None,
            session: None,
        }
    }

    /// Re-mux the input to `destination`.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Register lifecycle and per-frame callbacks.
    pub fn with_callbacks(mut self, callbacks: MediaCallbacks) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Replace the options.
    pub fn with_options(mut self, options: MediaOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a custom media engine.
    pub fn with_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Runtime that runs async callbacks. Defaults to the runtime `open()`
    /// is called from, if any.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// The input address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The configured options.
    pub fn options(&self) -> &MediaOptions {
        &self.options
    }

    /// Display name from the options.
    pub fn name(&self) -> Option<&str> {
        self.options.name.as_deref()
    }

    /// Device id from the options.
    pub fn device_id(&self) -> Option<u32> {
        self.options.device_id
    }

    /// Open the containers and start the worker thread.
    ///
    /// Blocks until the input is open. Call it from a blocking context
    /// (or `spawn_blocking`) when a runtime is driving the caller.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::AlreadyOpen`] if a run is active.
    /// - [`PipelineError::Archive`] if an HLS directory is missing or not
    ///   writable.
    /// - [`PipelineError::NoRuntime`] for async callbacks without a runtime.
    /// - Any open error of the engine.
    pub fn open(&mut self) -> Result<(), PipelineError> {
        if self.session.is_some() {
            return Err(PipelineError::AlreadyOpen);
        }

        if let Some(hls) = self.destination.as_ref().and_then(Destination::hls) {
            archive::validate_directories(hls)?;
        }

        let quit = CancellationToken::new();
        let (phase_sender, phase) = watch::channel(RunPhase::Opening);
        let config = WorkerConfig {
            engine: self.engine.clone(),
            address: self.address.clone(),
            destination: self.destination.clone(),
            options: self.options.clone(),
            callbacks: self.callbacks.clone(),
            runtime: self.runtime.clone().or_else(|| Handle::try_current().ok()),
            quit: quit.clone(),
            phase: phase_sender,
            label: self.to_string(),
        };

        log::debug!("{} Opening", self);
        let (worker, ready) = worker::spawn(config)?;
        log::info!(
            "{} Opened (format='{}', throttle={})",
            self, ready.format_name, ready.throttle,
        );

        self.session = Some(Session {
            quit,
            worker,
            phase,
            ready,
        });
        Ok(())
    }

    /// Stop the worker, wait for its teardown and return how the run ended.
    ///
    /// Teardown drains the output encoders, closes the output and input,
    /// archives the last segment and closes both frame collections, in that
    /// order, whatever the outcome of the run.
    ///
    /// Blocks until the worker has joined. With async callbacks on a
    /// current-thread runtime, calling this from the runtime thread stalls
    /// the callback tasks; lifecycle events still queued after
    /// [`QUIT_GRACE`](crate::callbacks::QUIT_GRACE) are dropped.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::NotOpen`] if the player is not open.
    /// - [`PipelineError::WorkerPanicked`] if the worker thread panicked.
    /// - The fatal error that ended the run, if any.
    pub fn close(&mut self) -> Result<(), PipelineError> {
        let session = self.session.take().ok_or(PipelineError::NotOpen)?;
        log::debug!("{} Closing", self);

        session.quit.cancel();
        let result = session
            .worker
            .join()
            .unwrap_or(Err(PipelineError::WorkerPanicked));
        session.close_collections();

        log::info!("{} Closed", self);
        result
    }

    /// [`close`](Self::close) if open; `Ok(())` otherwise.
    pub fn close_if_open(&mut self) -> Result<(), PipelineError> {
        if self.session.is_some() {
            self.close()
        } else {
            Ok(())
        }
    }

    /// `true` between a successful `open()` and `close()`.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// The video frame collection of the current run.
    pub fn video(&self) -> Option<&FrameCollection> {
        self.session.as_ref()?.ready.video.as_ref()
    }

    /// The audio frame collection of the current run.
    pub fn audio(&self) -> Option<&FrameCollection> {
        self.session.as_ref()?.ready.audio.as_ref()
    }

    /// Demuxer format name of the current input.
    pub fn format_name(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.ready.format_name.as_str())
    }

    /// `true` if the worker paces decoding to wall-clock speed.
    pub fn throttle_playback(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.ready.throttle)
    }

    /// `true` if the current input is a live device or protocol.
    pub fn is_realtime(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.ready.throttle)
    }

    /// Watch the phase of the current run.
    pub fn phase(&self) -> Option<watch::Receiver<RunPhase>> {
        self.session.as_ref().map(|s| s.phase.clone())
    }

    /// `true` if the current run passed its container-begin callback, even
    /// when it has already finished.
    pub fn has_begun(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.ready.began.load(Ordering::SeqCst))
    }

    /// `true` once the worker left its loop and released the containers.
    pub fn is_finished(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| *s.phase.borrow() == RunPhase::Finished)
    }

    /// Wait until the worker leaves its loop.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NotOpen`] if the player is not open.
    pub async fn wait(&self) -> Result<(), PipelineError> {
        let mut phase = self.phase().ok_or(PipelineError::NotOpen)?;
        // The sender is dropped right after publishing `Finished`.
        let _ = phase.wait_for(|phase| *phase == RunPhase::Finished).await;
        Ok(())
    }
}

impl Display for Player {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Player[name='{}'", self.name().unwrap_or_default())?;
        match self.device_id() {
            Some(device) => write!(f, ",device={device}]"),
            None => write!(f, ",device=-]"),
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Player")
            .field("address", &self.address)
            .field("destination", &self.destination)
            .field("callbacks", &self.callbacks)
            .field("options", &self.options)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Err(error) = self.close_if_open() {
            log::warn!("{} Run ended with an error: {}", self, error);
        }
    }
}
