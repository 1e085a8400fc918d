//! A lighter single-stream pipeline: decode one video track, hand each frame
//! to a consumer, encode what comes back.
//!
//! [`StreamBridge`] is the blocking half. It owns its containers and must
//! stay on the thread that opened it. [`AsyncBridge`] runs a `StreamBridge`
//! on a blocking thread and feeds frames to an async [`ImageHandler`] on the
//! tokio runtime, applying the slow-consumer policy:
//!
//! - every submitted frame increments `published`, every finished handler
//!   call increments `completed`;
//! - when `published - completed` reaches the drop threshold, the bridge
//!   warns, or with `drop_slow_frame` discards the frame without
//!   submitting it.
//!
//! The first fatal error of either side lands in a write-once
//! [`StickyError`]; the loop stops at its next check instead of decoding
//! frames nobody will finish.
//!
//! # Example
//!
//! ```no_run
//! use framepipe::{BridgeOptions, StreamBridge};
//!
//! # fn example() -> Result<(), framepipe::PipelineError> {
//! let options = BridgeOptions::new("rtsp://10.0.0.7/stream1")
//!     .with_output("processed.mp4")
//!     .with_source_size(640, 360);
//! let mut bridge = StreamBridge::open(options)?;
//! bridge.run(|image| Ok(Some(image)));
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use ffmpeg_next::Rational;
use image::RgbImage;
use image::imageops::{self, FilterType};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::callbacks::{CallbackError, CallbackResult};
use crate::configuration::BridgeOptions;
use crate::engine::{
    CodecHints, InputContainer, InputSettings, MediaEngine, OutputContainer, OutputSettings,
    StreamInfo, VideoEncoderSettings,
};
use crate::error::PipelineError;
use crate::ffmpeg::FfmpegEngine;
use crate::frame::{Frame, MediaKind};
use crate::metrics::{CancellationToken, DropReason, MetricsSink, Step, timed};

/// Pause before retrying after a transient engine error.
const RETRY_WAIT: Duration = Duration::from_millis(1);

/// Frame rate assumed when the input does not declare one.
const FALLBACK_FRAME_RATE: i32 = 30;

/// Counters are rebased once `published` passes this value.
const COUNTER_REBASE_LIMIT: u64 = u32::MAX as u64;

/// Write-once slot for the first fatal error of a bridge.
///
/// Clones share the slot. Later writes are ignored.
#[derive(Debug, Clone, Default)]
pub struct StickyError {
    slot: Arc<OnceLock<Arc<PipelineError>>>,
}

impl StickyError {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `error` unless an error is already stored. Returns `true` if
    /// this call won.
    pub fn set(&self, error: PipelineError) -> bool {
        self.slot.set(Arc::new(error)).is_ok()
    }

    /// The stored error, if any.
    pub fn get(&self) -> Option<Arc<PipelineError>> {
        self.slot.get().cloned()
    }

    /// `true` once an error was stored.
    pub fn is_set(&self) -> bool {
        self.slot.get().is_some()
    }
}

/// Frames handed to a consumer versus frames it finished.
#[derive(Debug, Default)]
pub(crate) struct PubSubCounter {
    published: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
}

impl PubSubCounter {
    /// Count one submitted frame. Only the producer thread calls this.
    pub(crate) fn publish(&self) {
        let published = self.published.fetch_add(1, Ordering::AcqRel) + 1;
        if published > COUNTER_REBASE_LIMIT {
            let completed = self.completed.load(Ordering::Acquire);
            self.completed.fetch_sub(completed, Ordering::AcqRel);
            self.published.fetch_sub(completed, Ordering::AcqRel);
            log::debug!("Rebased frame counters by {}", completed);
        }
    }

    pub(crate) fn complete(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_frame(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn outstanding(&self) -> u64 {
        let completed = self.completed.load(Ordering::Acquire);
        self.published.load(Ordering::Acquire).saturating_sub(completed)
    }

    pub(crate) fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct BridgeOutput {
    container: Box<dyn OutputContainer>,
    stream: usize,
    time_base: Rational,
}

/// Blocking single-video-stream pipeline.
pub struct StreamBridge {
    options: BridgeOptions,
    input: Box<dyn InputContainer>,
    video: StreamInfo,
    output: Option<BridgeOutput>,
    pending: VecDeque<Frame>,
    flush_count: usize,
    closed: bool,
    done: CancellationToken,
    latest_error: StickyError,
    metrics: Arc<dyn MetricsSink>,
}

impl StreamBridge {
    /// Open `options.input` (and `options.output`) with the FFmpeg engine.
    ///
    /// # Errors
    ///
    /// See [`open_with_engine`](Self::open_with_engine).
    pub fn open(options: BridgeOptions) -> Result<Self, PipelineError> {
        Self::open_with_engine(&FfmpegEngine::new(), options)
    }

    /// Open `options.input` (and `options.output`) with `engine`.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::NoVideoStream`] if the input has no video stream.
    /// - Any open error of the engine.
    pub fn open_with_engine(engine: &dyn MediaEngine, options: BridgeOptions) -> Result<Self, PipelineError> {
        let settings = InputSettings {
            format: options.input_format.clone(),
            options: options.input_options.clone(),
            buffer_size: options.buffer_size,
            timeout: options.timeout,
        };
        let mut input = engine.open_input(&options.input, &settings)?;
        let video = input
            .streams()
            .into_iter()
            .find(|stream| stream.kind == Some(MediaKind::Video))
            .ok_or(PipelineError::NoVideoStream)?;
        input.open_decoder(
            video.index,
            CodecHints {
                go_faster: true,
                low_delay: true,
            },
        )?;

        let output = match &options.output {
            Some(address) => {
                let mut container = engine.open_output(
                    address,
                    &OutputSettings {
                        format: options.output_format.clone(),
                        options: options.output_options.clone(),
                    },
                )?;
                let (width, height) = options.encode_size().unwrap_or((video.width, video.height));
                let frame_rate = video
                    .frame_rate
                    .filter(|rate| rate.numerator() > 0 && rate.denominator() > 0)
                    .unwrap_or(Rational::new(FALLBACK_FRAME_RATE, 1));
                let encoder = VideoEncoderSettings::h264(width, height, frame_rate);
                let stream = container.add_video_encoder(&encoder)?;
                log::debug!("Encoding output {} at {}x{} @ {}", address, width, height, frame_rate);
                Some(BridgeOutput {
                    container,
                    stream,
                    time_base: encoder.time_base(),
                })
            }
            None => None,
        };

        log::info!(
            "Bridge opened (input='{}', stream={}, {}x{})",
            options.input, video.index, video.width, video.height,
        );
        let metrics = options.metrics.clone();
        Ok(Self {
            options,
            input,
            video,
            output,
            pending: VecDeque::new(),
            flush_count: 0,
            closed: false,
            done: CancellationToken::new(),
            latest_error: StickyError::new(),
            metrics,
        })
    }

    /// The selected video stream.
    pub fn video_stream(&self) -> &StreamInfo {
        &self.video
    }

    /// The options the bridge was opened with.
    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Decoded frames of the video stream.
    ///
    /// The iterator is restartable: calling `recv()` again continues where
    /// the previous one stopped.
    pub fn recv(&mut self) -> FrameIter<'_> {
        FrameIter {
            bridge: self,
            finished: false,
        }
    }

    fn pull(&mut self) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::EndOfStream);
        }
        let packet = timed(&*self.metrics, Step::Demux, || self.input.read_packet())?;
        if packet.stream != self.video.index {
            return Ok(());
        }
        if packet.is_flush_marker() {
            self.flush_count += 1;
            if self.flush_count >= self.options.flush_threshold {
                log::debug!("Flush threshold reached after {} markers", self.flush_count);
                return Err(PipelineError::EndOfStream);
            }
            return Ok(());
        }
        self.flush_count = 0;
        let frames = timed(&*self.metrics, Step::Decode, || self.input.decode(&packet))?;
        self.pending.extend(frames);
        Ok(())
    }

    /// Convert a decoded frame to an image at the configured source size.
    ///
    /// # Errors
    ///
    /// [`PipelineError::VideoDecodeError`] if `frame` holds audio.
    pub fn frame_to_image(&self, frame: &Frame) -> Result<RgbImage, PipelineError> {
        let image = frame
            .as_video()
            .ok_or_else(|| PipelineError::VideoDecodeError("not a video frame".to_string()))?;
        match self.options.source_size {
            Some((width, height)) if image.dimensions() != (width, height) => {
                Ok(imageops::resize(&**image, width, height, FilterType::Triangle))
            }
            _ => Ok((**image).clone()),
        }
    }

    /// Encode `image` and mux it to the output. A no-op without output.
    ///
    /// # Errors
    ///
    /// Any encode or mux error of the engine.
    pub fn send(&mut self, image: &RgbImage) -> Result<(), PipelineError> {
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };
        let frame = Frame::video(image.clone(), None, output.time_base);
        let packets = timed(&*self.metrics, Step::Encode, || {
            output.container.encode(output.stream, Some(&frame))
        })?;
        for packet in packets {
            timed(&*self.metrics, Step::Mux, || output.container.mux(packet))?;
        }
        Ok(())
    }

    /// Ask [`run`](Self::run) to stop at its next check.
    pub fn done(&self) {
        self.done.cancel();
    }

    /// `true` once [`done`](Self::done) was called.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// The first fatal error recorded by the bridge.
    pub fn latest_error(&self) -> Option<Arc<PipelineError>> {
        self.latest_error.get()
    }

    pub(crate) fn share_state(&mut self, done: CancellationToken, latest_error: StickyError) {
        self.done = done;
        self.latest_error = latest_error;
    }

    /// Stop decoding and finish the output.
    ///
    /// The encoder is drained unless the recorded error means the output
    /// peer is gone. Drain failures are logged.
    ///
    /// # Errors
    ///
    /// An error closing the output container.
    pub fn close(&mut self) -> Result<(), PipelineError> {
        self.closed = true;
        self.pending.clear();
        let Some(mut output) = self.output.take() else {
            return Ok(());
        };

        let skip_flush = self.latest_error.get().is_some_and(|error| error.skips_flush());
        if skip_flush {
            log::debug!("Skipping encoder flush, the output peer is gone");
        } else {
            match output.container.encode(output.stream, None) {
                Ok(packets) => {
                    for packet in packets {
                        if let Err(error) = output.container.mux(packet) {
                            log::warn!("Failed to mux flushed packet: {}", error);
                        }
                    }
                }
                Err(error) => log::warn!("Failed to flush the encoder: {}", error),
            }
        }
        output.container.close()
    }

    fn step<F>(&mut self, callback: &mut F) -> Result<(), PipelineError>
    where
        F: FnMut(RgbImage) -> Result<Option<RgbImage>, CallbackError>,
    {
        if let Some(error) = self.latest_error.get() {
            return Err(PipelineError::AlreadyFailed(error));
        }
        if self.is_done() {
            return Err(PipelineError::Interrupted);
        }
        let frame = self.recv().next().ok_or(PipelineError::EndOfStream)??;
        let image = self.frame_to_image(&frame)?;
        let processed = timed(&*self.metrics, Step::Callback, || callback(image))
            .map_err(|e| PipelineError::Callback(e.to_string()))?;
        if let Some(processed) = processed {
            self.send(&processed)?;
        }
        Ok(())
    }

    /// Decode, call `callback` and send its result until the stream ends,
    /// [`done`](Self::done) is called or an error occurs.
    ///
    /// Fatal errors are recorded (see [`latest_error`](Self::latest_error))
    /// and logged; end of stream and interruption are logged as warnings.
    pub fn run<F>(&mut self, mut callback: F)
    where
        F: FnMut(RgbImage) -> Result<Option<RgbImage>, CallbackError>,
    {
        let error = loop {
            if let Err(error) = self.step(&mut callback) {
                break error;
            }
        };
        report_exit(&self.latest_error, error);
    }
}

fn report_exit(latest_error: &StickyError, error: PipelineError) {
    match error {
        PipelineError::EndOfStream => log::warn!("End of stream"),
        PipelineError::Interrupted => log::warn!("Interrupted"),
        PipelineError::AlreadyFailed(error) => log::debug!("Stopped after an earlier error: {}", error),
        error => {
            log::error!("Bridge failed: {}", error);
            latest_error.set(error);
        }
    }
}

impl std::fmt::Debug for StreamBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBridge")
            .field("options", &self.options)
            .field("video", &self.video)
            .field("has_output", &self.output.is_some())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Iterator over decoded frames, created by [`StreamBridge::recv`].
///
/// Transient engine errors are retried after a short pause. The iterator
/// ends at end of stream or once consecutive flush markers reach the
/// configured threshold; other errors are yielded once, then it ends.
pub struct FrameIter<'a> {
    bridge: &'a mut StreamBridge,
    finished: bool,
}

impl Iterator for FrameIter<'_> {
    type Item = Result<Frame, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(frame) = self.bridge.pending.pop_front() {
                return Some(Ok(frame));
            }
            match self.bridge.pull() {
                Ok(()) => {}
                Err(error) if error.is_transient() => thread::sleep(RETRY_WAIT),
                Err(error) if error.is_end_of_stream() => {
                    self.finished = true;
                    return None;
                }
                Err(error) => {
                    self.finished = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

/// Async consumer of an [`AsyncBridge`].
#[async_trait]
pub trait ImageHandler: Send + Sync {
    /// Called before the input is opened.
    async fn on_open(&self) -> CallbackResult {
        Ok(())
    }

    /// Called after the bridge was closed.
    async fn on_close(&self) -> CallbackResult {
        Ok(())
    }

    /// Process one frame. A returned image is encoded to the output.
    async fn on_image(&self, image: RgbImage) -> Result<Option<RgbImage>, CallbackError>;
}

/// Runs a [`StreamBridge`] on a blocking thread and feeds an async
/// [`ImageHandler`].
pub struct AsyncBridge {
    options: BridgeOptions,
    engine: Arc<dyn MediaEngine>,
    handler: Arc<dyn ImageHandler>,
    counter: Arc<PubSubCounter>,
    latest_error: StickyError,
    done: CancellationToken,
}

impl AsyncBridge {
    /// A bridge using the FFmpeg engine.
    pub fn new(options: BridgeOptions, handler: impl ImageHandler + 'static) -> Self {
        Self {
            options,
            engine: Arc::new(FfmpegEngine::new()),
            handler: Arc::new(handler),
            counter: Arc::new(PubSubCounter::default()),
            latest_error: StickyError::new(),
            done: CancellationToken::new(),
        }
    }

    /// Use a custom media engine.
    pub fn with_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Frames submitted to the handler.
    pub fn submitted(&self) -> u64 {
        self.counter.published()
    }

    /// Frames the handler finished.
    pub fn completed(&self) -> u64 {
        self.counter.completed()
    }

    /// Frames discarded by the slow-consumer policy.
    pub fn dropped(&self) -> u64 {
        self.counter.dropped()
    }

    /// The first fatal error of either side.
    pub fn latest_error(&self) -> Option<Arc<PipelineError>> {
        self.latest_error.get()
    }

    /// Ask the blocking loop to stop at its next check.
    pub fn done(&self) {
        self.done.cancel();
    }

    /// Open the bridge, run it until it ends and close it.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::NoRuntime`] outside a tokio runtime.
    /// - [`PipelineError::Callback`] if `on_open` fails.
    /// - The open error, or the fatal error that ended the loop.
    pub async fn run(&self) -> Result<(), PipelineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        self.handler
            .on_open()
            .await
            .map_err(|e| PipelineError::Callback(format!("on_open: {e}")))?;

        let (frames, mut frame_receiver) = mpsc::channel::<RgbImage>(self.options.channel_capacity.max(1));
        let (results, result_receiver) = std_mpsc::channel::<RgbImage>();

        let driver = Driver {
            engine: self.engine.clone(),
            options: self.options.clone(),
            counter: self.counter.clone(),
            latest_error: self.latest_error.clone(),
            done: self.done.clone(),
            frames: Some(frames),
            results: result_receiver,
        };
        let worker = runtime.spawn_blocking(move || driver.drive());

        let mut tasks = JoinSet::new();
        while let Some(image) = frame_receiver.recv().await {
            while tasks.try_join_next().is_some() {}
            let handler = self.handler.clone();
            let counter = self.counter.clone();
            let latest_error = self.latest_error.clone();
            let results = results.clone();
            tasks.spawn(async move {
                match handler.on_image(image).await {
                    Ok(Some(processed)) => {
                        let _ = results.send(processed);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        log::error!("Image handler failed: {}", error);
                        latest_error.set(PipelineError::Callback(error.to_string()));
                    }
                }
                counter.complete();
            });
        }
        // The driver drains results until every sender is gone, so the last
        // processed frames reach the output before it closes.
        let drained = tokio::time::timeout(self.options.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(error) = joined {
                    log::error!("Image handler task failed: {}", error);
                }
            }
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "Aborting {} image handler(s) still running after {:?}",
                tasks.len(),
                self.options.drain_timeout
            );
            tasks.shutdown().await;
        }
        drop(results);

        let result = worker.await.unwrap_or(Err(PipelineError::WorkerPanicked));
        if let Err(error) = self.handler.on_close().await {
            log::warn!("on_close failed: {}", error);
        }
        result
    }
}

impl std::fmt::Debug for AsyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBridge")
            .field("options", &self.options)
            .field("counter", &self.counter)
            .field("latest_error", &self.latest_error)
            .finish_non_exhaustive()
    }
}

struct Driver {
    engine: Arc<dyn MediaEngine>,
    options: BridgeOptions,
    counter: Arc<PubSubCounter>,
    latest_error: StickyError,
    done: CancellationToken,
    frames: Option<mpsc::Sender<RgbImage>>,
    results: std_mpsc::Receiver<RgbImage>,
}

impl Driver {
    fn drive(mut self) -> Result<(), PipelineError> {
        let mut bridge = StreamBridge::open_with_engine(&*self.engine, self.options.clone())?;
        bridge.share_state(self.done.clone(), self.latest_error.clone());

        let exit = loop {
            if let Err(error) = self.step(&mut bridge) {
                break error;
            }
        };

        let result = match exit {
            PipelineError::EndOfStream | PipelineError::Interrupted => Ok(()),
            PipelineError::AlreadyFailed(error) => Err(PipelineError::AlreadyFailed(error)),
            error => {
                let shared = Arc::new(error);
                self.latest_error.slot.get_or_init(|| shared.clone());
                Err(PipelineError::AlreadyFailed(shared))
            }
        };
        if let Err(error) = &result {
            log::error!("Bridge failed: {}", error);
        }

        // Ends the consumer loop; handlers still in flight keep their result
        // senders until they finish.
        self.frames.take();
        for image in self.results.iter() {
            if self.latest_error.is_set() {
                continue;
            }
            if let Err(error) = bridge.send(&image) {
                self.latest_error.set(error);
            }
        }
        if let Err(error) = bridge.close() {
            log::warn!("Failed to close the bridge: {}", error);
        }
        log::info!(
            "Bridge finished (submitted={}, completed={}, dropped={})",
            self.counter.published(),
            self.counter.completed(),
            self.counter.dropped(),
        );
        result
    }

    fn send_results(&self, bridge: &mut StreamBridge) {
        if self.latest_error.is_set() {
            return;
        }
        while let Ok(image) = self.results.try_recv() {
            if let Err(error) = bridge.send(&image) {
                self.latest_error.set(error);
                return;
            }
        }
    }

    fn step(&self, bridge: &mut StreamBridge) -> Result<(), PipelineError> {
        if let Some(error) = self.latest_error.get() {
            return Err(PipelineError::AlreadyFailed(error));
        }
        if self.done.is_cancelled() {
            return Err(PipelineError::Interrupted);
        }
        self.send_results(bridge);

        let frame = bridge.recv().next().ok_or(PipelineError::EndOfStream)??;
        let image = bridge.frame_to_image(&frame)?;

        let outstanding = self.counter.outstanding();
        if outstanding >= self.options.drop_threshold as u64 {
            if self.options.drop_slow_frame {
                log::debug!("Dropping frame, {} still outstanding", outstanding);
                self.counter.drop_frame();
                self.options.metrics.on_frame_dropped(DropReason::SlowConsumer);
                return Ok(());
            }
            log::warn!("Slow consumer: {} frames outstanding", outstanding);
        }

        let frames = self.frames.as_ref().ok_or(PipelineError::Interrupted)?;
        self.counter.publish();
        frames
            .blocking_send(image)
            .map_err(|_| PipelineError::Interrupted)
    }
}
