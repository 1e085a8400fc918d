//! The blocking worker loop of a [`Player`](crate::Player).
//!
//! One OS thread per run owns the input and output containers from open to
//! close. It demuxes packets, decodes them, rebases timestamps, fills the
//! frame collections, fires callbacks, re-muxes packets to the destination
//! and hands finished HLS segments to the archive.
//!
//! Setup happens on the worker thread too; its outcome is reported back to
//! [`spawn`] before the loop starts, so open errors surface from
//! `Player::open` and never reach the callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::archive::{ArchivedSegment, SegmentArchiver};
use crate::callbacks::{Dispatcher, MediaCallbacks, MediaEvent};
use crate::configuration::{Destination, MediaOptions, is_realtime_format};
use crate::engine::{
    AudioResampler, CodecHints, InputContainer, InputSettings, MediaEngine, OutputContainer,
    OutputSettings, StreamInfo,
};
use crate::error::PipelineError;
use crate::frame::{AudioFormat, Frame, FrameData, MediaKind, Packet};
use crate::frame_collection::FrameCollection;
use crate::metrics::{CancellationToken, MetricsSink, Step, timed};
use crate::timestamps::{AudioChunker, FrameRebaser, PacketRebaser};

/// Pause before retrying after a transient engine error.
const RETRY_WAIT: Duration = Duration::from_millis(1);

/// Audio packetization interval.
const AUDIO_CHUNK_MILLIS: u32 = 20;

/// How far decoding may run ahead of the wall clock when throttled.
const THROTTLE_LEAD_SECONDS: f64 = 1.0;

/// Sleep applied per frame while decoding is ahead of the wall clock.
const THROTTLE_SLEEP: Duration = Duration::from_millis(100);

/// Progress of one run, observable through [`Player::phase`](crate::Player::phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    /// Containers are being opened.
    Opening,
    /// The container-begin callback fired; packets are flowing.
    Running,
    /// The loop exited and every resource of the run was released.
    Finished,
}

/// Everything a worker thread needs to run one session.
pub(crate) struct WorkerConfig {
    pub(crate) engine: Arc<dyn MediaEngine>,
    pub(crate) address: String,
    pub(crate) destination: Option<Destination>,
    pub(crate) options: MediaOptions,
    pub(crate) callbacks: Option<MediaCallbacks>,
    pub(crate) runtime: Option<Handle>,
    pub(crate) quit: CancellationToken,
    pub(crate) phase: watch::Sender<RunPhase>,
    pub(crate) label: String,
}

/// What the caller of [`spawn`] learns once setup succeeded.
#[derive(Debug, Clone)]
pub(crate) struct Ready {
    pub(crate) video: Option<FrameCollection>,
    pub(crate) audio: Option<FrameCollection>,
    pub(crate) throttle: bool,
    pub(crate) format_name: String,
    /// Set once the container-begin callback succeeded. Stays set after the
    /// run finished.
    pub(crate) began: Arc<AtomicBool>,
}

/// Start a worker thread and wait until its containers are open.
///
/// # Errors
///
/// Any setup error, after the thread has been joined.
pub(crate) fn spawn(
    config: WorkerConfig,
) -> Result<(JoinHandle<Result<(), PipelineError>>, Ready), PipelineError> {
    let (ready_sender, ready_receiver) = sync_channel(1);
    let thread_name = format!("framepipe-{}", config.label);

    let handle = thread::Builder::new()
        .name(thread_name)
        .spawn(move || run(config, ready_sender))?;

    match ready_receiver.recv() {
        Ok(Ok(ready)) => Ok((handle, ready)),
        Ok(Err(error)) => {
            let _ = handle.join();
            Err(error)
        }
        Err(_) => {
            let _ = handle.join();
            Err(PipelineError::WorkerPanicked)
        }
    }
}

fn run(
    config: WorkerConfig,
    ready: SyncSender<Result<Ready, PipelineError>>,
) -> Result<(), PipelineError> {
    let session = match Session::open(config) {
        Ok(session) => session,
        Err(error) => {
            let _ = ready.send(Err(error));
            return Ok(());
        }
    };
    let _ = ready.send(Ok(session.ready()));
    session.run()
}

struct VideoTrack {
    index: usize,
    collection: FrameCollection,
    rebaser: FrameRebaser,
}

struct AudioTrack {
    index: usize,
    collection: FrameCollection,
    resampler: Option<(AudioFormat, Box<dyn AudioResampler>)>,
    chunker: AudioChunker,
}

struct Session {
    label: String,
    engine: Arc<dyn MediaEngine>,
    input: Box<dyn InputContainer>,
    format_name: String,
    output: Option<Box<dyn OutputContainer>>,
    output_map: HashMap<usize, usize>,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    packet_rebaser: PacketRebaser,
    archiver: Option<SegmentArchiver>,
    dispatcher: Dispatcher,
    quit: CancellationToken,
    phase: watch::Sender<RunPhase>,
    began: Arc<AtomicBool>,
    metrics: Arc<dyn MetricsSink>,
    flush_threshold: usize,
    flush_count: usize,
    throttle: bool,
    clock: Instant,
    started_at: DateTime<Local>,
    prev_frame_time: Option<f64>,
}

fn select_stream(streams: &[StreamInfo], kind: MediaKind, nth: Option<usize>) -> Option<usize> {
    let nth = nth?;
    streams
        .iter()
        .filter(|stream| stream.kind == Some(kind))
        .nth(nth)
        .map(|stream| stream.index)
}

impl Session {
    fn open(config: WorkerConfig) -> Result<Self, PipelineError> {
        let WorkerConfig {
            engine,
            address,
            destination,
            options,
            callbacks,
            runtime,
            quit,
            phase,
            label,
        } = config;
        let metrics = options.metrics.clone();

        let (dispatcher, _forwarder) = Dispatcher::new(
            callbacks.as_ref(),
            runtime.as_ref(),
            options.callback_queue,
            metrics.clone(),
            quit.clone(),
        )?;

        log::debug!("{} Opening input container (address='{}')", label, address);
        let input_settings = InputSettings {
            format: options.format.clone(),
            options: options.input_options.clone(),
            buffer_size: options.buffer_size,
            timeout: options.timeout,
        };
        let mut input = engine.open_input(&address, &input_settings)?;
        let format_name = input.format_name();

        let streams = input.streams();
        let video_index = select_stream(&streams, MediaKind::Video, options.video_index);
        let audio_index = select_stream(&streams, MediaKind::Audio, options.audio_index);
        if video_index.is_none() && audio_index.is_none() {
            return Err(PipelineError::Open {
                address,
                reason: "no selectable video or audio stream".to_string(),
            });
        }

        let hints = CodecHints {
            go_faster: options.go_faster,
            low_delay: options.low_delay,
        };
        let video = match video_index {
            Some(index) => {
                input.open_decoder(index, hints)?;
                Some(VideoTrack {
                    index,
                    collection: FrameCollection::with_metrics(
                        MediaKind::Video,
                        options.max_frame_queue,
                        metrics.clone(),
                    ),
                    rebaser: FrameRebaser::default(),
                })
            }
            None => None,
        };
        let audio = match audio_index {
            Some(index) => {
                input.open_decoder(index, hints)?;
                let format = AudioFormat::STEREO_48K;
                Some(AudioTrack {
                    index,
                    collection: FrameCollection::with_metrics(
                        MediaKind::Audio,
                        options.max_frame_queue,
                        metrics.clone(),
                    ),
                    resampler: None,
                    chunker: AudioChunker::new(format, format.samples_for_millis(AUDIO_CHUNK_MILLIS)),
                })
            }
            None => None,
        };

        let started_at = Local::now();
        let archiver = destination
            .as_ref()
            .and_then(Destination::hls)
            .map(|hls| SegmentArchiver::new(hls.clone(), started_at));
        if let Some(archiver) = &archiver {
            archiver.clear_cache()?;
        }

        let mut output_map = HashMap::new();
        let output = match &destination {
            Some(destination) => {
                let (target, settings) = match destination {
                    Destination::File(path) => (
                        path.to_string_lossy().into_owned(),
                        OutputSettings {
                            format: None,
                            options: options.output_options.clone(),
                        },
                    ),
                    Destination::Hls(hls) => {
                        let mut muxer_options = hls.muxer_options();
                        muxer_options.extend(options.output_options.clone());
                        (
                            hls.master_path().to_string_lossy().into_owned(),
                            OutputSettings {
                                format: Some("hls".to_string()),
                                options: muxer_options,
                            },
                        )
                    }
                };
                log::debug!("{} Opening output container ({})", label, target);
                let mut output = engine.open_output(&target, &settings)?;
                for index in video_index.iter().chain(audio_index.iter()) {
                    let template = input.stream_template(*index)?;
                    output_map.insert(*index, output.add_stream(&template)?);
                }
                Some(output)
            }
            None => None,
        };

        let throttle = !is_realtime_format(&format_name);
        log::info!(
            "{} Session ready (format='{}', video={:?}, audio={:?}, throttle={})",
            label, format_name, video_index, audio_index, throttle,
        );

        Ok(Self {
            label,
            engine,
            input,
            format_name,
            output,
            output_map,
            video,
            audio,
            packet_rebaser: PacketRebaser::default(),
            archiver,
            dispatcher,
            quit,
            phase,
            began: Arc::new(AtomicBool::new(false)),
            metrics,
            flush_threshold: options.flush_threshold,
            flush_count: 0,
            throttle,
            clock: Instant::now(),
            started_at,
            prev_frame_time: None,
        })
    }

    fn ready(&self) -> Ready {
        Ready {
            video: self.video.as_ref().map(|track| track.collection.clone()),
            audio: self.audio.as_ref().map(|track| track.collection.clone()),
            throttle: self.throttle,
            format_name: self.format_name.clone(),
            began: self.began.clone(),
        }
    }

    fn run(mut self) -> Result<(), PipelineError> {
        let outcome = self.begin().and_then(|()| self.main_loop());
        let result = match outcome {
            Err(error) if error.is_interrupted() => {
                log::info!("{} Interrupt signal detected", self.label);
                Ok(())
            }
            Err(error) if error.is_end_of_stream() => {
                log::info!("{} End of stream", self.label);
                Ok(())
            }
            Err(error) => {
                log::error!("{} Run failed: {}", self.label, error);
                Err(error)
            }
            Ok(()) => Ok(()),
        };

        self.teardown();

        let Session {
            label,
            input,
            video,
            audio,
            dispatcher,
            phase,
            ..
        } = self;

        if let Err(error) = dispatcher.dispatch(MediaEvent::ContainerEnd) {
            log::error!("{} {}", label, error);
        }
        if let Some(track) = &video {
            track.collection.close();
        }
        if let Some(track) = &audio {
            track.collection.close();
        }
        drop(input);
        drop(dispatcher);
        phase.send_replace(RunPhase::Finished);
        log::debug!("{} The main loop is complete", label);
        result
    }

    fn begin(&mut self) -> Result<(), PipelineError> {
        self.dispatcher.dispatch(MediaEvent::ContainerBegin)?;
        self.began.store(true, Ordering::SeqCst);
        self.phase.send_replace(RunPhase::Running);
        log::debug!("{} Run the main loop ...", self.label);
        Ok(())
    }

    fn check_quit(&self) -> Result<(), PipelineError> {
        if self.quit.is_cancelled() {
            return Err(PipelineError::Interrupted);
        }
        Ok(())
    }

    fn main_loop(&mut self) -> Result<(), PipelineError> {
        loop {
            self.check_quit()?;
            let iteration = Instant::now();

            let packet = match timed(&*self.metrics, Step::Demux, || self.input.read_packet()) {
                Ok(packet) => packet,
                Err(error) if error.is_transient() => {
                    thread::sleep(RETRY_WAIT);
                    continue;
                }
                Err(error) => return Err(error),
            };

            if packet.is_flush_marker() {
                self.flush_count += 1;
                log::debug!(
                    "{} Skipping flush packet, shutdown count: {}/{}",
                    self.label, self.flush_count, self.flush_threshold,
                );
                if self.flush_count > self.flush_threshold {
                    return Err(PipelineError::EndOfStream);
                }
                continue;
            }
            self.flush_count = 0;

            let last = Local::now();
            self.process_packet(packet, last)?;
            self.metrics.on_step(Step::Iteration, iteration.elapsed());
        }
    }

    fn segment_start(&self) -> DateTime<Local> {
        self.archiver
            .as_ref()
            .map_or(self.started_at, SegmentArchiver::segment_start)
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, PipelineError> {
        loop {
            match timed(&*self.metrics, Step::Decode, || self.input.decode(packet)) {
                Err(error) if error.is_transient() => {
                    self.check_quit()?;
                    thread::sleep(RETRY_WAIT);
                }
                other => return other,
            }
        }
    }

    fn process_packet(&mut self, mut packet: Packet, last: DateTime<Local>) -> Result<(), PipelineError> {
        let start = self.segment_start();

        for frame in self.decode(&packet)? {
            self.throttle_wait();
            match frame.kind() {
                MediaKind::Video => self.on_video_frame(frame, start, last)?,
                MediaKind::Audio => self.on_audio_frame(frame, start, last)?,
            }
            self.check_quit()?;
        }

        let Some(&output_index) = self.output_map.get(&packet.stream) else {
            return Ok(());
        };
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };

        self.packet_rebaser.rebase(&mut packet);
        packet.stream = output_index;
        if let Err(error) = timed(&*self.metrics, Step::Mux, || output.mux(packet)) {
            log::error!("{} A muxing error in the output container: {}", self.label, error);
        }

        let archived = match self.archiver.as_mut() {
            Some(archiver) => archiver.poll(last)?,
            None => Vec::new(),
        };
        for segment in archived {
            self.dispatcher.dispatch(segment_event(segment))?;
        }
        Ok(())
    }

    fn throttle_wait(&self) {
        if !self.throttle {
            return;
        }
        if let Some(frame_time) = self.prev_frame_time {
            let elapsed = self.clock.elapsed().as_secs_f64();
            if frame_time > elapsed + THROTTLE_LEAD_SECONDS {
                thread::sleep(THROTTLE_SLEEP);
            }
        }
    }

    fn on_video_frame(
        &mut self,
        mut frame: Frame,
        start: DateTime<Local>,
        last: DateTime<Local>,
    ) -> Result<(), PipelineError> {
        let Some(track) = self.video.as_mut() else {
            return Ok(());
        };
        let Some(pts) = frame.pts() else {
            log::warn!("{} Skipping video frame with no pts (stream {})", self.label, track.index);
            return Ok(());
        };

        let time_base = frame.time_base();
        frame.set_timing(Some(track.rebaser.rebase(pts)), time_base);
        self.prev_frame_time = frame.time();

        if let FrameData::Video(image) = track.collection.update_newest_and_put(frame)? {
            self.dispatcher
                .dispatch(MediaEvent::VideoFrame { image, start, last })?;
        }
        Ok(())
    }

    fn on_audio_frame(
        &mut self,
        frame: Frame,
        start: DateTime<Local>,
        last: DateTime<Local>,
    ) -> Result<(), PipelineError> {
        let Some(track) = self.audio.as_mut() else {
            return Ok(());
        };
        let Some(samples) = frame.as_audio() else {
            return Ok(());
        };

        let format = samples.format();
        if format == AudioFormat::STEREO_48K {
            track.chunker.write(samples);
        } else {
            if track.resampler.as_ref().map(|(from, _)| *from) != Some(format) {
                log::debug!(
                    "{} Resampling audio stream {} from {:?}",
                    self.label, track.index, format,
                );
                let resampler = self.engine.create_resampler(format, AudioFormat::STEREO_48K)?;
                track.resampler = Some((format, resampler));
            }
            if let Some((_, resampler)) = track.resampler.as_mut() {
                let converted = resampler.resample(samples)?;
                track.chunker.write(&converted);
            }
        }

        while let Some((chunk, pts)) = track.chunker.read() {
            let chunk = Frame::audio(chunk, Some(pts), track.chunker.time_base());
            self.prev_frame_time = chunk.time();
            if let FrameData::Audio(samples) = track.collection.update_newest_and_put(chunk)? {
                self.dispatcher
                    .dispatch(MediaEvent::AudioFrame { samples, start, last })?;
            }
        }
        Ok(())
    }

    /// Drain encoders, close the output and archive what is left.
    /// Errors are logged; teardown never fails.
    fn teardown(&mut self) {
        if let Some(mut output) = self.output.take() {
            for index in 0..output.stream_count() {
                match output.encode(index, None) {
                    Ok(packets) => {
                        for packet in packets {
                            if let Err(error) = output.mux(packet) {
                                log::warn!("{} Failed to mux flushed packet: {}", self.label, error);
                            }
                        }
                    }
                    Err(error) => {
                        log::warn!("{} Failed to flush output stream {}: {}", self.label, index, error);
                    }
                }
            }
            if let Err(error) = output.close() {
                log::error!("{} Failed to close the output container: {}", self.label, error);
            }
        }

        let Some(archiver) = self.archiver.as_mut() else {
            return;
        };
        match archiver.finish(Local::now()) {
            Ok(segments) => {
                for segment in segments {
                    if let Err(error) = self.dispatcher.dispatch(segment_event(segment)) {
                        log::error!("{} {}", self.label, error);
                    }
                }
            }
            Err(error) => log::error!("{} Failed to archive the last segment: {}", self.label, error),
        }
    }
}

fn segment_event(segment: ArchivedSegment) -> MediaEvent {
    MediaEvent::SegmentComplete {
        directory: segment.directory,
        filename: segment.filename,
        start: segment.start,
        last: segment.last,
    }
}
