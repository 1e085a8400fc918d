//! A scripted, in-memory media engine shared by the integration tests.
//!
//! Inputs replay a fixed list of steps (packets with the frames they decode
//! to, transient errors, flush markers, failures). Outputs record what was
//! muxed and can drop fake HLS segment files into a scratch directory.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use framepipe::{
    AudioFormat, AudioResampler, AudioSamples, CodecHints, Frame, InputContainer, InputSettings,
    MediaEngine, MediaKind, OutputContainer, OutputSettings, Packet, PipelineError, Rational,
    StreamInfo, StreamTemplate, VideoEncoderSettings,
};
use image::RgbImage;

pub const VIDEO_TIME_BASE: Rational = Rational(1, 90_000);
pub const VIDEO_TICKS_PER_FRAME: i64 = 3_000;

pub fn video_stream(index: usize) -> StreamInfo {
    StreamInfo {
        index,
        kind: Some(MediaKind::Video),
        time_base: VIDEO_TIME_BASE,
        codec: "synthetic".to_string(),
        width: 8,
        height: 6,
        frame_rate: Some(Rational(30, 1)),
        sample_rate: 0,
        channels: 0,
    }
}

pub fn audio_stream(index: usize, format: AudioFormat) -> StreamInfo {
    StreamInfo {
        index,
        kind: Some(MediaKind::Audio),
        time_base: Rational(1, format.sample_rate as i32),
        codec: "synthetic".to_string(),
        width: 0,
        height: 0,
        frame_rate: None,
        sample_rate: format.sample_rate,
        channels: format.channels,
    }
}

/// An 8x6 image whose first pixel encodes `seed`.
pub fn test_image(seed: u8) -> RgbImage {
    let mut image = RgbImage::new(8, 6);
    image.put_pixel(0, 0, image::Rgb([seed, 0, 0]));
    image
}

/// What a scripted input does on one `read_packet` call.
pub enum Step {
    Packet { packet: Packet, frames: Vec<Frame> },
    Again,
    Fail(fn() -> PipelineError),
}

fn packet(stream: usize, kind: MediaKind, ts: i64, time_base: Rational) -> Packet {
    Packet {
        stream,
        kind,
        pts: Some(ts),
        dts: Some(ts),
        duration: 0,
        time_base,
        is_key: true,
        data: vec![0; 4],
    }
}

/// A video packet at `ts` decoding to one frame stamped `ts`.
pub fn video_step(stream: usize, ts: i64, seed: u8) -> Step {
    Step::Packet {
        packet: packet(stream, MediaKind::Video, ts, VIDEO_TIME_BASE),
        frames: vec![Frame::video(test_image(seed), Some(ts), VIDEO_TIME_BASE)],
    }
}

/// A video packet whose frame carries no timestamp.
pub fn untimed_video_step(stream: usize, ts: i64) -> Step {
    Step::Packet {
        packet: packet(stream, MediaKind::Video, ts, VIDEO_TIME_BASE),
        frames: vec![Frame::video(test_image(0), None, VIDEO_TIME_BASE)],
    }
}

/// An audio packet decoding to `samples_per_channel` samples of `format`.
pub fn audio_step(stream: usize, ts: i64, format: AudioFormat, samples_per_channel: usize) -> Step {
    let time_base = Rational(1, format.sample_rate as i32);
    let data = vec![7; samples_per_channel * format.channels as usize];
    Step::Packet {
        packet: packet(stream, MediaKind::Audio, ts, time_base),
        frames: vec![Frame::audio(AudioSamples::new(format, data), Some(ts), time_base)],
    }
}

pub fn flush_step(stream: usize, kind: MediaKind) -> Step {
    Step::Packet {
        packet: Packet::flush_marker(stream, kind, VIDEO_TIME_BASE),
        frames: Vec::new(),
    }
}

/// `count` consecutive video frames starting at timestamp `first`.
pub fn video_steps(stream: usize, first: i64, count: usize) -> Vec<Step> {
    (0..count)
        .map(|i| video_step(stream, first + i as i64 * VIDEO_TICKS_PER_FRAME, i as u8))
        .collect()
}

/// Script of one input container.
pub struct Script {
    pub format_name: String,
    pub streams: Vec<StreamInfo>,
    pub steps: Vec<Step>,
    /// Pause before every packet.
    pub packet_delay: Duration,
    /// When the steps run out: `true` keeps returning `Again`, `false`
    /// reports end of stream.
    pub hold_open: bool,
}

impl Script {
    pub fn new(format_name: &str, streams: Vec<StreamInfo>, steps: Vec<Step>) -> Self {
        Self {
            format_name: format_name.to_string(),
            streams,
            steps,
            packet_delay: Duration::ZERO,
            hold_open: false,
        }
    }

    pub fn with_packet_delay(mut self, delay: Duration) -> Self {
        self.packet_delay = delay;
        self
    }

    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

/// Everything the engine observed, shared with the test.
#[derive(Debug, Default)]
pub struct Journal {
    pub opened_inputs: Vec<String>,
    pub input_settings: Vec<InputSettings>,
    pub decoders: Vec<(usize, CodecHints)>,
    pub opened_outputs: Vec<(String, OutputSettings)>,
    pub stream_templates: Vec<StreamInfo>,
    pub encoders: Vec<VideoEncoderSettings>,
    pub muxed: Vec<Packet>,
    pub encoded_frames: usize,
    pub flushed_streams: Vec<usize>,
    pub output_closed: usize,
    pub resamplers: Vec<(AudioFormat, AudioFormat)>,
}

type ScriptFactory = Box<dyn Fn(usize) -> Result<Script, PipelineError> + Send + Sync>;

/// Fake HLS muxer behaviour: a new segment file every `packets` packets.
#[derive(Debug, Clone)]
pub struct SegmentWriter {
    pub directory: PathBuf,
    pub packets: usize,
}

pub struct ScriptedEngine {
    factory: ScriptFactory,
    attempts: AtomicUsize,
    journal: Arc<Mutex<Journal>>,
    segments: Option<SegmentWriter>,
    mux_error: Option<fn() -> PipelineError>,
}

impl ScriptedEngine {
    /// Every open replays the script built by `factory(attempt)`.
    pub fn new(factory: impl Fn(usize) -> Result<Script, PipelineError> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            attempts: AtomicUsize::new(0),
            journal: Arc::new(Mutex::new(Journal::default())),
            segments: None,
            mux_error: None,
        }
    }

    pub fn with_segments(mut self, directory: impl Into<PathBuf>, packets: usize) -> Self {
        self.segments = Some(SegmentWriter {
            directory: directory.into(),
            packets,
        });
        self
    }

    pub fn with_mux_error(mut self, error: fn() -> PipelineError) -> Self {
        self.mux_error = Some(error);
        self
    }

    pub fn journal(&self) -> Arc<Mutex<Journal>> {
        self.journal.clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MediaEngine for ScriptedEngine {
    fn open_input(
        &self,
        address: &str,
        settings: &InputSettings,
    ) -> Result<Box<dyn InputContainer>, PipelineError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut journal = self.journal.lock().unwrap();
            journal.opened_inputs.push(address.to_string());
            journal.input_settings.push(settings.clone());
        }
        let script = (self.factory)(attempt)?;
        Ok(Box::new(ScriptedInput {
            steps: script.steps.into_iter().collect(),
            script_format: script.format_name,
            streams: script.streams,
            packet_delay: script.packet_delay,
            hold_open: script.hold_open,
            decoded: Vec::new(),
            journal: self.journal.clone(),
        }))
    }

    fn open_output(
        &self,
        address: &str,
        settings: &OutputSettings,
    ) -> Result<Box<dyn OutputContainer>, PipelineError> {
        self.journal
            .lock()
            .unwrap()
            .opened_outputs
            .push((address.to_string(), settings.clone()));
        Ok(Box::new(RecordingOutput {
            streams: Vec::new(),
            segments: self.segments.clone(),
            mux_error: self.mux_error,
            packets: 0,
            segment_count: 0,
            closed: false,
            journal: self.journal.clone(),
        }))
    }

    fn create_resampler(
        &self,
        from: AudioFormat,
        to: AudioFormat,
    ) -> Result<Box<dyn AudioResampler>, PipelineError> {
        self.journal.lock().unwrap().resamplers.push((from, to));
        Ok(Box::new(NearestResampler { from, to }))
    }
}

struct ScriptedInput {
    script_format: String,
    streams: Vec<StreamInfo>,
    steps: VecDeque<Step>,
    packet_delay: Duration,
    hold_open: bool,
    decoded: Vec<Frame>,
    journal: Arc<Mutex<Journal>>,
}

impl InputContainer for ScriptedInput {
    fn format_name(&self) -> String {
        self.script_format.clone()
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn stream_template(&self, index: usize) -> Result<StreamTemplate, PipelineError> {
        self.streams
            .iter()
            .find(|stream| stream.index == index)
            .cloned()
            .map(StreamTemplate::new)
            .ok_or(PipelineError::StreamNotFound { index })
    }

    fn open_decoder(&mut self, index: usize, hints: CodecHints) -> Result<(), PipelineError> {
        self.journal.lock().unwrap().decoders.push((index, hints));
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Packet, PipelineError> {
        if !self.packet_delay.is_zero() {
            thread::sleep(self.packet_delay);
        }
        match self.steps.pop_front() {
            Some(Step::Packet { packet, frames }) => {
                self.decoded = frames;
                Ok(packet)
            }
            Some(Step::Again) => Err(PipelineError::Again),
            Some(Step::Fail(error)) => Err(error()),
            None if self.hold_open => {
                thread::sleep(Duration::from_millis(1));
                Err(PipelineError::Again)
            }
            None => Err(PipelineError::EndOfStream),
        }
    }

    fn decode(&mut self, _packet: &Packet) -> Result<Vec<Frame>, PipelineError> {
        Ok(std::mem::take(&mut self.decoded))
    }
}

struct RecordingOutput {
    streams: Vec<bool>,
    segments: Option<SegmentWriter>,
    mux_error: Option<fn() -> PipelineError>,
    packets: usize,
    segment_count: usize,
    closed: bool,
    journal: Arc<Mutex<Journal>>,
}

impl RecordingOutput {
    fn rotate_segment(&mut self) -> Result<(), PipelineError> {
        let Some(writer) = &self.segments else {
            return Ok(());
        };
        if self.packets % writer.packets.max(1) == 0 {
            self.segment_count += 1;
            let name = format!("segment-{:05}.ts", self.segment_count);
            fs::write(writer.directory.join(name), format!("segment-{}", self.segment_count))?;
        }
        Ok(())
    }
}

impl OutputContainer for RecordingOutput {
    fn add_stream(&mut self, template: &StreamTemplate) -> Result<usize, PipelineError> {
        self.journal.lock().unwrap().stream_templates.push(template.info.clone());
        self.streams.push(false);
        Ok(self.streams.len() - 1)
    }

    fn add_video_encoder(&mut self, settings: &VideoEncoderSettings) -> Result<usize, PipelineError> {
        self.journal.lock().unwrap().encoders.push(settings.clone());
        self.streams.push(true);
        Ok(self.streams.len() - 1)
    }

    fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn write_header(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn encode(&mut self, stream: usize, frame: Option<&Frame>) -> Result<Vec<Packet>, PipelineError> {
        let encodes = *self
            .streams
            .get(stream)
            .ok_or(PipelineError::StreamNotFound { index: stream })?;
        let mut journal = self.journal.lock().unwrap();
        match frame {
            None => {
                journal.flushed_streams.push(stream);
                Ok(Vec::new())
            }
            Some(_) if !encodes => Ok(Vec::new()),
            Some(_) => {
                let pts = journal.encoded_frames as i64;
                journal.encoded_frames += 1;
                Ok(vec![Packet {
                    stream,
                    kind: MediaKind::Video,
                    pts: Some(pts),
                    dts: Some(pts),
                    duration: 1,
                    time_base: Rational(1, 30),
                    is_key: true,
                    data: vec![1],
                }])
            }
        }
    }

    fn mux(&mut self, packet: Packet) -> Result<(), PipelineError> {
        if let Some(error) = self.mux_error {
            return Err(error());
        }
        self.rotate_segment()?;
        self.packets += 1;
        self.journal.lock().unwrap().muxed.push(packet);
        Ok(())
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        if !self.closed {
            self.closed = true;
            self.journal.lock().unwrap().output_closed += 1;
        }
        Ok(())
    }
}

struct NearestResampler {
    from: AudioFormat,
    to: AudioFormat,
}

impl AudioResampler for NearestResampler {
    fn resample(&mut self, samples: &AudioSamples) -> Result<AudioSamples, PipelineError> {
        let in_frames = samples.samples_per_channel();
        let out_frames = in_frames * self.to.sample_rate as usize / self.from.sample_rate as usize;
        let from_channels = self.from.channels as usize;
        let mut data = Vec::with_capacity(out_frames * self.to.channels as usize);
        for i in 0..out_frames {
            let source = i * self.from.sample_rate as usize / self.to.sample_rate as usize;
            for channel in 0..self.to.channels as usize {
                data.push(samples.data[source * from_channels + channel.min(from_channels - 1)]);
            }
        }
        Ok(AudioSamples::new(self.to, data))
    }
}

/// Poll `condition` every millisecond for up to `limit`.
pub fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + limit;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
