//! The media engine contract.
//!
//! The pipeline never implements codec or container logic itself. It
//! sequences calls on the traits in this module and manages the lifetime of
//! what they return. [`FfmpegEngine`](crate::FfmpegEngine) is the production
//! implementation; tests drive the pipeline with synthetic engines.
//!
//! Containers are opened, used and closed on one thread (the worker thread
//! of a run), so only [`MediaEngine`] itself has to be [`Send`] and [`Sync`].

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};

use ffmpeg_next::Rational;

use crate::configuration::Timeout;
use crate::error::PipelineError;
use crate::frame::{AudioFormat, AudioSamples, Frame, MediaKind, Packet};

/// Description of one stream of an input container.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Index inside the container.
    pub index: usize,
    /// Track kind, `None` for data, subtitle and attachment streams.
    pub kind: Option<MediaKind>,
    /// Time base of the stream's timestamps.
    pub time_base: Rational,
    /// Codec name as reported by the engine.
    pub codec: String,
    /// Frame width (video only).
    pub width: u32,
    /// Frame height (video only).
    pub height: u32,
    /// Average frame rate (video only), if known.
    pub frame_rate: Option<Rational>,
    /// Sample rate (audio only).
    pub sample_rate: u32,
    /// Channel count (audio only).
    pub channels: u16,
}

/// What an output needs to add a stream-copy stream mirroring an input one.
///
/// `native` carries engine-specific codec parameters; it is only
/// meaningful to the engine that produced the template.
pub struct StreamTemplate {
    /// Public description of the source stream.
    pub info: StreamInfo,
    native: Option<Box<dyn Any>>,
}

impl StreamTemplate {
    /// A template without engine-specific parameters.
    pub fn new(info: StreamInfo) -> Self {
        Self { info, native: None }
    }

    /// A template carrying engine-specific parameters.
    pub fn with_native<T: Any>(info: StreamInfo, native: T) -> Self {
        Self {
            info,
            native: Some(Box::new(native)),
        }
    }

    /// Borrow the engine-specific parameters, if they are of type `T`.
    pub fn native<T: Any>(&self) -> Option<&T> {
        self.native.as_ref().and_then(|native| native.downcast_ref::<T>())
    }
}

impl Debug for StreamTemplate {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("StreamTemplate")
            .field("info", &self.info)
            .field("native", &self.native.is_some())
            .finish()
    }
}

/// Decoder tuning applied when a stream is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecHints {
    /// Trade accuracy for decode speed.
    pub go_faster: bool,
    /// Minimise decoder buffering.
    pub low_delay: bool,
}

/// How to open an input container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputSettings {
    /// Format name, `None` to probe.
    pub format: Option<String>,
    /// Demuxer options.
    pub options: BTreeMap<String, String>,
    /// I/O buffer size in bytes.
    pub buffer_size: usize,
    /// Open/read deadlines.
    pub timeout: Timeout,
}

/// How to open an output container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputSettings {
    /// Format name, `None` to infer from the address.
    pub format: Option<String>,
    /// Muxer options, applied when the header is written.
    pub options: BTreeMap<String, String>,
}

/// A video encoder stream to add to an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEncoderSettings {
    /// Encoder name, e.g. `libx264`.
    pub codec: String,
    /// Encoded width.
    pub width: u32,
    /// Encoded height.
    pub height: u32,
    /// Nominal frame rate; the encoder time base is its inverse.
    pub frame_rate: Rational,
    /// Private encoder options such as `preset` or `crf`.
    pub options: BTreeMap<String, String>,
}

impl VideoEncoderSettings {
    /// H.264 tuned for live re-streaming: `ultrafast` preset, CRF 28.
    pub fn h264(width: u32, height: u32, frame_rate: Rational) -> Self {
        Self {
            codec: "libx264".to_string(),
            width,
            height,
            frame_rate,
            options: BTreeMap::from([
                ("preset".to_string(), "ultrafast".to_string()),
                ("crf".to_string(), "28".to_string()),
            ]),
        }
    }

    /// Time base of frames handed to this encoder.
    pub fn time_base(&self) -> Rational {
        Rational::new(self.frame_rate.denominator(), self.frame_rate.numerator())
    }
}

/// Entry point of a media engine.
pub trait MediaEngine: Send + Sync {
    /// Open `address` for reading.
    fn open_input(
        &self,
        address: &str,
        settings: &InputSettings,
    ) -> Result<Box<dyn InputContainer>, PipelineError>;

    /// Open `address` for writing. Streams are added before
    /// [`OutputContainer::write_header`].
    fn open_output(
        &self,
        address: &str,
        settings: &OutputSettings,
    ) -> Result<Box<dyn OutputContainer>, PipelineError>;

    /// Create a converter between two interleaved s16 layouts.
    fn create_resampler(
        &self,
        from: AudioFormat,
        to: AudioFormat,
    ) -> Result<Box<dyn AudioResampler>, PipelineError>;
}

/// An open input container.
pub trait InputContainer {
    /// Demuxer name; may be a comma-separated list of aliases.
    fn format_name(&self) -> String;

    /// All streams in container order.
    fn streams(&self) -> Vec<StreamInfo>;

    /// A template for re-muxing stream `index` without re-encoding.
    fn stream_template(&self, index: usize) -> Result<StreamTemplate, PipelineError>;

    /// Prepare a decoder for stream `index`. Only packets of prepared
    /// streams are returned by [`read_packet`](Self::read_packet).
    fn open_decoder(&mut self, index: usize, hints: CodecHints) -> Result<(), PipelineError>;

    /// Read the next packet of a prepared stream.
    ///
    /// Returns [`PipelineError::Again`] when no data is available yet and
    /// [`PipelineError::EndOfStream`] once the input is exhausted. Packets
    /// without a `dts` are flush markers.
    fn read_packet(&mut self) -> Result<Packet, PipelineError>;

    /// Decode one packet into zero or more frames.
    ///
    /// Video frames come out as RGB24, audio frames as interleaved s16 in the
    /// stream's native rate and channel count.
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, PipelineError>;
}

/// An open output container.
pub trait OutputContainer {
    /// Add a stream-copy stream. Returns the new stream's index.
    fn add_stream(&mut self, template: &StreamTemplate) -> Result<usize, PipelineError>;

    /// Add a video encoder stream. Returns the new stream's index.
    fn add_video_encoder(&mut self, settings: &VideoEncoderSettings) -> Result<usize, PipelineError>;

    /// Number of streams added so far.
    fn stream_count(&self) -> usize;

    /// Write the container header. The first [`mux`](Self::mux) writes it
    /// if this was not called.
    fn write_header(&mut self) -> Result<(), PipelineError>;

    /// Encode one frame on stream `stream`; `None` drains the encoder.
    ///
    /// Stream-copy streams have no encoder and return no packets.
    fn encode(&mut self, stream: usize, frame: Option<&Frame>) -> Result<Vec<Packet>, PipelineError>;

    /// Write one packet; `packet.stream` is an index of this output.
    fn mux(&mut self, packet: Packet) -> Result<(), PipelineError>;

    /// Write the trailer and release the container. Idempotent.
    fn close(&mut self) -> Result<(), PipelineError>;
}

/// Converts interleaved s16 audio between layouts.
pub trait AudioResampler {
    /// Convert one block of samples. Output length may differ from input.
    fn resample(&mut self, samples: &AudioSamples) -> Result<AudioSamples, PipelineError>;
}
