//! Decoded frames and encoded packets.
//!
//! [`Frame`] and [`Packet`] are the engine-neutral units that travel through
//! the pipeline. Frame payloads live behind an [`Arc`] so that the newest
//! snapshot of a [`FrameCollection`](crate::FrameCollection), its queued
//! backlog and any callback all share one copy of the pixels or samples.

use std::sync::Arc;

use ffmpeg_next::Rational;
use image::RgbImage;

use crate::utilities::pts_to_seconds;

/// The kind of track a frame or packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// A video track.
    Video,
    /// An audio track.
    Audio,
}

/// Sample layout of interleaved signed 16-bit audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Samples per second per channel.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl AudioFormat {
    /// The format every audio frame leaves the worker in: stereo, 48 kHz.
    pub const STEREO_48K: AudioFormat = AudioFormat {
        sample_rate: 48_000,
        channels: 2,
    };

    /// Number of samples per channel in `duration_ms` milliseconds.
    pub fn samples_for_millis(&self, duration_ms: u32) -> usize {
        (self.sample_rate as u64 * duration_ms as u64 / 1000) as usize
    }
}

/// Interleaved signed 16-bit PCM samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSamples {
    /// Samples per second per channel.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Interleaved sample data, `channels` values per sample instant.
    pub data: Vec<i16>,
}

impl AudioSamples {
    /// Wrap interleaved samples.
    pub fn new(format: AudioFormat, data: Vec<i16>) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            data,
        }
    }

    /// Layout of these samples.
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Number of samples per channel.
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// Shared payload of a decoded frame.
#[derive(Debug, Clone)]
pub enum FrameData {
    /// Packed RGB24 pixels.
    Video(Arc<RgbImage>),
    /// Interleaved PCM samples.
    Audio(Arc<AudioSamples>),
}

/// A decoded unit of video or audio.
#[derive(Debug, Clone)]
pub struct Frame {
    pts: Option<i64>,
    time_base: Rational,
    data: FrameData,
}

impl Frame {
    /// Build a video frame.
    pub fn video(image: RgbImage, pts: Option<i64>, time_base: Rational) -> Self {
        Self {
            pts,
            time_base,
            data: FrameData::Video(Arc::new(image)),
        }
    }

    /// Build an audio frame.
    pub fn audio(samples: AudioSamples, pts: Option<i64>, time_base: Rational) -> Self {
        Self {
            pts,
            time_base,
            data: FrameData::Audio(Arc::new(samples)),
        }
    }

    /// Which kind of track produced this frame.
    pub fn kind(&self) -> MediaKind {
        match self.data {
            FrameData::Video(_) => MediaKind::Video,
            FrameData::Audio(_) => MediaKind::Audio,
        }
    }

    /// Presentation timestamp in [`time_base`](Frame::time_base) units.
    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    /// Time base of [`pts`](Frame::pts).
    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Presentation time in seconds.
    pub fn time(&self) -> Option<f64> {
        self.pts.map(|pts| pts_to_seconds(pts, self.time_base))
    }

    /// The shared payload.
    pub fn data(&self) -> &FrameData {
        &self.data
    }

    /// The image, if this is a video frame.
    pub fn as_video(&self) -> Option<&Arc<RgbImage>> {
        match &self.data {
            FrameData::Video(image) => Some(image),
            FrameData::Audio(_) => None,
        }
    }

    /// The samples, if this is an audio frame.
    pub fn as_audio(&self) -> Option<&Arc<AudioSamples>> {
        match &self.data {
            FrameData::Audio(samples) => Some(samples),
            FrameData::Video(_) => None,
        }
    }

    pub(crate) fn set_timing(&mut self, pts: Option<i64>, time_base: Rational) {
        self.pts = pts;
        self.time_base = time_base;
    }
}

/// An encoded unit read from or written to a container.
///
/// A packet without a `dts` is a flush marker: the engine emits it while
/// draining its internal buffers, and it carries no data worth decoding.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Stream index inside the container that produced (or will receive) it.
    pub stream: usize,
    /// Track kind of that stream.
    pub kind: MediaKind,
    /// Presentation timestamp in `time_base` units.
    pub pts: Option<i64>,
    /// Decode timestamp in `time_base` units.
    pub dts: Option<i64>,
    /// Duration in `time_base` units, `0` if unknown.
    pub duration: i64,
    /// Time base of the timestamps.
    pub time_base: Rational,
    /// Whether this packet starts a keyframe.
    pub is_key: bool,
    /// Encoded bytes.
    pub data: Vec<u8>,
}

impl Packet {
    /// A flush marker for `stream`.
    pub fn flush_marker(stream: usize, kind: MediaKind, time_base: Rational) -> Self {
        Self {
            stream,
            kind,
            pts: None,
            dts: None,
            duration: 0,
            time_base,
            is_key: false,
            data: Vec::new(),
        }
    }

    /// `true` if this packet carries no decode timestamp.
    pub fn is_flush_marker(&self) -> bool {
        self.dts.is_none()
    }
}
