//! First-timestamp rebasing and uniform audio chunking.
//!
//! Every run starts at time zero: the first packet timestamps and the first
//! video frame timestamp of a run are captured once and subtracted from
//! everything that follows. Audio is re-stamped by cumulative sample count
//! instead, after being cut into fixed-size chunks.

use std::collections::VecDeque;

use ffmpeg_next::{Rational, Rescale};

use crate::frame::{AudioFormat, AudioSamples, Packet};

/// Rebases packet `dts`/`pts` against the first timestamped packet of a run.
///
/// The origin is captured with its time base and rescaled into each
/// packet's own time base, so tracks with different time bases keep their
/// relative offsets.
#[derive(Debug, Default)]
pub(crate) struct PacketRebaser {
    origin: Option<(i64, i64, Rational)>,
}

impl PacketRebaser {
    /// Rewrite the timestamps of `packet` in place. Flush markers are left
    /// untouched.
    pub(crate) fn rebase(&mut self, packet: &mut Packet) {
        let Some(dts) = packet.dts else {
            return;
        };
        let (first_dts, first_pts, origin_base) = *self
            .origin
            .get_or_insert((dts, packet.pts.unwrap_or(dts), packet.time_base));

        packet.dts = Some(dts - first_dts.rescale(origin_base, packet.time_base));
        packet.pts = packet
            .pts
            .map(|pts| pts - first_pts.rescale(origin_base, packet.time_base));
    }
}

/// Rebases frame timestamps of a single track against its first frame.
#[derive(Debug, Default)]
pub(crate) struct FrameRebaser {
    first: Option<i64>,
}

impl FrameRebaser {
    /// Returns the rebased timestamp.
    pub(crate) fn rebase(&mut self, pts: i64) -> i64 {
        pts - *self.first.get_or_insert(pts)
    }
}

/// A FIFO that re-cuts audio into chunks of exactly `chunk_samples` samples
/// per channel, stamped with the running sample count.
#[derive(Debug)]
pub(crate) struct AudioChunker {
    format: AudioFormat,
    chunk_samples: usize,
    buffer: VecDeque<i16>,
    next_pts: i64,
}

impl AudioChunker {
    /// A chunker for `format` emitting `chunk_samples` samples per channel.
    pub(crate) fn new(format: AudioFormat, chunk_samples: usize) -> Self {
        Self {
            format,
            chunk_samples: chunk_samples.max(1),
            buffer: VecDeque::new(),
            next_pts: 0,
        }
    }

    /// Time base of emitted chunks: one tick per sample.
    pub(crate) fn time_base(&self) -> Rational {
        Rational::new(1, self.format.sample_rate as i32)
    }

    /// Append samples already in the chunker's format.
    pub(crate) fn write(&mut self, samples: &AudioSamples) {
        self.buffer.extend(samples.data.iter().copied());
    }

    /// Take the next full chunk and its timestamp, if one is buffered.
    pub(crate) fn read(&mut self) -> Option<(AudioSamples, i64)> {
        let values = self.chunk_samples * self.format.channels as usize;
        if self.buffer.len() < values {
            return None;
        }
        let data: Vec<i16> = self.buffer.drain(..values).collect();
        let pts = self.next_pts;
        self.next_pts += self.chunk_samples as i64;
        Some((AudioSamples::new(self.format, data), pts))
    }
}
