//! FFmpeg audio layout conversion.

use ffmpeg_next::ChannelLayout;
use ffmpeg_next::format::{Sample, sample::Type as SampleType};
use ffmpeg_next::frame::Audio as AudioFrame;
use ffmpeg_next::software::resampling::Context as ResamplingContext;

use crate::engine::AudioResampler;
use crate::error::PipelineError;
use crate::frame::{AudioFormat, AudioSamples};

const PACKED_S16: Sample = Sample::I16(SampleType::Packed);

/// `swresample` context converting interleaved s16 between layouts.
pub(crate) struct FfmpegResampler {
    context: ResamplingContext,
    from: AudioFormat,
    to: AudioFormat,
}

impl FfmpegResampler {
    pub(crate) fn new(from: AudioFormat, to: AudioFormat) -> Result<Self, PipelineError> {
        log::debug!("Creating resampler {:?} -> {:?}", from, to);
        let context = ResamplingContext::get(
            PACKED_S16,
            ChannelLayout::default(from.channels as i32),
            from.sample_rate,
            PACKED_S16,
            ChannelLayout::default(to.channels as i32),
            to.sample_rate,
        )
        .map_err(|e| PipelineError::ResampleError(format!("Failed to create resampler: {e}")))?;

        Ok(Self { context, from, to })
    }
}

impl AudioResampler for FfmpegResampler {
    fn resample(&mut self, samples: &AudioSamples) -> Result<AudioSamples, PipelineError> {
        if samples.format() != self.from {
            return Err(PipelineError::ResampleError(format!(
                "expected {:?}, got {:?}",
                self.from,
                samples.format()
            )));
        }

        let count = samples.samples_per_channel();
        let mut input = AudioFrame::new(PACKED_S16, count, ChannelLayout::default(self.from.channels as i32));
        input.set_rate(self.from.sample_rate);
        {
            let plane = input.data_mut(0);
            for (chunk, value) in plane.chunks_exact_mut(2).zip(&samples.data) {
                chunk.copy_from_slice(&value.to_ne_bytes());
            }
        }

        let mut output = AudioFrame::empty();
        self.context
            .run(&input, &mut output)
            .map_err(|e| PipelineError::ResampleError(format!("Resample error: {e}")))?;

        let value_count = output.samples() * self.to.channels as usize;
        let data = output.data(0)[..value_count * 2]
            .chunks_exact(2)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
            .collect();

        Ok(AudioSamples::new(self.to, data))
    }
}
