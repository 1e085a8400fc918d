//! FFmpeg input container: demuxing and decoding.

use std::collections::{HashMap, VecDeque};

use ffmpeg_next::codec::context::Context as CodecContext;
use ffmpeg_next::format::{Pixel, Sample, context::Input, sample::Type as SampleType};
use ffmpeg_next::frame::{Audio as AudioFrame, Video as VideoFrame};
use ffmpeg_next::media::Type;
use ffmpeg_next::software::resampling::Context as ResamplingContext;
use ffmpeg_next::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg_next::{Error as FfmpegError, Rational, decoder, packet::Flags as PacketFlags};
use image::RgbImage;

use crate::engine::{CodecHints, InputContainer, StreamInfo, StreamTemplate};
use crate::error::PipelineError;
use crate::frame::{AudioFormat, AudioSamples, Frame, MediaKind, Packet};
use crate::utilities::frame_to_rgb_buffer;

struct VideoDecoder {
    decoder: decoder::Video,
    scaler: Option<(ScalingContext, Pixel, u32, u32)>,
    time_base: Rational,
}

struct AudioDecoder {
    decoder: decoder::Audio,
    converter: Option<ResamplingContext>,
    time_base: Rational,
}

enum StreamDecoder {
    Video(VideoDecoder),
    Audio(AudioDecoder),
}

impl StreamDecoder {
    fn kind(&self) -> MediaKind {
        match self {
            StreamDecoder::Video(_) => MediaKind::Video,
            StreamDecoder::Audio(_) => MediaKind::Audio,
        }
    }

    fn time_base(&self) -> Rational {
        match self {
            StreamDecoder::Video(video) => video.time_base,
            StreamDecoder::Audio(audio) => audio.time_base,
        }
    }
}

/// An FFmpeg input context plus one decoder per selected stream.
pub(crate) struct FfmpegInput {
    context: Input,
    decoders: HashMap<usize, StreamDecoder>,
    /// Flush markers still to hand out after the demuxer hit end of file.
    draining: Option<VecDeque<Packet>>,
}

impl FfmpegInput {
    pub(crate) fn new(context: Input) -> Self {
        Self {
            context,
            decoders: HashMap::new(),
            draining: None,
        }
    }

    fn start_draining(&mut self) -> VecDeque<Packet> {
        let mut indices: Vec<usize> = self.decoders.keys().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .filter_map(|index| {
                let decoder = self.decoders.get(&index)?;
                Some(Packet::flush_marker(index, decoder.kind(), decoder.time_base()))
            })
            .collect()
    }
}

fn stream_info(stream: &ffmpeg_next::format::stream::Stream<'_>) -> StreamInfo {
    let parameters = stream.parameters();
    let kind = match parameters.medium() {
        Type::Video => Some(MediaKind::Video),
        Type::Audio => Some(MediaKind::Audio),
        _ => None,
    };
    let (width, height, sample_rate, channels) = unsafe {
        let raw = parameters.as_ptr();
        (
            (*raw).width.max(0) as u32,
            (*raw).height.max(0) as u32,
            (*raw).sample_rate.max(0) as u32,
            (*raw).ch_layout.nb_channels.max(0) as u16,
        )
    };
    let frame_rate = stream.avg_frame_rate();

    StreamInfo {
        index: stream.index(),
        kind,
        time_base: stream.time_base(),
        codec: parameters.id().name().to_string(),
        width,
        height,
        frame_rate: (frame_rate.numerator() > 0 && frame_rate.denominator() > 0).then_some(frame_rate),
        sample_rate,
        channels,
    }
}

impl InputContainer for FfmpegInput {
    fn format_name(&self) -> String {
        self.context.format().name().to_string()
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.context.streams().map(|stream| stream_info(&stream)).collect()
    }

    fn stream_template(&self, index: usize) -> Result<StreamTemplate, PipelineError> {
        let stream = self
            .context
            .stream(index)
            .ok_or(PipelineError::StreamNotFound { index })?;
        Ok(StreamTemplate::with_native(stream_info(&stream), stream.parameters()))
    }

    fn open_decoder(&mut self, index: usize, hints: CodecHints) -> Result<(), PipelineError> {
        let stream = self
            .context
            .stream(index)
            .ok_or(PipelineError::StreamNotFound { index })?;
        let time_base = stream.time_base();
        let medium = stream.parameters().medium();
        let mut codec_context = CodecContext::from_parameters(stream.parameters())?;

        unsafe {
            let raw = codec_context.as_mut_ptr();
            if hints.go_faster {
                (*raw).thread_type =
                    (ffmpeg_sys_next::FF_THREAD_FRAME | ffmpeg_sys_next::FF_THREAD_SLICE) as i32;
                (*raw).thread_count = 0;
            }
            if hints.low_delay {
                (*raw).flags |= ffmpeg_sys_next::AV_CODEC_FLAG_LOW_DELAY as i32;
            }
        }

        let decoder = match medium {
            Type::Video => StreamDecoder::Video(VideoDecoder {
                decoder: codec_context.decoder().video()?,
                scaler: None,
                time_base,
            }),
            Type::Audio => StreamDecoder::Audio(AudioDecoder {
                decoder: codec_context.decoder().audio()?,
                converter: None,
                time_base,
            }),
            other => {
                return Err(PipelineError::FfmpegError(format!(
                    "stream {index} has unsupported medium {other:?}"
                )));
            }
        };

        log::debug!("Decoder ready for stream {} ({:?}, hints={:?})", index, medium, hints);
        self.decoders.insert(index, decoder);
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Packet, PipelineError> {
        if let Some(pending) = self.draining.as_mut() {
            return pending.pop_front().ok_or(PipelineError::EndOfStream);
        }

        loop {
            let mut packet = ffmpeg_next::Packet::empty();
            match packet.read(&mut self.context) {
                Ok(()) => {
                    let index = packet.stream();
                    let Some(decoder) = self.decoders.get(&index) else {
                        continue;
                    };
                    return Ok(Packet {
                        stream: index,
                        kind: decoder.kind(),
                        pts: packet.pts(),
                        dts: packet.dts(),
                        duration: packet.duration(),
                        time_base: decoder.time_base(),
                        is_key: packet.is_key(),
                        data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                    });
                }
                Err(FfmpegError::Eof) => {
                    log::debug!("Input reached end of file, draining {} decoders", self.decoders.len());
                    let mut pending = self.start_draining();
                    let first = pending.pop_front();
                    self.draining = Some(pending);
                    return first.ok_or(PipelineError::EndOfStream);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, PipelineError> {
        let Some(decoder) = self.decoders.get_mut(&packet.stream) else {
            return Ok(Vec::new());
        };

        let mut av_packet = ffmpeg_next::Packet::copy(&packet.data);
        av_packet.set_pts(packet.pts);
        av_packet.set_dts(packet.dts);
        av_packet.set_duration(packet.duration);
        if packet.is_key {
            av_packet.set_flags(PacketFlags::KEY);
        }

        let mut frames = Vec::new();
        match decoder {
            StreamDecoder::Video(video) => {
                video.decoder.send_packet(&av_packet)?;
                let mut decoded = VideoFrame::empty();
                while video.decoder.receive_frame(&mut decoded).is_ok() {
                    frames.push(convert_video(video, &decoded)?);
                }
            }
            StreamDecoder::Audio(audio) => {
                audio.decoder.send_packet(&av_packet)?;
                let mut decoded = AudioFrame::empty();
                while audio.decoder.receive_frame(&mut decoded).is_ok() {
                    frames.push(convert_audio(audio, &decoded)?);
                }
            }
        }
        Ok(frames)
    }
}

/// Convert a decoded frame of any pixel format to packed RGB24 at its own size.
fn convert_video(video: &mut VideoDecoder, decoded: &VideoFrame) -> Result<Frame, PipelineError> {
    let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());

    let stale = !matches!(
        &video.scaler,
        Some((_, f, w, h)) if *f == format && *w == width && *h == height
    );
    if stale {
        let scaler = ScalingContext::get(
            format,
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            ScalingFlags::BILINEAR,
        )?;
        video.scaler = Some((scaler, format, width, height));
    }

    let mut rgb_frame = VideoFrame::empty();
    if let Some((scaler, ..)) = video.scaler.as_mut() {
        scaler.run(decoded, &mut rgb_frame)?;
    }

    let buffer = frame_to_rgb_buffer(&rgb_frame, width, height);
    let image = RgbImage::from_raw(width, height, buffer).ok_or_else(|| {
        PipelineError::VideoDecodeError(
            "Failed to construct RGB image from decoded frame data".to_string(),
        )
    })?;

    Ok(Frame::video(
        image,
        decoded.timestamp().or(decoded.pts()),
        video.time_base,
    ))
}

/// Convert a decoded audio frame to interleaved s16 at its native rate and layout.
fn convert_audio(audio: &mut AudioDecoder, decoded: &AudioFrame) -> Result<Frame, PipelineError> {
    let layout = audio.decoder.channel_layout();
    let rate = audio.decoder.rate();
    let target = Sample::I16(SampleType::Packed);

    if audio.converter.is_none() {
        let converter = ResamplingContext::get(audio.decoder.format(), layout, rate, target, layout, rate)
            .map_err(|e| PipelineError::ResampleError(format!("Failed to create converter: {e}")))?;
        audio.converter = Some(converter);
    }

    let mut packed = AudioFrame::empty();
    if let Some(converter) = audio.converter.as_mut() {
        converter
            .run(decoded, &mut packed)
            .map_err(|e| PipelineError::ResampleError(format!("Sample conversion failed: {e}")))?;
    }

    let channels = packed.channels().max(1);
    let value_count = packed.samples() * channels as usize;
    let data = packed.data(0)[..value_count * 2]
        .chunks_exact(2)
        .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
        .collect();

    let format = AudioFormat {
        sample_rate: rate,
        channels,
    };
    Ok(Frame::audio(
        AudioSamples::new(format, data),
        decoded.timestamp().or(decoded.pts()),
        audio.time_base,
    ))
}
