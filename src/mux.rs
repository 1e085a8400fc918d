//! FFmpeg output container: stream copy, H.264 encoding and muxing.

use ffmpeg_next::codec::context::Context as CodecContext;
use ffmpeg_next::codec::{Id, Parameters};
use ffmpeg_next::format::{Flags as FormatFlags, Pixel, context::Output};
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg_next::{Dictionary, Rational, Rescale, encoder, packet::Flags as PacketFlags};

use crate::engine::{OutputContainer, StreamTemplate, VideoEncoderSettings};
use crate::error::PipelineError;
use crate::frame::{Frame, MediaKind, Packet};
use crate::utilities::rgb_buffer_to_frame;

struct VideoStreamEncoder {
    encoder: encoder::Video,
    scaler: Option<(ScalingContext, u32, u32)>,
    time_base: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
    drained: bool,
}

struct OutputStream {
    kind: MediaKind,
    encoder: Option<VideoStreamEncoder>,
}

/// An FFmpeg output context and the streams added to it.
pub(crate) struct FfmpegOutput {
    context: Output,
    streams: Vec<OutputStream>,
    header_options: Option<Dictionary<'static>>,
    header_written: bool,
    closed: bool,
}

impl FfmpegOutput {
    pub(crate) fn new(context: Output, header_options: Dictionary<'static>) -> Self {
        Self {
            context,
            streams: Vec::new(),
            header_options: Some(header_options),
            header_written: false,
            closed: false,
        }
    }

    fn ensure_writable(&self) -> Result<(), PipelineError> {
        if self.closed {
            return Err(PipelineError::FfmpegError("output container is closed".to_string()));
        }
        Ok(())
    }

    fn receive_packets(
        encoder: &mut VideoStreamEncoder,
        stream: usize,
        packets: &mut Vec<Packet>,
    ) {
        let mut encoded = ffmpeg_next::Packet::empty();
        while encoder.encoder.receive_packet(&mut encoded).is_ok() {
            packets.push(Packet {
                stream,
                kind: MediaKind::Video,
                pts: encoded.pts(),
                dts: encoded.dts(),
                duration: encoded.duration(),
                time_base: encoder.time_base,
                is_key: encoded.is_key(),
                data: encoded.data().map(<[u8]>::to_vec).unwrap_or_default(),
            });
        }
    }
}

fn encode_error(context: &str) -> impl FnOnce(ffmpeg_next::Error) -> PipelineError + '_ {
    move |e| PipelineError::VideoEncodeError(format!("{context}: {e}"))
}

impl OutputContainer for FfmpegOutput {
    fn add_stream(&mut self, template: &StreamTemplate) -> Result<usize, PipelineError> {
        self.ensure_writable()?;
        let parameters = template.native::<Parameters>().ok_or_else(|| {
            PipelineError::FfmpegError("stream template carries no FFmpeg parameters".to_string())
        })?;
        let kind = template.info.kind.ok_or(PipelineError::StreamNotFound {
            index: template.info.index,
        })?;

        let mut stream = self.context.add_stream(encoder::find(Id::None))?;
        stream.set_parameters(parameters.clone());
        // Let the muxer pick its own codec tag.
        unsafe {
            (*stream.parameters().as_mut_ptr()).codec_tag = 0;
        }
        stream.set_time_base(template.info.time_base);
        let index = stream.index();

        self.streams.push(OutputStream { kind, encoder: None });
        log::debug!("Added stream-copy output stream {} ({:?})", index, kind);
        Ok(index)
    }

    fn add_video_encoder(&mut self, settings: &VideoEncoderSettings) -> Result<usize, PipelineError> {
        self.ensure_writable()?;
        let needs_global_header = self.context.format().flags().contains(FormatFlags::GLOBAL_HEADER);

        let codec = encoder::find_by_name(&settings.codec).ok_or_else(|| {
            PipelineError::VideoEncodeError(format!("codec {} not available", settings.codec))
        })?;

        let mut stream = self
            .context
            .add_stream(codec)
            .map_err(encode_error("cannot add stream"))?;
        let index = stream.index();
        let time_base = settings.time_base();

        let mut video = CodecContext::from_parameters(stream.parameters())
            .map_err(encode_error("cannot create codec context"))?
            .encoder()
            .video()
            .map_err(encode_error("cannot open video encoder"))?;

        video.set_width(settings.width);
        video.set_height(settings.height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(time_base);
        video.set_frame_rate(Some(settings.frame_rate));

        if needs_global_header {
            unsafe {
                (*video.as_mut_ptr()).flags |= ffmpeg_sys_next::AV_CODEC_FLAG_GLOBAL_HEADER as i32;
            }
        }

        let mut options = Dictionary::new();
        for (key, value) in &settings.options {
            options.set(key, value);
        }
        let opened = video
            .open_as_with(codec, options)
            .map_err(encode_error("cannot open encoder"))?;

        stream.set_parameters(&opened);
        stream.set_time_base(time_base);

        self.streams.push(OutputStream {
            kind: MediaKind::Video,
            encoder: Some(VideoStreamEncoder {
                encoder: opened,
                scaler: None,
                time_base,
                width: settings.width,
                height: settings.height,
                next_pts: 0,
                drained: false,
            }),
        });
        log::info!(
            "Added {} encoder stream {} ({}x{} @ {}/{})",
            settings.codec,
            index,
            settings.width,
            settings.height,
            settings.frame_rate.numerator(),
            settings.frame_rate.denominator(),
        );
        Ok(index)
    }

    fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn write_header(&mut self) -> Result<(), PipelineError> {
        self.ensure_writable()?;
        if self.header_written {
            return Ok(());
        }
        let options = self.header_options.take().unwrap_or_else(Dictionary::new);
        let unused = self.context.write_header_with(options)?;
        for (key, _) in unused.iter() {
            log::warn!("Output option '{}' was not recognised by the muxer", key);
        }
        self.header_written = true;
        Ok(())
    }

    fn encode(&mut self, stream: usize, frame: Option<&Frame>) -> Result<Vec<Packet>, PipelineError> {
        let output_stream = self
            .streams
            .get_mut(stream)
            .ok_or(PipelineError::StreamNotFound { index: stream })?;
        let Some(encoder) = output_stream.encoder.as_mut() else {
            return Ok(Vec::new());
        };

        let mut packets = Vec::new();
        let Some(frame) = frame else {
            if !encoder.drained {
                encoder.drained = true;
                encoder.encoder.send_eof().map_err(encode_error("send_eof failed"))?;
                Self::receive_packets(encoder, stream, &mut packets);
            }
            return Ok(packets);
        };

        let image = frame.as_video().ok_or_else(|| {
            PipelineError::VideoEncodeError(format!("stream {stream} only accepts video frames"))
        })?;
        let (width, height) = image.dimensions();

        let stale = !matches!(&encoder.scaler, Some((_, w, h)) if *w == width && *h == height);
        if stale {
            let scaler = ScalingContext::get(
                Pixel::RGB24,
                width,
                height,
                Pixel::YUV420P,
                encoder.width,
                encoder.height,
                ScalingFlags::BILINEAR,
            )
            .map_err(encode_error("cannot create scaler"))?;
            encoder.scaler = Some((scaler, width, height));
        }

        let mut source = VideoFrame::new(Pixel::RGB24, width, height);
        rgb_buffer_to_frame(image.as_raw(), &mut source, width, height);

        let mut scaled = VideoFrame::empty();
        if let Some((scaler, ..)) = encoder.scaler.as_mut() {
            scaler.run(&source, &mut scaled).map_err(encode_error("scaling failed"))?;
        }

        let pts = match frame.pts() {
            Some(pts) => pts.rescale(frame.time_base(), encoder.time_base),
            None => encoder.next_pts,
        };
        encoder.next_pts = pts + 1;
        scaled.set_pts(Some(pts));

        encoder
            .encoder
            .send_frame(&scaled)
            .map_err(encode_error("send_frame failed"))?;
        Self::receive_packets(encoder, stream, &mut packets);
        Ok(packets)
    }

    fn mux(&mut self, packet: Packet) -> Result<(), PipelineError> {
        self.ensure_writable()?;
        if !self.header_written {
            self.write_header()?;
        }

        let output_time_base = self
            .context
            .stream(packet.stream)
            .ok_or(PipelineError::StreamNotFound { index: packet.stream })?
            .time_base();

        let mut av_packet = ffmpeg_next::Packet::copy(&packet.data);
        av_packet.set_pts(packet.pts);
        av_packet.set_dts(packet.dts);
        av_packet.set_duration(packet.duration);
        if packet.is_key {
            av_packet.set_flags(PacketFlags::KEY);
        }
        av_packet.set_stream(packet.stream);
        av_packet.rescale_ts(packet.time_base, output_time_base);
        av_packet.set_position(-1);
        av_packet.write_interleaved(&mut self.context)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.header_written {
            self.context.write_trailer()?;
        }
        log::debug!(
            "Output container closed ({} streams: {:?})",
            self.streams.len(),
            self.streams.iter().map(|s| s.kind).collect::<Vec<_>>(),
        );
        Ok(())
    }
}
