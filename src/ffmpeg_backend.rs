use std::ptr;
use std::sync::OnceLock;

use ffmpeg_next::{self as ffmpeg, Dictionary, Rational};
use ffmpeg_next::codec::encoder as av_encoder;
use ffmpeg_next::format::{Pixel, Sample, sample};
use tracing::{debug, warn};

use crate::backend::{BackendCandidate, BackendRegistry, DispatcherConfig};
use crate::capability::{AcceleratorFamily, ProbedCapabilities};
use crate::{
    AudioParams, BackendError, CodecId, EncoderBackend, FrameFormat, MediaFrame, MediaPacket,
    PixelFormat, SampleFormat, Timebase, TrackDescriptor, TrackParams, VideoParams,
};

fn init_ffmpeg() -> Result<(), BackendError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| ffmpeg::init().map_err(|err| err.to_string()))
        .clone()
        .map_err(BackendError::Backend)
}

fn av_err(err: ffmpeg::Error) -> BackendError {
    BackendError::Backend(err.to_string())
}

fn to_pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Yuvj420p => Pixel::YUVJ420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Bgra => Pixel::BGRA,
    }
}

fn to_sample(format: SampleFormat) -> Sample {
    match format {
        SampleFormat::S16 => Sample::I16(sample::Type::Packed),
        SampleFormat::S16Planar => Sample::I16(sample::Type::Planar),
        SampleFormat::F32 => Sample::F32(sample::Type::Packed),
        SampleFormat::F32Planar => Sample::F32(sample::Type::Planar),
    }
}

fn to_rational(timebase: Timebase) -> Rational {
    Rational::new(timebase.num, timebase.den)
}

enum OpenedEncoder {
    Video {
        encoder: av_encoder::video::Encoder,
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    Audio {
        encoder: av_encoder::audio::Encoder,
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
    },
}

pub struct FfmpegEncoder {
    encoder_name: String,
    codec: CodecId,
    defaults: Vec<(String, String)>,
    timebase: Timebase,
    opened: Option<OpenedEncoder>,
}

impl FfmpegEncoder {
    #[must_use]
    pub fn new(encoder_name: impl Into<String>, codec: CodecId) -> Self {
        Self {
            encoder_name: encoder_name.into(),
            codec,
            defaults: Vec::new(),
            timebase: Timebase::new(1, 1),
            opened: None,
        }
    }

    #[must_use]
    pub fn with_default_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.push((key.into(), value.into()));
        self
    }

    fn options_for(&self, track: &TrackDescriptor) -> Dictionary<'static> {
        let mut dict = Dictionary::new();
        for (key, value) in &self.defaults {
            dict.set(key, value);
        }
        if let Some(profile) = track.video_params().and_then(|p| p.profile.as_deref()) {
            dict.set("profile", profile);
        }
        for (key, value) in &track.options {
            dict.set(key, value);
        }
        dict
    }

    fn open_video(
        &self,
        codec: ffmpeg::Codec,
        track: &TrackDescriptor,
        params: &VideoParams,
    ) -> Result<OpenedEncoder, BackendError> {
        let pixel = to_pixel(params.pixel_format);
        let supported = codec
            .video()
            .map_err(av_err)?
            .formats()
            .map(|mut formats| formats.any(|f| f == pixel))
            .unwrap_or(true);
        if !supported {
            return Err(BackendError::UnsupportedConfig(format!(
                "{} does not accept {}",
                self.encoder_name, params.pixel_format
            )));
        }

        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(av_err)?;
        ctx.set_width(params.width);
        ctx.set_height(params.height);
        ctx.set_format(pixel);
        ctx.set_time_base(to_rational(track.timebase));
        if params.framerate > 0.0 {
            ctx.set_frame_rate(Some(Rational::from(params.framerate)));
        }
        if params.bitrate > 0 {
            ctx.set_bit_rate(usize::try_from(params.bitrate).unwrap_or(usize::MAX));
        }
        if let Some(gop) = params.key_frame_interval {
            ctx.set_gop(gop);
        }

        let encoder = ctx
            .open_with(self.options_for(track))
            .map_err(|err| {
                BackendError::UnsupportedConfig(format!("{}: {}", self.encoder_name, err))
            })?;
        Ok(OpenedEncoder::Video {
            encoder,
            width: params.width,
            height: params.height,
            format: params.pixel_format,
        })
    }

    fn open_audio(
        &self,
        codec: ffmpeg::Codec,
        track: &TrackDescriptor,
        params: &AudioParams,
    ) -> Result<OpenedEncoder, BackendError> {
        let format = to_sample(params.sample_format);
        let supported = codec
            .audio()
            .map_err(av_err)?
            .formats()
            .map(|mut formats| formats.any(|f| f == format))
            .unwrap_or(true);
        if !supported {
            return Err(BackendError::UnsupportedConfig(format!(
                "{} does not accept {} samples",
                self.encoder_name, params.sample_format
            )));
        }

        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(av_err)?;
        ctx.set_rate(i32::try_from(params.sample_rate).unwrap_or(i32::MAX));
        ctx.set_format(format);
        ctx.set_channel_layout(ffmpeg::ChannelLayout::default(i32::from(params.channels)));
        ctx.set_time_base(to_rational(track.timebase));
        if params.bitrate > 0 {
            ctx.set_bit_rate(usize::try_from(params.bitrate).unwrap_or(usize::MAX));
        }

        let encoder = ctx
            .open_with(self.options_for(track))
            .map_err(|err| {
                BackendError::UnsupportedConfig(format!("{}: {}", self.encoder_name, err))
            })?;
        Ok(OpenedEncoder::Audio {
            encoder,
            sample_rate: params.sample_rate,
            channels: params.channels,
            format: params.sample_format,
        })
    }
}

impl EncoderBackend for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.encoder_name
    }

    fn codec(&self) -> CodecId {
        self.codec
    }

    fn configure(&mut self, track: &TrackDescriptor) -> Result<(), BackendError> {
        if track.codec != self.codec {
            return Err(BackendError::UnsupportedCodec(track.codec));
        }
        init_ffmpeg()?;
        let codec = av_encoder::find_by_name(&self.encoder_name).ok_or_else(|| {
            BackendError::UnsupportedConfig(format!(
                "encoder {} is not available in this libavcodec build",
                self.encoder_name
            ))
        })?;

        let opened = match &track.params {
            TrackParams::Video(params) => self.open_video(codec, track, params)?,
            TrackParams::Audio(params) => self.open_audio(codec, track, params)?,
        };
        self.timebase = track.timebase;
        self.opened = Some(opened);
        debug!("opened libavcodec encoder {} for {}", self.encoder_name, track);
        Ok(())
    }

    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<MediaPacket>, BackendError> {
        let pts = frame.timebase.rescale(frame.pts, self.timebase);
        let opened = self.opened.as_mut().ok_or(BackendError::NotConfigured)?;
        let encoder: &mut av_encoder::Encoder = match opened {
            OpenedEncoder::Video {
                encoder,
                width,
                height,
                format,
            } => {
                let expected = FrameFormat::Video {
                    width: *width,
                    height: *height,
                    pixel_format: *format,
                };
                if frame.format != expected {
                    return Err(BackendError::InvalidInput(format!(
                        "frame {:?} does not match encoder input {:?}",
                        frame.format, expected
                    )));
                }
                let mut av_frame = ffmpeg::frame::Video::new(to_pixel(*format), *width, *height);
                copy_video_planes(frame, &mut av_frame)?;
                av_frame.set_pts(Some(pts));
                encoder.send_frame(&av_frame).map_err(av_err)?;
                encoder
            }
            OpenedEncoder::Audio {
                encoder,
                sample_rate,
                channels,
                format,
            } => {
                let FrameFormat::Audio {
                    samples,
                    sample_rate: frame_rate,
                    channels: frame_channels,
                    sample_format,
                } = frame.format
                else {
                    return Err(BackendError::InvalidInput(
                        "video frame sent to an audio encoder".to_string(),
                    ));
                };
                if frame_rate != *sample_rate
                    || frame_channels != *channels
                    || sample_format != *format
                {
                    return Err(BackendError::InvalidInput(format!(
                        "audio frame {}Hz/{}ch/{} does not match encoder {}Hz/{}ch/{}",
                        frame_rate, frame_channels, sample_format, sample_rate, channels, format
                    )));
                }
                let mut av_frame = ffmpeg::frame::Audio::new(
                    to_sample(*format),
                    samples,
                    ffmpeg::ChannelLayout::default(i32::from(*channels)),
                );
                av_frame.set_rate(*sample_rate);
                for (index, plane) in frame.planes.iter().enumerate().take(av_frame.planes()) {
                    let dst = av_frame.data_mut(index);
                    let len = dst.len().min(plane.data.len());
                    dst[..len].copy_from_slice(&plane.data[..len]);
                }
                av_frame.set_pts(Some(pts));
                encoder.send_frame(&av_frame).map_err(av_err)?;
                encoder
            }
        };
        receive_packets(encoder, self.codec, self.timebase)
    }

    fn supports_flush(&self) -> bool {
        true
    }

    fn flush(&mut self) -> Result<Vec<MediaPacket>, BackendError> {
        let Some(opened) = self.opened.as_mut() else {
            return Ok(Vec::new());
        };
        let encoder: &mut av_encoder::Encoder = match opened {
            OpenedEncoder::Video { encoder, .. } => encoder,
            OpenedEncoder::Audio { encoder, .. } => encoder,
        };
        encoder.send_eof().map_err(av_err)?;
        receive_packets(encoder, self.codec, self.timebase)
    }

    fn release(&mut self) {
        if self.opened.take().is_some() {
            debug!("released libavcodec encoder {}", self.encoder_name);
        }
    }
}

fn copy_video_planes(
    frame: &MediaFrame,
    av_frame: &mut ffmpeg::frame::Video,
) -> Result<(), BackendError> {
    if frame.planes.len() < av_frame.planes() {
        return Err(BackendError::InvalidInput(format!(
            "expected {} planes, got {}",
            av_frame.planes(),
            frame.planes.len()
        )));
    }
    for (index, plane) in frame.planes.iter().enumerate().take(av_frame.planes()) {
        let dst_stride = av_frame.stride(index);
        let row_len = dst_stride.min(plane.stride);
        if row_len == 0 {
            continue;
        }
        let dst = av_frame.data_mut(index);
        for (dst_row, src_row) in dst
            .chunks_mut(dst_stride)
            .zip(plane.data.chunks(plane.stride))
        {
            let len = row_len.min(dst_row.len()).min(src_row.len());
            dst_row[..len].copy_from_slice(&src_row[..len]);
        }
    }
    Ok(())
}

fn receive_packets(
    encoder: &mut av_encoder::Encoder,
    codec: CodecId,
    timebase: Timebase,
) -> Result<Vec<MediaPacket>, BackendError> {
    let mut packets = Vec::new();
    loop {
        let mut packet = ffmpeg::Packet::empty();
        match encoder.receive_packet(&mut packet) {
            Ok(()) => {
                let pts = packet.pts().unwrap_or(0);
                packets.push(MediaPacket {
                    codec,
                    data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                    pts,
                    dts: packet.dts().unwrap_or(pts),
                    duration: (packet.duration() > 0).then(|| packet.duration()),
                    timebase,
                    is_keyframe: packet.is_key(),
                });
            }
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => break,
            Err(ffmpeg::Error::Eof) => break,
            Err(err) => return Err(av_err(err)),
        }
    }
    Ok(packets)
}

pub fn probe_hw_device(family: AcceleratorFamily) -> bool {
    if init_ffmpeg().is_err() {
        return false;
    }
    let device_type = match family {
        AcceleratorFamily::Qsv => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
        AcceleratorFamily::Nvidia => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
    };
    let mut device: *mut ffmpeg::ffi::AVBufferRef = ptr::null_mut();
    // SAFETY: `device` is a valid out-pointer; on success we own one reference
    // and drop it immediately.
    let ret = unsafe {
        ffmpeg::ffi::av_hwdevice_ctx_create(
            &mut device,
            device_type,
            ptr::null(),
            ptr::null_mut(),
            0,
        )
    };
    if ret < 0 || device.is_null() {
        debug!("{} device probe failed: {}", family, ffmpeg::Error::from(ret));
        return false;
    }
    // SAFETY: `device` is the non-null reference created above and is not used
    // again; `av_buffer_unref` frees it and resets the pointer to null.
    unsafe { ffmpeg::ffi::av_buffer_unref(&mut device) };
    true
}

pub fn host_capabilities() -> ProbedCapabilities {
    ProbedCapabilities::new(probe_hw_device)
}

fn candidate(name: &'static str, codec: CodecId) -> BackendCandidate {
    BackendCandidate::software(name, move || Box::new(FfmpegEncoder::new(name, codec)))
}

fn hw_candidate(name: &'static str, codec: CodecId, family: AcceleratorFamily) -> BackendCandidate {
    BackendCandidate::hardware(name, family, move || Box::new(FfmpegEncoder::new(name, codec)))
}

pub fn standard_registry(config: &DispatcherConfig) -> BackendRegistry {
    let registry = BackendRegistry::new()
        .register(CodecId::H264, hw_candidate("h264_qsv", CodecId::H264, AcceleratorFamily::Qsv))
        .register(
            CodecId::H264,
            hw_candidate("h264_nvenc", CodecId::H264, AcceleratorFamily::Nvidia),
        )
        .register(CodecId::H264, candidate("libopenh264", CodecId::H264))
        .register(CodecId::H265, hw_candidate("hevc_qsv", CodecId::H265, AcceleratorFamily::Qsv))
        .register(
            CodecId::H265,
            hw_candidate("hevc_nvenc", CodecId::H265, AcceleratorFamily::Nvidia),
        )
        .register(CodecId::Vp8, candidate("libvpx", CodecId::Vp8))
        .register(CodecId::Jpeg, candidate("mjpeg", CodecId::Jpeg))
        .register(CodecId::Png, candidate("png", CodecId::Png))
        .register(CodecId::Aac, candidate("aac", CodecId::Aac));

    if config.legacy_opus {
        registry.register(CodecId::Opus, candidate("libopus", CodecId::Opus))
    } else {
        registry.register(
            CodecId::Opus,
            BackendCandidate::software("opus", || {
                Box::new(
                    FfmpegEncoder::new("opus", CodecId::Opus)
                        .with_default_option("strict", "experimental"),
                )
            }),
        )
    }
}

pub fn report_missing_encoders(registry: &BackendRegistry) {
    if init_ffmpeg().is_err() {
        warn!("libavcodec failed to initialise");
        return;
    }
    for codec in registry.codecs() {
        for entry in registry.candidates(codec).unwrap_or_default() {
            if av_encoder::find_by_name(&entry.name).is_none() {
                warn!("encoder {} for {} is not compiled into libavcodec", entry.name, codec);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;

    #[test]
    fn standard_table_orders_hardware_before_software() {
        let registry = standard_registry(&DispatcherConfig::new(true));
        let names = registry
            .candidates(CodecId::H264)
            .unwrap()
            .iter()
            .map(|c| (c.name.as_str(), c.kind))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                ("h264_qsv", BackendKind::Hardware(AcceleratorFamily::Qsv)),
                ("h264_nvenc", BackendKind::Hardware(AcceleratorFamily::Nvidia)),
                ("libopenh264", BackendKind::Software),
            ]
        );
        assert!(
            registry
                .candidates(CodecId::H265)
                .unwrap()
                .iter()
                .all(BackendCandidate::is_hardware)
        );
        assert!(registry.candidates(CodecId::Mp3).is_none());
    }

    #[test]
    fn opus_variant_follows_config() {
        let legacy = DispatcherConfig {
            legacy_opus: true,
            ..DispatcherConfig::default()
        };
        let name = |config: &DispatcherConfig| {
            standard_registry(config).candidates(CodecId::Opus).unwrap()[0]
                .name
                .clone()
        };
        assert_eq!(name(&legacy), "libopus");
        assert_eq!(name(&DispatcherConfig::default()), "opus");
    }

    #[test]
    fn unconfigured_encoder_rejects_frames_and_flushes_nothing() {
        let mut encoder = FfmpegEncoder::new("libopenh264", CodecId::H264);
        let frame = MediaFrame::new(
            0,
            Timebase::new(1, 1000),
            FrameFormat::Video {
                width: 16,
                height: 16,
                pixel_format: PixelFormat::Yuv420p,
            },
            Vec::new(),
        );
        assert!(matches!(encoder.encode(&frame), Err(BackendError::NotConfigured)));
        assert!(encoder.flush().unwrap().is_empty());
        encoder.release();
    }
}
