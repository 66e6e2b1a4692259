use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcode_hw::{
    AudioParams, CapabilityReport, CodecId, Dispatcher, DispatcherConfig, EncoderId, FrameFormat,
    MediaFrame, MediaType, PixelFormat, Plane, QueuePolicy, SampleFormat, Timebase,
    TrackDescriptor, VideoParams, completion_channel, host_capabilities, report_missing_encoders,
    standard_registry,
};

#[derive(Parser, Debug)]
#[command(about = "Select an encoder for a codec and push synthetic frames through it")]
struct Args {
    #[arg(long, default_value = "h264")]
    codec: String,
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 360)]
    height: u32,
    #[arg(long, default_value_t = 30)]
    fps: u32,
    #[arg(long, default_value_t = 90)]
    frames: usize,
    #[arg(long, default_value_t = false)]
    hwaccel: bool,
    #[arg(long, default_value_t = false)]
    legacy_opus: bool,
    #[arg(long, default_value = "block")]
    queue_policy: String,
    #[arg(long, default_value_t = 1)]
    encoder_id: i32,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let codec = CodecId::from_name(&args.codec)
        .with_context(|| format!("unsupported codec: {}", args.codec))?;

    let config = DispatcherConfig {
        hwaccel_enabled: args.hwaccel && DispatcherConfig::default().hwaccel_enabled,
        queue_policy: parse_policy(&args.queue_policy)?,
        legacy_opus: args.legacy_opus,
    };
    let oracle = Arc::new(host_capabilities());
    let registry = standard_registry(&config);
    report_missing_encoders(&registry);
    println!("{config}");
    println!("{}", CapabilityReport::collect(oracle.as_ref()));

    let dispatcher = Dispatcher::new(registry, oracle, config);
    let track = Arc::new(build_track(codec, &args).with_hardware_accel(args.hwaccel));
    let (handler, packets) = completion_channel();
    let encoder = dispatcher
        .create(EncoderId(args.encoder_id), Arc::clone(&track), handler)
        .context("encoder selection failed")?;
    println!(
        "selected backend={} queue=\"{}\"",
        encoder.backend_name(),
        encoder.queue_label()
    );

    encoder.start().context("failed to start encoder")?;
    for index in 0..args.frames {
        encoder.send_buffer(Arc::new(synthetic_frame(&track, index)));
    }
    // Give the worker a moment to drain before stopping; stop discards what is left.
    while encoder.queue_stats().depth > 0 {
        std::thread::sleep(Duration::from_millis(5));
    }
    encoder.stop();

    let received = packets.drain();
    let bytes = received.iter().map(|p| p.packet.data.len()).sum::<usize>();
    let keyframes = received.iter().filter(|p| p.packet.is_keyframe).count();
    let stats = encoder.queue_stats();
    println!(
        "frames={}, packets={}, bytes={}, keyframes={}, peak_depth={}, dropped={}",
        args.frames,
        received.len(),
        bytes,
        keyframes,
        stats.peak_depth,
        stats.dropped
    );
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "transcode_hw=info".into());
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {err}");
    }
}

fn parse_policy(raw: &str) -> Result<QueuePolicy> {
    match raw.to_ascii_lowercase().as_str() {
        "block" => Ok(QueuePolicy::Block),
        "drop_oldest" | "drop-oldest" => Ok(QueuePolicy::DropOldest),
        "drop_newest" | "drop-newest" => Ok(QueuePolicy::DropNewest),
        other => anyhow::bail!("unsupported queue policy: {other}"),
    }
}

const AUDIO_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u16 = 2;

fn audio_frame_samples(codec: CodecId) -> usize {
    match codec {
        CodecId::Opus => 960,
        _ => 1024,
    }
}

fn build_track(codec: CodecId, args: &Args) -> TrackDescriptor {
    match codec.media_type() {
        MediaType::Video => {
            let pixel_format = match codec {
                CodecId::Jpeg => PixelFormat::Yuvj420p,
                CodecId::Png => PixelFormat::Rgb24,
                _ => PixelFormat::Yuv420p,
            };
            let mut params =
                VideoParams::new(args.width, args.height, f64::from(args.fps), pixel_format);
            params.key_frame_interval = Some(args.fps.max(1));
            TrackDescriptor::video(codec, Timebase::new(1, args.fps.max(1) as i32), params)
        }
        MediaType::Audio => {
            let sample_format = if codec == CodecId::Opus && args.legacy_opus {
                SampleFormat::S16
            } else {
                SampleFormat::F32Planar
            };
            TrackDescriptor::audio(
                codec,
                Timebase::new(1, AUDIO_RATE as i32),
                AudioParams::new(AUDIO_RATE, AUDIO_CHANNELS, sample_format),
            )
        }
    }
}

fn synthetic_frame(track: &TrackDescriptor, index: usize) -> MediaFrame {
    if let Some(video) = track.video_params() {
        let (width, height) = (video.width as usize, video.height as usize);
        let shade = (index * 4 % 220) as u8 + 16;
        let planes = match video.pixel_format {
            PixelFormat::Rgb24 => vec![Plane {
                data: vec![shade; width * 3 * height],
                stride: width * 3,
            }],
            _ => {
                let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
                vec![
                    Plane {
                        data: vec![shade; width * height],
                        stride: width,
                    },
                    Plane {
                        data: vec![128; cw * ch],
                        stride: cw,
                    },
                    Plane {
                        data: vec![128; cw * ch],
                        stride: cw,
                    },
                ]
            }
        };
        return MediaFrame::new(
            index as i64,
            track.timebase,
            FrameFormat::Video {
                width: video.width,
                height: video.height,
                pixel_format: video.pixel_format,
            },
            planes,
        );
    }

    let samples = audio_frame_samples(track.codec);
    let (sample_format, planes) = match track.audio_params().map(|a| a.sample_format) {
        Some(SampleFormat::S16) => (
            SampleFormat::S16,
            vec![Plane {
                data: vec![0; samples * usize::from(AUDIO_CHANNELS) * 2],
                stride: samples * usize::from(AUDIO_CHANNELS) * 2,
            }],
        ),
        _ => (
            SampleFormat::F32Planar,
            (0..AUDIO_CHANNELS)
                .map(|_| Plane {
                    data: vec![0; samples * 4],
                    stride: samples * 4,
                })
                .collect(),
        ),
    };
    MediaFrame::new(
        (index * samples) as i64,
        track.timebase,
        FrameFormat::Audio {
            samples,
            sample_rate: AUDIO_RATE,
            channels: AUDIO_CHANNELS,
            sample_format,
        },
        planes,
    )
    .with_duration(samples as i64)
}
