use std::collections::BTreeMap;
use std::{fmt, fmt::Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodecId {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    Jpeg,
    Png,
    Aac,
    Opus,
    Mp3,
}

impl CodecId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "hevc",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::Jpeg => "mjpeg",
            Self::Png => "png",
            Self::Aac => "aac",
            Self::Opus => "opus",
            Self::Mp3 => "mp3",
        }
    }

    pub fn numeric_id(self) -> u32 {
        match self {
            Self::H264 => 27,
            Self::H265 => 173,
            Self::Vp8 => 139,
            Self::Vp9 => 167,
            Self::Av1 => 226,
            Self::Jpeg => 7,
            Self::Png => 61,
            Self::Aac => 86018,
            Self::Opus => 86076,
            Self::Mp3 => 86017,
        }
    }

    pub fn media_type(self) -> MediaType {
        match self {
            Self::Aac | Self::Opus | Self::Mp3 => MediaType::Audio,
            _ => MediaType::Video,
        }
    }

    pub fn from_name(v: &str) -> Option<Self> {
        match v.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Some(Self::H264),
            "h265" | "hevc" => Some(Self::H265),
            "vp8" => Some(Self::Vp8),
            "vp9" => Some(Self::Vp9),
            "av1" => Some(Self::Av1),
            "jpeg" | "mjpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "aac" => Some(Self::Aac),
            "opus" => Some(Self::Opus),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }
}

impl Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EncoderId(pub i32);

impl Display for EncoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub num: i32,
    pub den: i32,
}

impl Timebase {
    #[must_use]
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn rescale(self, value: i64, to: Timebase) -> i64 {
        if self == to || self.den == 0 || to.num == 0 {
            return value;
        }
        let numer = i128::from(value) * i128::from(self.num) * i128::from(to.den);
        let denom = i128::from(self.den) * i128::from(to.num);
        let mut quotient = numer / denom;
        let remainder = numer % denom;
        if remainder.abs() * 2 >= denom.abs() {
            quotient += numer.signum() * denom.signum();
        }
        i64::try_from(quotient).unwrap_or(if quotient < 0 { i64::MIN } else { i64::MAX })
    }
}

impl Display for Timebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420p,
    Yuvj420p,
    Nv12,
    Rgb24,
    Rgba,
    Bgra,
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yuv420p => f.write_str("yuv420p"),
            Self::Yuvj420p => f.write_str("yuvj420p"),
            Self::Nv12 => f.write_str("nv12"),
            Self::Rgb24 => f.write_str("rgb24"),
            Self::Rgba => f.write_str("rgba"),
            Self::Bgra => f.write_str("bgra"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    S16Planar,
    F32,
    F32Planar,
}

impl Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S16 => f.write_str("s16"),
            Self::S16Planar => f.write_str("s16p"),
            Self::F32 => f.write_str("flt"),
            Self::F32Planar => f.write_str("fltp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub pixel_format: PixelFormat,
    pub bitrate: u64,
    pub key_frame_interval: Option<u32>,
    pub profile: Option<String>,
}

impl VideoParams {
    #[must_use]
    pub fn new(width: u32, height: u32, framerate: f64, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            framerate,
            pixel_format,
            bitrate: 0,
            key_frame_interval: None,
            profile: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    pub bitrate: u64,
}

impl AudioParams {
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
            bitrate: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackParams {
    Video(VideoParams),
    Audio(AudioParams),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackDescriptor {
    pub codec: CodecId,
    pub timebase: Timebase,
    pub hardware_accel: bool,
    pub params: TrackParams,
    pub options: BTreeMap<String, String>,
}

impl TrackDescriptor {
    #[must_use]
    pub fn video(codec: CodecId, timebase: Timebase, params: VideoParams) -> Self {
        Self {
            codec,
            timebase,
            hardware_accel: false,
            params: TrackParams::Video(params),
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn audio(codec: CodecId, timebase: Timebase, params: AudioParams) -> Self {
        Self {
            codec,
            timebase,
            hardware_accel: false,
            params: TrackParams::Audio(params),
            options: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_hardware_accel(mut self, enabled: bool) -> Self {
        self.hardware_accel = enabled;
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn video_params(&self) -> Option<&VideoParams> {
        match &self.params {
            TrackParams::Video(params) => Some(params),
            TrackParams::Audio(_) => None,
        }
    }

    pub fn audio_params(&self) -> Option<&AudioParams> {
        match &self.params {
            TrackParams::Audio(params) => Some(params),
            TrackParams::Video(_) => None,
        }
    }
}

impl Display for TrackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TrackDescriptor(codec={}, timebase={}, hardware_accel={})",
            self.codec, self.timebase, self.hardware_accel
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Video {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    },
    Audio {
        samples: usize,
        sample_rate: u32,
        channels: u16,
        sample_format: SampleFormat,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub pts: i64,
    pub duration: Option<i64>,
    pub timebase: Timebase,
    pub format: FrameFormat,
    pub planes: Vec<Plane>,
}

impl MediaFrame {
    #[must_use]
    pub fn new(pts: i64, timebase: Timebase, format: FrameFormat, planes: Vec<Plane>) -> Self {
        Self {
            pts,
            duration: None,
            timebase,
            format,
            planes,
        }
    }

    #[must_use]
    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn payload_len(&self) -> usize {
        self.planes.iter().map(|plane| plane.data.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPacket {
    pub codec: CodecId,
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    pub duration: Option<i64>,
    pub timebase: Timebase,
    pub is_keyframe: bool,
}

impl Display for MediaPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MediaPacket(codec={}, len={}, pts={}, dts={}, key={})",
            self.codec,
            self.data.len(),
            self.pts,
            self.dts,
            self.is_keyframe
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(CodecId),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("backend is not configured")]
    NotConfigured,
    #[error("backend error: {0}")]
    Backend(String),
}

pub trait EncoderBackend: Send {
    fn name(&self) -> &str;

    fn codec(&self) -> CodecId;

    /// Negotiates backend parameters for `track`. An error makes the
    /// dispatcher discard this backend and try the next candidate.
    fn configure(&mut self, track: &TrackDescriptor) -> Result<(), BackendError>;

    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<MediaPacket>, BackendError>;

    fn supports_flush(&self) -> bool {
        false
    }

    fn flush(&mut self) -> Result<Vec<MediaPacket>, BackendError> {
        Ok(Vec::new())
    }

    /// Frees native resources. Called at most once per backend by the
    /// encoder instance, but implementations must tolerate repeat calls.
    fn release(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names_round_trip_through_aliases() {
        assert_eq!(CodecId::from_name("AVC"), Some(CodecId::H264));
        assert_eq!(CodecId::from_name("h265"), Some(CodecId::H265));
        assert_eq!(CodecId::from_name("jpeg"), Some(CodecId::Jpeg));
        assert_eq!(CodecId::from_name("theora"), None);
        assert_eq!(CodecId::H265.to_string(), "hevc");
    }

    #[test]
    fn audio_codecs_report_audio_media_type() {
        assert_eq!(CodecId::Opus.media_type(), MediaType::Audio);
        assert_eq!(CodecId::Aac.media_type(), MediaType::Audio);
        assert_eq!(CodecId::Vp8.media_type(), MediaType::Video);
    }

    #[test]
    fn timebase_rescale_rounds_to_nearest() {
        let ms = Timebase::new(1, 1000);
        let k90 = Timebase::new(1, 90_000);
        assert_eq!(ms.rescale(33, k90), 2970);
        assert_eq!(k90.rescale(2970, ms), 33);
        assert_eq!(k90.rescale(3001, ms), 33);
        assert_eq!(ms.rescale(-33, k90), -2970);
        assert_eq!(Timebase::new(1, 0).rescale(5, ms), 5);
    }

    #[test]
    fn track_builder_sets_hwaccel_and_options() {
        let track = TrackDescriptor::video(
            CodecId::H264,
            Timebase::new(1, 90_000),
            VideoParams::new(1280, 720, 30.0, PixelFormat::Yuv420p),
        )
        .with_hardware_accel(true)
        .with_option("preset", "fast");
        assert!(track.hardware_accel);
        assert_eq!(track.options.get("preset").map(String::as_str), Some("fast"));
        assert!(track.audio_params().is_none());
        assert_eq!(track.video_params().map(|p| p.width), Some(1280));
    }
}
