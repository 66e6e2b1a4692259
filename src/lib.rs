mod backend;
mod capability;
mod completion;
mod contract;
mod encoder;
#[cfg(feature = "backend-ffmpeg")]
mod ffmpeg_backend;
mod pipeline;

pub use backend::{
    BackendCandidate, BackendConstructor, BackendKind, BackendRegistry, DispatchError, Dispatcher,
    DispatcherConfig,
};
pub use capability::{
    AcceleratorFamily, CapabilityOracle, CapabilityReport, DISABLE_HWACCEL_ENV,
    ProbedCapabilities, StaticCapabilities,
};
pub use completion::{
    CompletedPacket, CompletionHandler, PacketReceiver, completion_channel, completion_handler,
};
pub use contract::{
    AudioParams, BackendError, CodecId, EncoderBackend, EncoderId, FrameFormat, MediaFrame,
    MediaPacket, MediaType, PixelFormat, Plane, SampleFormat, Timebase, TrackDescriptor,
    TrackParams, VideoParams,
};
pub use encoder::{EncoderError, EncoderState, MAX_QUEUE_SIZE, TranscodeEncoder};
#[cfg(feature = "backend-ffmpeg")]
pub use ffmpeg_backend::{
    FfmpegEncoder, host_capabilities, probe_hw_device, report_missing_encoders, standard_registry,
};
pub use pipeline::{
    BoundedQueue, Enqueued, QueuePolicy, QueueRecvError, QueueSendError, QueueStats,
};
