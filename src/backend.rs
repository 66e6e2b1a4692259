use std::collections::BTreeMap;
use std::sync::Arc;
use std::{fmt, fmt::Display};

use tracing::{debug, error, info};

use crate::capability::{AcceleratorFamily, CapabilityOracle};
use crate::completion::CompletionHandler;
use crate::encoder::TranscodeEncoder;
use crate::pipeline::QueuePolicy;
use crate::{CodecId, EncoderBackend, EncoderId, TrackDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Hardware(AcceleratorFamily),
    Software,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware(family) => write!(f, "hardware({family})"),
            Self::Software => f.write_str("software"),
        }
    }
}

pub type BackendConstructor = Arc<dyn Fn() -> Box<dyn EncoderBackend> + Send + Sync>;

#[derive(Clone)]
pub struct BackendCandidate {
    pub name: String,
    pub kind: BackendKind,
    constructor: BackendConstructor,
}

impl BackendCandidate {
    pub fn new<F>(name: impl Into<String>, kind: BackendKind, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn EncoderBackend> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind,
            constructor: Arc::new(constructor),
        }
    }

    pub fn hardware<F>(name: impl Into<String>, family: AcceleratorFamily, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn EncoderBackend> + Send + Sync + 'static,
    {
        Self::new(name, BackendKind::Hardware(family), constructor)
    }

    pub fn software<F>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Box<dyn EncoderBackend> + Send + Sync + 'static,
    {
        Self::new(name, BackendKind::Software, constructor)
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self.kind, BackendKind::Hardware(_))
    }

    fn instantiate(&self) -> Box<dyn EncoderBackend> {
        (self.constructor)()
    }
}

impl fmt::Debug for BackendCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCandidate")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    table: BTreeMap<CodecId, Vec<BackendCandidate>>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, codec: CodecId, candidate: BackendCandidate) -> Self {
        self.table.entry(codec).or_default().push(candidate);
        self
    }

    pub fn candidates(&self, codec: CodecId) -> Option<&[BackendCandidate]> {
        self.table.get(&codec).map(Vec::as_slice)
    }

    pub fn codecs(&self) -> impl Iterator<Item = CodecId> + '_ {
        self.table.keys().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub hwaccel_enabled: bool,
    pub queue_policy: QueuePolicy,
    pub legacy_opus: bool,
}

impl DispatcherConfig {
    #[must_use]
    pub fn new(hwaccel_enabled: bool) -> Self {
        Self {
            hwaccel_enabled,
            ..Self::default()
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            hwaccel_enabled: cfg!(feature = "hwaccel"),
            queue_policy: QueuePolicy::default(),
            legacy_opus: false,
        }
    }
}

impl Display for DispatcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DispatcherConfig(hwaccel_enabled={}, queue_policy={}, legacy_opus={})",
            self.hwaccel_enabled, self.queue_policy, self.legacy_opus
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no encoder registered for codec {0}")]
    UnsupportedCodec(CodecId),
    #[error("no backend available for {codec}: {diagnostics}")]
    NoBackendAvailable { codec: CodecId, diagnostics: String },
}

pub struct Dispatcher {
    registry: BackendRegistry,
    oracle: Arc<dyn CapabilityOracle>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: BackendRegistry,
        oracle: Arc<dyn CapabilityOracle>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            oracle,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn create(
        &self,
        encoder_id: EncoderId,
        track: Arc<TrackDescriptor>,
        handler: CompletionHandler,
    ) -> Result<TranscodeEncoder, DispatchError> {
        let codec = track.codec;
        let Some(candidates) = self.registry.candidates(codec) else {
            error!("encoder {} requested unregistered codec {}", encoder_id, codec);
            return Err(DispatchError::UnsupportedCodec(codec));
        };

        let try_hardware = track.hardware_accel && self.config.hwaccel_enabled;
        let mut diagnostics = Vec::new();

        let hardware = candidates.iter().filter(|c| c.is_hardware());
        let software = candidates.iter().filter(|c| !c.is_hardware());
        for candidate in hardware.chain(software) {
            if let BackendKind::Hardware(family) = candidate.kind {
                if !try_hardware {
                    diagnostics.push(format!(
                        "{}: hardware acceleration not requested",
                        candidate.name
                    ));
                    continue;
                }
                if !self.oracle.is_supported(family) {
                    diagnostics.push(format!("{}: {} not available", candidate.name, family));
                    continue;
                }
            }

            let mut encoder = TranscodeEncoder::with_queue_policy(
                candidate.instantiate(),
                self.config.queue_policy,
            );
            match encoder.configure(Arc::clone(&track)) {
                Ok(()) => {
                    encoder.set_instance_id(encoder_id);
                    encoder.set_completion_handler(handler);
                    info!(
                        "encoder {} selected {} ({}) for {}",
                        encoder_id, candidate.name, candidate.kind, codec
                    );
                    return Ok(encoder);
                }
                Err(err) => {
                    debug!(
                        "encoder {} rejected candidate {} for {}: {}",
                        encoder_id, candidate.name, codec, err
                    );
                    diagnostics.push(format!("{}: {}", candidate.name, err));
                }
            }
        }

        let diagnostics = if diagnostics.is_empty() {
            "no eligible backend candidate".to_string()
        } else {
            diagnostics.join("; ")
        };
        Err(DispatchError::NoBackendAvailable { codec, diagnostics })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::rstest;

    use super::*;
    use crate::capability::StaticCapabilities;
    use crate::completion::completion_handler;
    use crate::{BackendError, MediaFrame, MediaPacket, PixelFormat, Timebase, VideoParams};

    struct StubBackend {
        name: &'static str,
        codec: CodecId,
        accept: bool,
    }

    impl EncoderBackend for StubBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn codec(&self) -> CodecId {
            self.codec
        }

        fn configure(&mut self, _track: &TrackDescriptor) -> Result<(), BackendError> {
            if self.accept {
                Ok(())
            } else {
                Err(BackendError::UnsupportedConfig(format!("{} refused", self.name)))
            }
        }

        fn encode(&mut self, _frame: &MediaFrame) -> Result<Vec<MediaPacket>, BackendError> {
            Ok(Vec::new())
        }
    }

    fn stub(
        name: &'static str,
        codec: CodecId,
        accept: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> impl Fn() -> Box<dyn EncoderBackend> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move || {
            log.lock().unwrap().push(name);
            Box::new(StubBackend {
                name,
                codec,
                accept,
            })
        }
    }

    fn h264_registry(
        qsv_accepts: bool,
        nvenc_accepts: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> BackendRegistry {
        BackendRegistry::new()
            .register(
                CodecId::H264,
                BackendCandidate::software("sw", stub("sw", CodecId::H264, true, log)),
            )
            .register(
                CodecId::H264,
                BackendCandidate::hardware(
                    "qsv",
                    AcceleratorFamily::Qsv,
                    stub("qsv", CodecId::H264, qsv_accepts, log),
                ),
            )
            .register(
                CodecId::H264,
                BackendCandidate::hardware(
                    "nvenc",
                    AcceleratorFamily::Nvidia,
                    stub("nvenc", CodecId::H264, nvenc_accepts, log),
                ),
            )
    }

    fn track(codec: CodecId, hardware_accel: bool) -> Arc<TrackDescriptor> {
        Arc::new(
            TrackDescriptor::video(
                codec,
                Timebase::new(1, 90_000),
                VideoParams::new(640, 360, 30.0, PixelFormat::Yuv420p),
            )
            .with_hardware_accel(hardware_accel),
        )
    }

    fn noop() -> CompletionHandler {
        completion_handler(|_, _| {})
    }

    #[rstest]
    #[case::hw_not_requested(false, true, &[AcceleratorFamily::Qsv], "sw", &["sw"])]
    #[case::hwaccel_disabled(true, false, &[AcceleratorFamily::Qsv], "sw", &["sw"])]
    #[case::qsv_first(
        true,
        true,
        &[AcceleratorFamily::Qsv, AcceleratorFamily::Nvidia],
        "qsv",
        &["qsv"]
    )]
    #[case::nvidia_only(true, true, &[AcceleratorFamily::Nvidia], "nvenc", &["nvenc"])]
    #[case::no_accelerator(true, true, &[], "sw", &["sw"])]
    fn dispatch_follows_priority(
        #[case] hardware_accel: bool,
        #[case] hwaccel_enabled: bool,
        #[case] supported: &[AcceleratorFamily],
        #[case] expected: &str,
        #[case] constructed: &[&str],
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            h264_registry(true, true, &log),
            Arc::new(StaticCapabilities::new(supported)),
            DispatcherConfig::new(hwaccel_enabled),
        );
        let encoder = dispatcher
            .create(EncoderId(5), track(CodecId::H264, hardware_accel), noop())
            .unwrap();
        assert_eq!(encoder.backend_name(), expected);
        assert_eq!(encoder.instance_id(), EncoderId(5));
        assert_eq!(*log.lock().unwrap(), constructed);
    }

    #[test]
    fn rejected_hardware_falls_through_to_next_candidate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            h264_registry(false, false, &log),
            Arc::new(StaticCapabilities::all()),
            DispatcherConfig::new(true),
        );
        let encoder = dispatcher
            .create(EncoderId(1), track(CodecId::H264, true), noop())
            .unwrap();
        assert_eq!(encoder.backend_name(), "sw");
        assert_eq!(*log.lock().unwrap(), ["qsv", "nvenc", "sw"]);
    }

    #[test]
    fn hardware_only_codec_fails_without_accelerators() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = BackendRegistry::new().register(
            CodecId::H265,
            BackendCandidate::hardware(
                "hevc_qsv",
                AcceleratorFamily::Qsv,
                stub("hevc_qsv", CodecId::H265, true, &log),
            ),
        );
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(StaticCapabilities::none()),
            DispatcherConfig::new(true),
        );
        let err = dispatcher
            .create(EncoderId(2), track(CodecId::H265, true), noop())
            .unwrap_err();
        match err {
            DispatchError::NoBackendAvailable { codec, diagnostics } => {
                assert_eq!(codec, CodecId::H265);
                assert!(diagnostics.contains("hevc_qsv: qsv not available"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn unregistered_codec_is_reported() {
        let dispatcher = Dispatcher::new(
            BackendRegistry::new(),
            Arc::new(StaticCapabilities::all()),
            DispatcherConfig::default(),
        );
        assert!(matches!(
            dispatcher.create(EncoderId(0), track(CodecId::Av1, false), noop()),
            Err(DispatchError::UnsupportedCodec(CodecId::Av1))
        ));
    }

    #[test]
    fn oracle_is_not_consulted_when_hardware_is_off() {
        struct CountingOracle(AtomicUsize);
        impl CapabilityOracle for CountingOracle {
            fn is_supported(&self, _family: AcceleratorFamily) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let oracle = Arc::new(CountingOracle(AtomicUsize::new(0)));
        let dispatcher = Dispatcher::new(
            h264_registry(true, true, &log),
            Arc::clone(&oracle) as Arc<dyn CapabilityOracle>,
            DispatcherConfig::new(false),
        );
        dispatcher
            .create(EncoderId(0), track(CodecId::H264, true), noop())
            .unwrap();
        assert_eq!(oracle.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn config_display_lists_every_field() {
        let config = DispatcherConfig {
            hwaccel_enabled: true,
            queue_policy: QueuePolicy::DropOldest,
            legacy_opus: true,
        };
        assert_eq!(
            config.to_string(),
            "DispatcherConfig(hwaccel_enabled=true, queue_policy=drop_oldest, legacy_opus=true)"
        );
    }

    #[test]
    fn default_config_follows_hwaccel_feature() {
        let config = DispatcherConfig::default();
        assert_eq!(config.hwaccel_enabled, cfg!(feature = "hwaccel"));
        assert_eq!(config.queue_policy, QueuePolicy::Block);
        assert!(!config.legacy_opus);
    }
}
