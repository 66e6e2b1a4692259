use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::{fmt, fmt::Display};

use tracing::{debug, error, warn};

use crate::completion::CompletionHandler;
use crate::pipeline::{BoundedQueue, QueuePolicy, QueueStats};
use crate::{
    BackendError, CodecId, EncoderBackend, EncoderId, MediaFrame, MediaPacket, Timebase,
    TrackDescriptor,
};

pub const MAX_QUEUE_SIZE: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Created,
    Configured,
    Running,
    Stopping,
    Stopped,
}

impl Display for EncoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Configured => f.write_str("configured"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("invalid encoder state: expected {expected}, found {found}")]
    InvalidState {
        expected: EncoderState,
        found: EncoderState,
    },
    #[error("failed to spawn encoder thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Clone, Default)]
struct OutputRoute {
    id: EncoderId,
    handler: Option<CompletionHandler>,
}

type SharedRoute = Arc<Mutex<OutputRoute>>;
type BackendSlot = Arc<Mutex<Option<Box<dyn EncoderBackend>>>>;

fn deliver(route: &SharedRoute, packet: MediaPacket) {
    let (id, handler) = {
        let route = route.lock().unwrap_or_else(PoisonError::into_inner);
        (route.id, route.handler.clone())
    };
    if let Some(handler) = handler {
        let pts = packet.pts;
        if panic::catch_unwind(AssertUnwindSafe(|| handler(id, packet))).is_err() {
            error!("completion handler of encoder {} panicked on pts={}", id, pts);
        }
    }
}

fn lock_slot(slot: &BackendSlot) -> MutexGuard<'_, Option<Box<dyn EncoderBackend>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Lifecycle {
    state: EncoderState,
    worker: Option<JoinHandle<()>>,
}

pub struct TranscodeEncoder {
    codec: CodecId,
    backend_name: String,
    track: Option<Arc<TrackDescriptor>>,
    route: SharedRoute,
    queue: Arc<BoundedQueue<Arc<MediaFrame>>>,
    alive: Arc<AtomicBool>,
    backend: BackendSlot,
    lifecycle: Mutex<Lifecycle>,
}

impl TranscodeEncoder {
    #[must_use]
    pub fn new(backend: Box<dyn EncoderBackend>) -> Self {
        Self::with_queue_policy(backend, QueuePolicy::default())
    }

    #[must_use]
    pub fn with_queue_policy(backend: Box<dyn EncoderBackend>, policy: QueuePolicy) -> Self {
        Self {
            codec: backend.codec(),
            backend_name: backend.name().to_string(),
            track: None,
            route: Arc::new(Mutex::new(OutputRoute::default())),
            queue: Arc::new(BoundedQueue::new(MAX_QUEUE_SIZE, policy)),
            alive: Arc::new(AtomicBool::new(false)),
            backend: Arc::new(Mutex::new(Some(backend))),
            lifecycle: Mutex::new(Lifecycle {
                state: EncoderState::Created,
                worker: None,
            }),
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn configure(&mut self, track: Arc<TrackDescriptor>) -> Result<(), EncoderError> {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if lifecycle.state != EncoderState::Created {
            return Err(EncoderError::InvalidState {
                expected: EncoderState::Created,
                found: lifecycle.state,
            });
        }
        if track.codec != self.codec {
            return Err(BackendError::UnsupportedCodec(track.codec).into());
        }
        let mut slot = lock_slot(&self.backend);
        let backend = slot.as_mut().ok_or(BackendError::NotConfigured)?;

        self.queue.set_alias(format!(
            "Input queue of Encoder. codec({}/{})",
            self.codec,
            self.codec.numeric_id()
        ));
        self.queue.set_capacity(MAX_QUEUE_SIZE);

        backend.configure(&track)?;
        drop(slot);
        self.track = Some(track);
        lifecycle.state = EncoderState::Configured;
        debug!(
            "encoder {} configured for {} ({})",
            self.backend_name,
            self.codec,
            self.queue.alias()
        );
        Ok(())
    }

    pub fn start(&self) -> Result<(), EncoderError> {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state != EncoderState::Configured {
            return Err(EncoderError::InvalidState {
                expected: EncoderState::Configured,
                found: lifecycle.state,
            });
        }
        if lock_slot(&self.backend).is_none() {
            return Err(BackendError::NotConfigured.into());
        }

        let backend = Arc::clone(&self.backend);
        let queue = Arc::clone(&self.queue);
        let alive = Arc::clone(&self.alive);
        let route = Arc::clone(&self.route);
        self.alive.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name(format!("enc-{}-{}", self.codec, self.instance_id()))
            .spawn(move || run_encoder(&backend, &queue, &alive, &route));
        match spawned {
            Ok(worker) => {
                lifecycle.worker = Some(worker);
                lifecycle.state = EncoderState::Running;
                debug!("encoder {} thread started", self.codec);
                Ok(())
            }
            Err(err) => {
                self.alive.store(false, Ordering::Release);
                self.queue.stop();
                let backend = lock_slot(&self.backend).take();
                if let Some(mut backend) = backend {
                    backend.release();
                }
                lifecycle.state = EncoderState::Stopped;
                Err(EncoderError::ThreadSpawn(err))
            }
        }
    }

    pub fn send_buffer(&self, frame: Arc<MediaFrame>) {
        let _ = self.queue.send(frame);
    }

    pub fn send_output_buffer(&self, packet: MediaPacket) {
        deliver(&self.route, packet);
    }

    pub fn set_instance_id(&mut self, id: EncoderId) {
        self.route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .id = id;
    }

    pub fn set_completion_handler(&mut self, handler: CompletionHandler) {
        self.route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handler = Some(handler);
    }

    /// Stops the worker and releases the backend. Safe to call before
    /// `start` and any number of times.
    pub fn stop(&self) {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.state == EncoderState::Stopped {
            return;
        }
        let was_running = lifecycle.state == EncoderState::Running;
        lifecycle.state = EncoderState::Stopping;

        self.alive.store(false, Ordering::Release);
        self.queue.stop();

        if let Some(worker) = lifecycle.worker.take() {
            if worker.join().is_err() {
                error!("encoder {} thread panicked", self.codec);
            }
            debug!("encoder {} thread has ended", self.codec);
        }

        let backend = lock_slot(&self.backend).take();
        if let Some(mut backend) = backend {
            if was_running && backend.supports_flush() {
                self.drain_backend(backend.as_mut());
            }
            backend.release();
        }

        let discarded = self.queue.clear();
        if discarded > 0 {
            debug!(
                "encoder {} discarded {} pending frames on stop",
                self.codec, discarded
            );
        }
        lifecycle.state = EncoderState::Stopped;
    }

    fn drain_backend(&self, backend: &mut dyn EncoderBackend) {
        match backend.flush() {
            Ok(packets) => {
                for packet in packets {
                    deliver(&self.route, packet);
                }
            }
            Err(err) => warn!(
                "encoder {} failed to flush {}: {}",
                self.codec,
                backend.name(),
                err
            ),
        }
    }

    pub fn state(&self) -> EncoderState {
        self.lock_lifecycle().state
    }

    pub fn codec_id(&self) -> CodecId {
        self.codec
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn instance_id(&self) -> EncoderId {
        self.route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .id
    }

    pub fn track(&self) -> Option<&Arc<TrackDescriptor>> {
        self.track.as_ref()
    }

    pub fn timebase(&self) -> Option<Timebase> {
        self.track.as_ref().map(|track| track.timebase)
    }

    pub fn queue_label(&self) -> String {
        self.queue.alias()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

impl Drop for TranscodeEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TranscodeEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeEncoder")
            .field("codec", &self.codec)
            .field("backend", &self.backend_name)
            .field("instance_id", &self.instance_id())
            .field("state", &self.state())
            .finish()
    }
}

fn run_encoder(
    slot: &BackendSlot,
    queue: &BoundedQueue<Arc<MediaFrame>>,
    alive: &AtomicBool,
    route: &SharedRoute,
) {
    while alive.load(Ordering::Acquire) {
        let Ok(frame) = queue.recv() else {
            break;
        };
        let mut guard = lock_slot(slot);
        let Some(backend) = guard.as_mut() else {
            break;
        };
        // A failed or panicking frame is dropped; the stream carries on with the next one.
        match panic::catch_unwind(AssertUnwindSafe(|| backend.encode(&frame))) {
            Ok(Ok(packets)) => {
                for packet in packets {
                    deliver(route, packet);
                }
            }
            Ok(Err(err)) => warn!(
                "encoder {} failed to encode frame pts={}: {}",
                backend.name(),
                frame.pts,
                err
            ),
            Err(_) => error!(
                "encoder {} panicked on frame pts={}",
                backend.name(),
                frame.pts
            ),
        }
    }
}
