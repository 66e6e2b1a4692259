use std::hint::black_box;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use transcode_hw::{
    BackendError, BoundedQueue, CodecId, EncoderBackend, EncoderId, FrameFormat, MAX_QUEUE_SIZE,
    MediaFrame, MediaPacket, PixelFormat, Plane, QueuePolicy, Timebase, TrackDescriptor,
    TranscodeEncoder, VideoParams, completion_handler,
};

const ITEMS: usize = 4_096;

fn bench_queue_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_queue_handoff");
    group.throughput(Throughput::Elements(ITEMS as u64));
    for policy in [QueuePolicy::Block, QueuePolicy::DropOldest] {
        group.bench_with_input(
            BenchmarkId::from_parameter(policy),
            &policy,
            |b, &policy| {
                b.iter(|| {
                    let queue = Arc::new(BoundedQueue::new(MAX_QUEUE_SIZE, policy));
                    let consumer = {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            let mut received = 0usize;
                            while queue.recv().is_ok() {
                                received += 1;
                            }
                            received
                        })
                    };
                    for i in 0..ITEMS {
                        let _ = queue.send(black_box(i));
                    }
                    while !queue.is_empty() {
                        thread::yield_now();
                    }
                    queue.stop();
                    black_box(consumer.join().unwrap_or_default())
                });
            },
        );
    }
    group.finish();
}

struct NullBackend;

impl EncoderBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn codec(&self) -> CodecId {
        CodecId::H264
    }

    fn configure(&mut self, _track: &TrackDescriptor) -> Result<(), BackendError> {
        Ok(())
    }

    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<MediaPacket>, BackendError> {
        Ok(vec![MediaPacket {
            codec: CodecId::H264,
            data: Vec::new(),
            pts: frame.pts,
            dts: frame.pts,
            duration: None,
            timebase: frame.timebase,
            is_keyframe: false,
        }])
    }
}

fn bench_encoder_roundtrip(c: &mut Criterion) {
    let track = Arc::new(TrackDescriptor::video(
        CodecId::H264,
        Timebase::new(1, 1000),
        VideoParams::new(64, 64, 30.0, PixelFormat::Yuv420p),
    ));
    let frame = Arc::new(MediaFrame::new(
        0,
        Timebase::new(1, 1000),
        FrameFormat::Video {
            width: 64,
            height: 64,
            pixel_format: PixelFormat::Yuv420p,
        },
        vec![Plane {
            data: vec![0; 64 * 64],
            stride: 64,
        }],
    ));

    let mut group = c.benchmark_group("encoder_worker");
    group.throughput(Throughput::Elements(ITEMS as u64));
    group.bench_function("send_to_completion", |b| {
        b.iter(|| {
            let (tx, rx) = mpsc::channel();
            let mut encoder = TranscodeEncoder::new(Box::new(NullBackend));
            encoder.set_instance_id(EncoderId(1));
            encoder.set_completion_handler(completion_handler(move |_, packet| {
                let _ = tx.send(packet.pts);
            }));
            if encoder.configure(Arc::clone(&track)).is_err() || encoder.start().is_err() {
                return;
            }
            for _ in 0..ITEMS {
                encoder.send_buffer(Arc::clone(&frame));
            }
            for _ in 0..ITEMS {
                if rx.recv().is_err() {
                    break;
                }
            }
            encoder.stop();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_queue_handoff, bench_encoder_roundtrip);
criterion_main!(benches);
