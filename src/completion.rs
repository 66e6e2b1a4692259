use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use tracing::trace;

use crate::pipeline::QueueRecvError;
use crate::{EncoderId, MediaPacket};

/// Runs synchronously on the encoder's worker thread; a handler that blocks
/// stalls that encoder's ingestion.
pub type CompletionHandler = Arc<dyn Fn(EncoderId, MediaPacket) + Send + Sync>;

pub fn completion_handler<F>(handler: F) -> CompletionHandler
where
    F: Fn(EncoderId, MediaPacket) + Send + Sync + 'static,
{
    Arc::new(handler)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPacket {
    pub encoder_id: EncoderId,
    pub packet: MediaPacket,
}

#[derive(Debug)]
pub struct PacketReceiver {
    inner: Receiver<CompletedPacket>,
}

impl PacketReceiver {
    pub fn recv(&self) -> Result<CompletedPacket, QueueRecvError> {
        self.inner.recv().map_err(|_| QueueRecvError::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<CompletedPacket, QueueRecvError> {
        self.inner.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => QueueRecvError::Timeout,
            RecvTimeoutError::Disconnected => QueueRecvError::Disconnected,
        })
    }

    pub fn try_recv(&self) -> Result<CompletedPacket, QueueRecvError> {
        self.inner.try_recv().map_err(|err| match err {
            TryRecvError::Empty => QueueRecvError::Empty,
            TryRecvError::Disconnected => QueueRecvError::Disconnected,
        })
    }

    pub fn drain(&self) -> Vec<CompletedPacket> {
        self.inner.try_iter().collect()
    }
}

pub fn completion_channel() -> (CompletionHandler, PacketReceiver) {
    let (tx, rx) = mpsc::channel::<CompletedPacket>();
    let handler = completion_handler(move |encoder_id, packet| {
        if tx.send(CompletedPacket { encoder_id, packet }).is_err() {
            trace!("completion receiver dropped, discarding packet from encoder {}", encoder_id);
        }
    });
    (handler, PacketReceiver { inner: rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodecId, Timebase};

    fn packet(pts: i64) -> MediaPacket {
        MediaPacket {
            codec: CodecId::Opus,
            data: vec![0xfc, 0xff],
            pts,
            dts: pts,
            duration: Some(960),
            timebase: Timebase::new(1, 48_000),
            is_keyframe: true,
        }
    }

    #[test]
    fn channel_delivers_in_order_with_encoder_ids() {
        let (handler, rx) = completion_channel();
        handler(EncoderId(3), packet(0));
        handler(EncoderId(4), packet(960));

        let first = rx.recv().unwrap();
        assert_eq!(first.encoder_id, EncoderId(3));
        assert_eq!(first.packet.pts, 0);
        let rest = rx.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].encoder_id, EncoderId(4));
        assert_eq!(rx.try_recv(), Err(QueueRecvError::Empty));
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(1)),
            Err(QueueRecvError::Timeout)
        );
    }

    #[test]
    fn handler_outlives_receiver_without_panicking() {
        let (handler, rx) = completion_channel();
        drop(rx);
        handler(EncoderId(1), packet(0));
    }

    #[test]
    fn dropped_handler_disconnects_receiver() {
        let (handler, rx) = completion_channel();
        drop(handler);
        assert_eq!(rx.recv(), Err(QueueRecvError::Disconnected));
    }
}
