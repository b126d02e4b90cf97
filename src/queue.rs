//! Bounded hand-off between the capture side and verification workers.
//!
//! Producers call [`QueueProducer::try_enqueue`], which never waits: when the
//! queue is full the frame is handed back and the caller counts the drop.
//! Workers share one [`QueueConsumer`] and suspend in [`QueueConsumer::dequeue`].

use crate::beacon::BeaconFrame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, mpsc};

/// Default number of frames waiting for verification.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Why a frame could not be queued. The rejected frame is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnqueueError {
    #[error("hand-off queue is full")]
    Full(BeaconFrame),
    #[error("hand-off queue is closed")]
    Closed(BeaconFrame),
}

/// Largest capacity a hand-off queue can have.
pub const MAX_QUEUE_CAPACITY: usize = Semaphore::MAX_PERMITS;

/// Create a bounded FIFO queue with room for `capacity` frames, clamped to
/// `1..=MAX_QUEUE_CAPACITY`.
pub fn handoff_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity.clamp(1, MAX_QUEUE_CAPACITY));
    (
        QueueProducer { tx },
        QueueConsumer {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producer half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<BeaconFrame>,
}

impl QueueProducer {
    /// Queue a frame without waiting.
    pub fn try_enqueue(&self, frame: BeaconFrame) -> Result<(), EnqueueError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(frame) => EnqueueError::Full(frame),
            mpsc::error::TrySendError::Closed(frame) => EnqueueError::Closed(frame),
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Consumer half. Clones share the same underlying queue, so each frame is
/// delivered to exactly one worker.
#[derive(Debug, Clone)]
pub struct QueueConsumer {
    rx: Arc<Mutex<mpsc::Receiver<BeaconFrame>>>,
}

impl QueueConsumer {
    /// Wait for the next frame.
    ///
    /// Returns `None` once every producer has been dropped and the queue is drained.
    pub async fn dequeue(&self) -> Option<BeaconFrame> {
        self.rx.lock().await.recv().await
    }
}
