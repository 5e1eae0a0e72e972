//! FIFO action queue.
//!
//! A thin wrapper over tokio's mpsc channels that fixes the overflow policy
//! at construction. Every accepted item lands in a single total order shared
//! by all producers; the receiving half is owned by the dispatch loop.

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::config::{OverflowPolicy, QueueConfig};
use crate::error::StoreError;

/// Create a queue with the given shape.
pub fn channel<T>(config: QueueConfig) -> (QueueSender<T>, QueueReceiver<T>) {
    match config.capacity {
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                QueueSender {
                    kind: SenderKind::Unbounded(tx),
                },
                QueueReceiver {
                    kind: ReceiverKind::Unbounded(rx),
                },
            )
        }
        Some(capacity) => {
            // tokio panics on zero; config validation rejects it earlier.
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                QueueSender {
                    kind: SenderKind::Bounded {
                        tx,
                        capacity,
                        overflow: config.overflow,
                    },
                },
                QueueReceiver {
                    kind: ReceiverKind::Bounded(rx),
                },
            )
        }
    }
}

enum SenderKind<T> {
    Unbounded(mpsc::UnboundedSender<T>),
    Bounded {
        tx: mpsc::Sender<T>,
        capacity: usize,
        overflow: OverflowPolicy,
    },
}

/// Producer half. Cheap to clone.
pub struct QueueSender<T> {
    kind: SenderKind<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            SenderKind::Unbounded(tx) => SenderKind::Unbounded(tx.clone()),
            SenderKind::Bounded {
                tx,
                capacity,
                overflow,
            } => SenderKind::Bounded {
                tx: tx.clone(),
                capacity: *capacity,
                overflow: *overflow,
            },
        };
        Self { kind }
    }
}

impl<T> QueueSender<T> {
    /// Append an item.
    ///
    /// Unbounded and `Reject` queues never suspend. A `Block` queue suspends
    /// while full. Fails with `Stopped` once the receiver has closed.
    pub async fn enqueue(&self, item: T) -> Result<(), StoreError> {
        match &self.kind {
            SenderKind::Unbounded(tx) => tx.send(item).map_err(|_| StoreError::Stopped),
            SenderKind::Bounded {
                tx,
                overflow: OverflowPolicy::Block,
                ..
            } => tx.send(item).await.map_err(|_| StoreError::Stopped),
            SenderKind::Bounded {
                tx,
                capacity,
                overflow: OverflowPolicy::Reject,
            } => tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => StoreError::QueueSaturated {
                    capacity: *capacity,
                },
                TrySendError::Closed(_) => StoreError::Stopped,
            }),
        }
    }

    /// Append without ever suspending. A full `Block` queue is reported as
    /// saturated instead of waiting.
    pub fn try_enqueue(&self, item: T) -> Result<(), StoreError> {
        match &self.kind {
            SenderKind::Unbounded(tx) => tx.send(item).map_err(|_| StoreError::Stopped),
            SenderKind::Bounded { tx, capacity, .. } => tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(_) => StoreError::QueueSaturated {
                    capacity: *capacity,
                },
                TrySendError::Closed(_) => StoreError::Stopped,
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.kind {
            SenderKind::Unbounded(tx) => tx.is_closed(),
            SenderKind::Bounded { tx, .. } => tx.is_closed(),
        }
    }
}

enum ReceiverKind<T> {
    Unbounded(mpsc::UnboundedReceiver<T>),
    Bounded(mpsc::Receiver<T>),
}

/// Consumer half. Exactly one exists per queue.
pub struct QueueReceiver<T> {
    kind: ReceiverKind<T>,
}

impl<T> QueueReceiver<T> {
    /// Next item in FIFO order. `None` once the queue is closed and empty, or
    /// every sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.kind {
            ReceiverKind::Unbounded(rx) => rx.recv().await,
            ReceiverKind::Bounded(rx) => rx.recv().await,
        }
    }

    /// Next buffered item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        match &mut self.kind {
            ReceiverKind::Unbounded(rx) => rx.try_recv().ok(),
            ReceiverKind::Bounded(rx) => rx.try_recv().ok(),
        }
    }

    /// Refuse further items. Already buffered items can still be received.
    pub fn close(&mut self) {
        match &mut self.kind {
            ReceiverKind::Unbounded(rx) => rx.close(),
            ReceiverKind::Bounded(rx) => rx.close(),
        }
    }
}
