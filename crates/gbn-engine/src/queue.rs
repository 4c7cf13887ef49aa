//! Bounded FIFO handing payloads between the application thread and the engine.
//!
//! Built on `std::sync::mpsc::sync_channel`; a shared occupancy counter adds
//! the non-blocking `has_capacity` / `has_data` checks the engine and the
//! application poll on. The counter is bumped before an item enters the
//! channel and dropped after it leaves, so it never underflows.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};

use crate::error::RdtError;

/// Producer half.
pub struct QueueTx<T> {
    name: &'static str,
    tx: SyncSender<T>,
    len: Arc<AtomicUsize>,
    capacity: usize,
}

/// Consumer half.
pub struct QueueRx<T> {
    name: &'static str,
    rx: Receiver<T>,
    len: Arc<AtomicUsize>,
}

/// Create a queue holding at most `capacity` items. `name` shows up in
/// [`RdtError::QueueClosed`].
pub fn app_queue<T>(name: &'static str, capacity: usize) -> (QueueTx<T>, QueueRx<T>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let len = Arc::new(AtomicUsize::new(0));
    (
        QueueTx {
            name,
            tx,
            len: len.clone(),
            capacity,
        },
        QueueRx { name, rx, len },
    )
}

impl<T> QueueTx<T> {
    /// Enqueue, blocking while the queue is full.
    pub fn put(&self, item: T) -> Result<(), RdtError> {
        self.len.fetch_add(1, Ordering::AcqRel);
        self.tx.send(item).map_err(|_| {
            self.len.fetch_sub(1, Ordering::AcqRel);
            RdtError::QueueClosed(self.name)
        })
    }

    pub fn has_capacity(&self) -> bool {
        self.len.load(Ordering::Acquire) < self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> QueueRx<T> {
    /// Dequeue, blocking until an item is available.
    pub fn take(&self) -> Result<T, RdtError> {
        let item = self.rx.recv().map_err(|_| RdtError::QueueClosed(self.name))?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Ok(item)
    }

    /// Dequeue without blocking. An empty queue is `Ok(None)`; an empty queue
    /// whose producer is gone is an error.
    pub fn try_take(&self) -> Result<Option<T>, RdtError> {
        match self.rx.try_recv() {
            Ok(item) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Ok(Some(item))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(RdtError::QueueClosed(self.name)),
        }
    }

    pub fn has_data(&self) -> bool {
        self.len.load(Ordering::Acquire) > 0
    }
}
