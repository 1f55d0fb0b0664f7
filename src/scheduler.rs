// scheduler.rs

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::debug;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Relative priority of a pipeline task.
///
/// Tokio does not preempt by priority, so this only decides spawn order
/// (highest first) and shows up in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

/// Name and priority of a long-running task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: &'static str,
    pub priority: TaskPriority,
}

impl TaskSpec {
    pub const fn new(name: &'static str, priority: TaskPriority) -> Self {
        Self { name, priority }
    }
}

/// Spawn a task that runs for the lifetime of the process (or until aborted).
pub fn spawn_task<F>(spec: TaskSpec, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    debug!("spawning task '{}' at {:?} priority", spec.name, spec.priority);
    tokio::spawn(future)
}

/// Cooperatively give up the processor for `duration`.
pub async fn delay(duration: Duration) {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(duration).await;
    }
}

/// An item handed out by [`BoundedQueue::dequeue`], tagged with the queue
/// epoch it was enqueued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queued<T> {
    pub value: T,
    pub epoch: u64,
}

/// Fixed-capacity FIFO shared by one producer, one consumer and a reset path.
///
/// Every [`drain`](Self::drain) starts a new epoch once the queue is empty.
/// An enqueue that races a drain lands an item tagged with the old epoch;
/// `dequeue` drops such items instead of handing them to the consumer.
pub struct BoundedQueue<T> {
    sender: Sender<Queued<T>>,
    receiver: Receiver<Queued<T>>,
    capacity: usize,
    epoch: AtomicU64,
    available: Notify,
}

impl<T: Send> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
            epoch: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Whether nothing has been drained since `epoch` was observed.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    /// Append `value` at the tail without waiting.
    ///
    /// Returns the epoch the value was queued under, or hands the value
    /// back when the queue is full.
    pub fn try_enqueue(&self, value: T) -> Result<u64, T> {
        let epoch = self.epoch();
        match self.sender.try_send(Queued { value, epoch }) {
            Ok(()) => {
                self.available.notify_one();
                Ok(epoch)
            }
            Err(TrySendError::Full(item)) | Err(TrySendError::Disconnected(item)) => Err(item.value),
        }
    }

    /// Take the head of the queue, waiting as long as it takes.
    pub async fn dequeue(&self) -> Queued<T> {
        loop {
            let notified = self.available.notified();
            match self.receiver.try_recv() {
                Ok(item) if self.is_current(item.epoch) => return item,
                Ok(item) => {
                    debug!("dropping item queued under stale epoch {}", item.epoch);
                }
                Err(_) => notified.await,
            }
        }
    }

    /// Discard everything queued and start a new epoch. Returns how many
    /// items were discarded.
    pub fn drain(&self) -> usize {
        let mut discarded = 0;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        // only items tagged with the new epoch can survive from here on
        self.epoch.fetch_add(1, Ordering::AcqRel);
        discarded
    }
}
