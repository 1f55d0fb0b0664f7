// ring_buffer.rs

//! Flow-control notifications for a byte-stream driver's read and write rings.
//!
//! The driver side pushes received bytes and drains transmitted ones; the owner
//! side reads, writes and configures thresholds. Each direction has its own
//! notifier running a small state machine:
//!
//! ```text
//! Idle --enable--> Armed --condition--> Fired --condition clears--> Armed   (persistent)
//!                  Armed --condition--> Idle                                (one-shot)
//! ```
//!
//! Mutating driver calls return a [`Dispatch`] instead of invoking callbacks
//! directly. The ring is fully updated by the time the caller gets it, and
//! callbacks only run when the caller fires it, typically after releasing
//! whatever lock guards the ring.

use std::fmt;
use std::sync::Arc;

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingEvent {
    /// At least the read threshold of unread bytes is buffered
    ReadThresholdReached,
    /// The read ring is full; anything else arriving is lost until it is drained
    ReadBufferFull,
    /// A line error was latched; fetch and clear it with [`RingBuffer::error_get`]
    ReadError,
    /// At least the write threshold of free space is available
    WriteThresholdReached,
}

/// Callback invoked with the event and the context registered alongside it
pub type RingCallback = Arc<dyn Fn(RingEvent, usize) + Send + Sync>;

/// Latched receive errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineErrors {
    pub overrun: bool,
    pub parity: bool,
    pub framing: bool,
}

impl LineErrors {
    pub const NONE: LineErrors = LineErrors {
        overrun: false,
        parity: false,
        framing: false,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }

    fn merge(&mut self, other: LineErrors) {
        self.overrun |= other.overrun;
        self.parity |= other.parity;
        self.framing |= other.framing;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Line settings record. Nothing here is negotiated; it is stored for the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSetup {
    pub baud_rate: u32,
    pub parity: Parity,
}

impl Default for SerialSetup {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            parity: Parity::None,
        }
    }
}

/// State of one direction's notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    /// Disabled, either never enabled or a one-shot that already fired
    Idle,
    /// Will fire the next time the condition holds
    Armed,
    /// Persistent notifier that fired and waits for the condition to clear
    Fired,
}

struct Notifier {
    callback: Option<RingCallback>,
    context: usize,
    state: NotifyState,
    threshold: usize,
    persistent: bool,
}

impl Notifier {
    fn new() -> Self {
        Self {
            callback: None,
            context: 0,
            state: NotifyState::Idle,
            threshold: 0,
            persistent: false,
        }
    }

    fn enable(&mut self, enable: bool, persistent: bool) -> bool {
        let was_enabled = self.state != NotifyState::Idle;
        self.persistent = persistent;
        self.state = if enable {
            NotifyState::Armed
        } else {
            NotifyState::Idle
        };
        was_enabled
    }

    fn qualifies(&self, level: usize) -> bool {
        self.threshold > 0 && level >= self.threshold
    }

    /// Armed -> Fired/Idle when `level` meets the threshold
    fn trigger(&mut self, level: usize) -> bool {
        if self.state != NotifyState::Armed || !self.qualifies(level) {
            return false;
        }
        self.state = if self.persistent {
            NotifyState::Fired
        } else {
            NotifyState::Idle
        };
        true
    }

    /// Fired -> Armed once `level` drops below the threshold
    fn settle(&mut self, level: usize) {
        if self.state == NotifyState::Fired && !self.qualifies(level) {
            self.state = NotifyState::Armed;
        }
    }
}

/// Notifications produced by a ring mutation, waiting to be delivered.
#[must_use = "notifications are only delivered by `Dispatch::fire`"]
#[derive(Default)]
pub struct Dispatch {
    pending: Vec<(RingCallback, RingEvent, usize)>,
}

impl Dispatch {
    fn add(&mut self, notifier: &Notifier, event: RingEvent) {
        if let Some(callback) = &notifier.callback {
            self.pending
                .push((Arc::clone(callback), event, notifier.context));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn events(&self) -> Vec<RingEvent> {
        self.pending.iter().map(|(_, event, _)| *event).collect()
    }

    /// Run the callbacks in the order the events were raised.
    pub fn fire(self) {
        for (callback, event, context) in self.pending {
            callback(event, context);
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("events", &self.events())
            .finish()
    }
}

struct Ring {
    // one slot stays empty so that full and empty are distinguishable
    data: Vec<u8>,
    in_index: usize,
    out_index: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity + 1],
            in_index: 0,
            out_index: 0,
        }
    }

    fn slots(&self) -> usize {
        self.data.len()
    }

    fn capacity(&self) -> usize {
        self.slots() - 1
    }

    fn count(&self) -> usize {
        (self.in_index + self.slots() - self.out_index) % self.slots()
    }

    fn free(&self) -> usize {
        self.capacity() - self.count()
    }

    fn push(&mut self, bytes: &[u8]) -> usize {
        let accepted = bytes.len().min(self.free());
        for &byte in &bytes[..accepted] {
            self.data[self.in_index] = byte;
            self.in_index = (self.in_index + 1) % self.slots();
        }
        accepted
    }

    fn peek_into(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.count());
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = self.data[(self.out_index + i) % self.slots()];
        }
        n
    }

    fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.count());
        self.out_index = (self.out_index + n) % self.slots();
        n
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek_into(out);
        self.advance(n)
    }
}

/// Read and write rings of one serial driver instance plus their notifiers.
pub struct RingBuffer {
    rx: Ring,
    tx: Ring,
    read_notifier: Notifier,
    write_notifier: Notifier,
    errors: LineErrors,
    setup: SerialSetup,
}

impl RingBuffer {
    pub fn new(read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            rx: Ring::new(read_capacity),
            tx: Ring::new(write_capacity),
            read_notifier: Notifier::new(),
            write_notifier: Notifier::new(),
            errors: LineErrors::NONE,
            setup: SerialSetup::default(),
        }
    }

    pub fn register_read_callback(&mut self, callback: Option<RingCallback>, context: usize) {
        self.read_notifier.callback = callback;
        self.read_notifier.context = context;
    }

    pub fn register_write_callback(&mut self, callback: Option<RingCallback>, context: usize) {
        self.write_notifier.callback = callback;
        self.write_notifier.context = context;
    }

    /// Arm or disarm read-threshold notifications. Returns whether they were enabled before.
    pub fn read_notification_enable(&mut self, enable: bool, persistent: bool) -> bool {
        self.read_notifier.enable(enable, persistent)
    }

    /// Arm or disarm write-threshold notifications. Returns whether they were enabled before.
    pub fn write_notification_enable(&mut self, enable: bool, persistent: bool) -> bool {
        self.write_notifier.enable(enable, persistent)
    }

    /// Threshold of unread bytes; must fit in the ring. Zero never fires.
    pub fn read_threshold_set(&mut self, threshold: usize) -> bool {
        if threshold > self.rx.capacity() {
            return false;
        }
        self.read_notifier.threshold = threshold;
        true
    }

    /// Threshold of free space; must fit in the ring. Zero never fires.
    pub fn write_threshold_set(&mut self, threshold: usize) -> bool {
        if threshold > self.tx.capacity() {
            return false;
        }
        self.write_notifier.threshold = threshold;
        true
    }

    pub fn read_notification_state(&self) -> NotifyState {
        self.read_notifier.state
    }

    pub fn write_notification_state(&self) -> NotifyState {
        self.write_notifier.state
    }

    pub fn read_count(&self) -> usize {
        self.rx.count()
    }

    pub fn read_free_count(&self) -> usize {
        self.rx.free()
    }

    pub fn read_buffer_size(&self) -> usize {
        self.rx.capacity()
    }

    pub fn write_count(&self) -> usize {
        self.tx.count()
    }

    pub fn write_free_count(&self) -> usize {
        self.tx.free()
    }

    pub fn write_buffer_size(&self) -> usize {
        self.tx.capacity()
    }

    /// Owner: take up to `out.len()` received bytes.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.rx.pop(out);
        self.read_notifier.settle(self.rx.count());
        n
    }

    /// Owner: queue bytes for transmission. Returns how many fit.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = self.tx.push(data);
        self.write_notifier.settle(self.tx.free());
        n
    }

    /// Fetch and clear the latched line errors.
    pub fn error_get(&mut self) -> LineErrors {
        std::mem::take(&mut self.errors)
    }

    pub fn serial_setup(&mut self, setup: SerialSetup) -> bool {
        if setup.baud_rate == 0 {
            return false;
        }
        self.setup = setup;
        true
    }

    pub fn setup(&self) -> SerialSetup {
        self.setup
    }

    /// Driver: store bytes that arrived on the line.
    ///
    /// Bytes beyond the free space are dropped. Returns how many were stored
    /// together with the notifications to deliver.
    pub fn push_received(&mut self, bytes: &[u8]) -> (usize, Dispatch) {
        let mut dispatch = Dispatch::default();
        let accepted = self.rx.push(bytes);

        if accepted > 0 && self.read_notifier.trigger(self.rx.count()) {
            dispatch.add(&self.read_notifier, RingEvent::ReadThresholdReached);
        }
        let dropped = accepted < bytes.len();
        if dropped || (accepted > 0 && self.rx.free() == 0) {
            dispatch.add(&self.read_notifier, RingEvent::ReadBufferFull);
        }
        (accepted, dispatch)
    }

    /// Driver: copy the next bytes waiting to go out, without removing them.
    pub fn pending_transmit(&self, out: &mut [u8]) -> usize {
        self.tx.peek_into(out)
    }

    /// Driver: `n` bytes went out on the line.
    pub fn consume_transmit(&mut self, n: usize) -> Dispatch {
        let mut dispatch = Dispatch::default();
        if self.tx.advance(n) > 0 && self.write_notifier.trigger(self.tx.free()) {
            dispatch.add(&self.write_notifier, RingEvent::WriteThresholdReached);
        }
        dispatch
    }

    /// Driver: latch line errors and tell the owner.
    pub fn report_error(&mut self, errors: LineErrors) -> Dispatch {
        let mut dispatch = Dispatch::default();
        if !errors.is_empty() {
            self.errors.merge(errors);
            dispatch.add(&self.read_notifier, RingEvent::ReadError);
        }
        dispatch
    }
}
