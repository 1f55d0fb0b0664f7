// uart.rs

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::ring_buffer::{RingBuffer, RingCallback};
use crate::transport::Transport;

/// Default number of bytes moved per direction in one service pass
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Bytes moved by one [`RingBufferedLine::service`] pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceReport {
    pub received: usize,
    pub transmitted: usize,
}

/// A serial line driven through read/write rings.
///
/// `service` plays the part of the interrupt handler: it moves bytes between
/// the line and the rings and delivers ring notifications. The owner only
/// touches the rings. Callbacks run with the ring unlocked, so a callback may
/// call back into the line (e.g. `read`) without deadlocking.
pub struct RingBufferedLine<T: Transport> {
    line: T,
    ring: Mutex<RingBuffer>,
    // held for a whole service pass so passes never interleave
    scratch: AsyncMutex<Vec<u8>>,
}

impl<T: Transport> RingBufferedLine<T> {
    pub fn new(line: T, read_capacity: usize, write_capacity: usize) -> Self {
        Self::with_chunk_size(line, read_capacity, write_capacity, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(
        line: T,
        read_capacity: usize,
        write_capacity: usize,
        chunk_size: usize,
    ) -> Self {
        Self {
            line,
            ring: Mutex::new(RingBuffer::new(read_capacity, write_capacity)),
            scratch: AsyncMutex::new(vec![0u8; chunk_size.max(1)]),
        }
    }

    pub fn line(&self) -> &T {
        &self.line
    }

    /// Configure the rings (thresholds, enables, setup) under the lock.
    pub fn configure<R>(&self, f: impl FnOnce(&mut RingBuffer) -> R) -> R {
        f(&mut self.ring.lock())
    }

    pub fn register_read_callback(&self, callback: RingCallback, context: usize) {
        self.ring.lock().register_read_callback(Some(callback), context);
    }

    pub fn register_write_callback(&self, callback: RingCallback, context: usize) {
        self.ring.lock().register_write_callback(Some(callback), context);
    }

    pub fn read(&self, out: &mut [u8]) -> usize {
        self.ring.lock().read(out)
    }

    pub fn write(&self, data: &[u8]) -> usize {
        self.ring.lock().write(data)
    }

    pub fn read_count(&self) -> usize {
        self.ring.lock().read_count()
    }

    pub fn write_count(&self) -> usize {
        self.ring.lock().write_count()
    }

    /// Move bytes between the line and the rings once.
    ///
    /// Only as many bytes are taken off the line as the read ring has room
    /// for; the rest stays in the socket. Only bytes the line accepted are
    /// removed from the write ring.
    pub async fn service(&self) -> ServiceReport {
        let mut scratch = self.scratch.lock().await;
        let mut report = ServiceReport::default();

        let room = self.ring.lock().read_free_count().min(scratch.len());
        if room > 0 {
            let read = self.line.receive(&mut scratch[..room]).await;
            // a full-length "read" from a line that just dropped carries no data
            if read > 0 && self.line.is_connected() {
                let (accepted, dispatch) = self.ring.lock().push_received(&scratch[..read]);
                dispatch.fire();
                report.received = accepted;
            }
        }

        let pending = self.ring.lock().pending_transmit(&mut scratch[..]);
        if pending > 0 {
            let sent = self.line.send(&scratch[..pending]).await;
            if sent > 0 {
                let dispatch = self.ring.lock().consume_transmit(sent);
                dispatch.fire();
            }
            report.transmitted = sent;
        }

        if report != ServiceReport::default() {
            debug!(
                "ring service: {} byte(s) in, {} byte(s) out",
                report.received, report.transmitted
            );
        }
        report
    }
}
