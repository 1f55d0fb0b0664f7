// poller.rs

use std::time::Duration;
use tokio::task::JoinHandle;

use crate::scheduler::{delay, spawn_task, TaskPriority, TaskSpec};
use crate::transport::{Transport, VirtualSerialTransport};

pub const POLLER_TASK: TaskSpec = TaskSpec::new("line_poller", TaskPriority::Low);

/// Accepts peers on idle lines and watches connected ones for a closed peer.
pub struct LinePoller {
    lines: Vec<VirtualSerialTransport>,
    interval: Duration,
}

impl LinePoller {
    pub fn new(lines: Vec<VirtualSerialTransport>, interval: Duration) -> Self {
        Self { lines, interval }
    }

    /// One pass over every line.
    ///
    /// A one-byte peek is enough to notice a closed peer; the line publishes
    /// the disconnect itself.
    pub async fn poll_once(&self) {
        let mut probe = [0u8; 1];
        for line in &self.lines {
            if line.is_connected() {
                line.peek(&mut probe).await;
            } else {
                line.try_accept();
            }
        }
    }

    pub async fn run(self) {
        loop {
            self.poll_once().await;
            delay(self.interval).await;
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        spawn_task(POLLER_TASK, self.run())
    }
}
