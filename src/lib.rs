//! Simulated UART device pipeline
//!
//! Two UART-like lines are emulated over TCP listeners. Numbers arriving on
//! the ingest line are acknowledged, queued and classified by a compute task,
//! which reports the smallest divisor of every composite on the output line.
//! A peer disconnecting on either line resets the pipeline state.

pub mod config;
pub mod pipeline;
pub mod poller;
pub mod processor;
pub mod ring_buffer;
pub mod scheduler;
pub mod transport;
pub mod uart;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{CounterSnapshot, Pipeline, PipelineContext, PipelineError};
pub use poller::LinePoller;
pub use processor::{Classification, DelayedProcessor, SmallestDivisorProcessor, StimulusProcessor};
pub use ring_buffer::{RingBuffer, RingCallback, RingEvent};
pub use transport::{
    link_channel, Error, LinkEvent, LinkEventReceiver, LinkEventSender, Transport,
    VirtualSerialTransport,
};
pub use uart::RingBufferedLine;
