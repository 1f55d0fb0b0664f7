// processor.rs

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

/// Outcome of the divisor search for one stimulus value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No divisor in `[2, floor(sqrt(n))]`; also covers 0 and 1.
    Prime,
    /// `divisor` is the smallest proper divisor.
    Composite { divisor: u32 },
}

impl Classification {
    /// The divisor, or 0 for a prime.
    pub fn divisor(&self) -> u32 {
        match self {
            Classification::Prime => 0,
            Classification::Composite { divisor } => *divisor,
        }
    }
}

/// Smallest divisor of `n` in `[2, floor(sqrt(n))]`, or 0 if there is none.
pub fn smallest_divisor(n: u32) -> u32 {
    if n < 2 {
        return 0;
    }
    let n = u64::from(n);
    let mut candidate: u64 = 2;
    while candidate * candidate <= n {
        if n % candidate == 0 {
            return candidate as u32;
        }
        candidate += 1;
    }
    0
}

/// Classify `n` by trial division.
pub fn classify(n: u32) -> Classification {
    match smallest_divisor(n) {
        0 => Classification::Prime,
        divisor => Classification::Composite { divisor },
    }
}

/// The bounded computation run by the compute task
#[async_trait]
pub trait StimulusProcessor: Send + Sync {
    async fn process(&self, value: u32) -> Classification;
}

/// Trial-division divisor search
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallestDivisorProcessor;

#[async_trait]
impl StimulusProcessor for SmallestDivisorProcessor {
    async fn process(&self, value: u32) -> Classification {
        classify(value)
    }
}

/// Wraps another processor and sleeps before every computation
pub struct DelayedProcessor<P> {
    inner: P,
    delay: Duration,
}

impl<P: StimulusProcessor> DelayedProcessor<P> {
    pub fn new(inner: P, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<P: StimulusProcessor> StimulusProcessor for DelayedProcessor<P> {
    async fn process(&self, value: u32) -> Classification {
        if self.delay > Duration::ZERO {
            sleep(self.delay).await;
        }
        self.inner.process(value).await
    }
}
