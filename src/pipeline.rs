// pipeline.rs

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, PipelineConfig};
use crate::processor::{Classification, StimulusProcessor};
use crate::scheduler::{delay, spawn_task, BoundedQueue, TaskPriority, TaskSpec};
use crate::transport::{LinkEvent, LinkEventReceiver, Transport};

/// Width of one stimulus record and of one emitted divisor
pub const RECORD_LEN: usize = 4;
pub const ACK_ACCEPTED: u8 = 1;
pub const ACK_REJECTED: u8 = 0;

/// Most bytes one ingest iteration takes off the line, record included
const INGEST_CHUNK: usize = 64;

pub const INGEST_TASK: TaskSpec = TaskSpec::new("ingest", TaskPriority::High);
pub const COMPUTE_TASK: TaskSpec = TaskSpec::new("compute", TaskPriority::Normal);
pub const RESET_TASK: TaskSpec = TaskSpec::new("link_reset", TaskPriority::Normal);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Running composite/prime counts owned by the compute task
#[derive(Debug, Default)]
pub struct PipelineCounters {
    composite: AtomicU64,
    prime: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub composite: u64,
    pub prime: u64,
}

impl CounterSnapshot {
    pub fn total(&self) -> u64 {
        self.composite + self.prime
    }
}

impl PipelineCounters {
    fn record(&self, classification: Classification) {
        match classification {
            Classification::Composite { .. } => self.composite.fetch_add(1, Ordering::Relaxed),
            Classification::Prime => self.prime.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn reset(&self) {
        self.composite.store(0, Ordering::Relaxed);
        self.prime.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            composite: self.composite.load(Ordering::Relaxed),
            prime: self.prime.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the ingest task, the compute task and the reset path.
pub struct PipelineContext {
    queue: BoundedQueue<u32>,
    counters: PipelineCounters,
    // orders counter updates against resets
    reset_lock: Mutex<()>,
}

impl PipelineContext {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue: BoundedQueue::new(queue_capacity),
            counters: PipelineCounters::default(),
            reset_lock: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &BoundedQueue<u32> {
        &self.queue
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Zero the counters and discard every queued value.
    ///
    /// Values already taken by the compute task belong to the old epoch and
    /// are neither counted nor emitted. Returns how many queued values were
    /// discarded.
    pub fn reset(&self) -> usize {
        let _guard = self.reset_lock.lock();
        let discarded = self.queue.drain();
        self.counters.reset();
        discarded
    }

    /// Queue `value` unless a reset happened since `epoch`.
    ///
    /// `None` means the value belongs to a peer that is already gone;
    /// `Some(Err(value))` means the queue is full.
    fn admit(&self, epoch: u64, value: u32) -> Option<Result<(), u32>> {
        let _guard = self.reset_lock.lock();
        if !self.queue.is_current(epoch) {
            return None;
        }
        Some(self.queue.try_enqueue(value).map(|_| ()))
    }

    /// Count an outcome unless a reset happened since `epoch`.
    fn record(&self, epoch: u64, classification: Classification) -> bool {
        let _guard = self.reset_lock.lock();
        if !self.queue.is_current(epoch) {
            return false;
        }
        self.counters.record(classification);
        true
    }
}

/// Ingest -> bounded queue -> compute, plus the reset handler listening for
/// link events.
pub struct Pipeline<I: Transport, O: Transport, P: StimulusProcessor> {
    ingest_line: Arc<I>,
    output_line: Arc<O>,
    processor: Arc<P>,
    context: Arc<PipelineContext>,
    config: PipelineConfig,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<I, O, P> Pipeline<I, O, P>
where
    I: Transport + 'static,
    O: Transport + 'static,
    P: StimulusProcessor + 'static,
{
    pub fn new(
        ingest_line: I,
        output_line: O,
        processor: P,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            ingest_line: Arc::new(ingest_line),
            output_line: Arc::new(output_line),
            processor: Arc::new(processor),
            context: Arc::new(PipelineContext::new(config.queue_capacity)),
            config,
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> Arc<PipelineContext> {
        self.context.clone()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.context.counters()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the ingest, compute and reset tasks, highest priority first.
    pub fn start(&self, link_events: LinkEventReceiver) -> Result<(), PipelineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }

        let handles = vec![
            self.spawn_ingest_task(),
            self.spawn_compute_task(),
            self.spawn_reset_task(link_events),
        ];
        self.handles.lock().extend(handles);
        info!(
            "pipeline started (queue capacity {})",
            self.context.queue().capacity()
        );
        Ok(())
    }

    /// Abort all pipeline tasks.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        info!("pipeline stopped");
    }

    fn spawn_ingest_task(&self) -> JoinHandle<()> {
        let line = self.ingest_line.clone();
        let context = self.context.clone();
        let interval = self.config.ingest_interval;
        let retry = self.config.write_retry_interval;

        spawn_task(INGEST_TASK, async move {
            let mut record = [0u8; RECORD_LEN];
            let mut scratch = [0u8; INGEST_CHUNK];
            loop {
                ingest_once(&*line, &context, &mut record, &mut scratch, retry).await;
                delay(interval).await;
            }
        })
    }

    fn spawn_compute_task(&self) -> JoinHandle<()> {
        let line = self.output_line.clone();
        let processor = self.processor.clone();
        let context = self.context.clone();
        let retry = self.config.write_retry_interval;

        spawn_task(COMPUTE_TASK, async move {
            loop {
                compute_once(&*line, &*processor, &context, retry).await;
            }
        })
    }

    fn spawn_reset_task(&self, mut link_events: LinkEventReceiver) -> JoinHandle<()> {
        let context = self.context.clone();

        spawn_task(RESET_TASK, async move {
            while let Some(event) = link_events.recv().await {
                match event {
                    LinkEvent::Connected { line } => info!("{}: peer connected", line),
                    LinkEvent::Disconnected { line } => {
                        let discarded = context.reset();
                        info!(
                            "{}: peer disconnected, counters reset, {} queued value(s) discarded",
                            line, discarded
                        );
                    }
                }
            }
            debug!("link event channel closed");
        })
    }
}

impl<I: Transport, O: Transport, P: StimulusProcessor> Drop for Pipeline<I, O, P> {
    fn drop(&mut self) {
        for handle in self.handles.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// What one ingest iteration did with its record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted(u32),
    Rejected(u32),
}

/// Read, validate, enqueue and acknowledge one record.
///
/// At most 64 bytes are taken off the line: the record and
/// whatever surplus followed it in the same chunk, which is discarded. Returns
/// `None` when the peer had nothing to say or went away before the record
/// could be queued.
pub async fn ingest_once<T: Transport + ?Sized>(
    line: &T,
    context: &PipelineContext,
    record: &mut [u8; RECORD_LEN],
    scratch: &mut [u8],
    retry: Duration,
) -> Option<IngestOutcome> {
    let epoch = context.queue().epoch();

    record.fill(0);
    if line.receive(record).await == 0 {
        return None;
    }
    if !line.is_connected() {
        debug!("ingest line dropped during read");
        return None;
    }

    let budget = scratch.len().min(INGEST_CHUNK - RECORD_LEN);
    let surplus = line.receive(&mut scratch[..budget]).await;
    if !line.is_connected() || !context.queue().is_current(epoch) {
        debug!("ingest peer went away before its record was queued");
        return None;
    }
    if surplus > 0 {
        debug!("discarded {} surplus ingest byte(s)", surplus);
    }

    let value = u32::from_le_bytes(*record);
    info!("input number: {}", value);

    let (outcome, ack) = match context.admit(epoch, value) {
        Some(Ok(())) => (IngestOutcome::Accepted(value), ACK_ACCEPTED),
        Some(Err(value)) => {
            warn!("queue full, rejecting {}", value);
            (IngestOutcome::Rejected(value), ACK_REJECTED)
        }
        None => {
            debug!("dropping {} queued across a reset", value);
            return None;
        }
    };

    write_fully(line, &[ack], context, epoch, retry).await;
    Some(outcome)
}

/// Dequeue one value, classify it, emit composites and count the outcome.
///
/// Returns `None` if a reset overtook the value before it could be reported.
pub async fn compute_once<T, P>(
    line: &T,
    processor: &P,
    context: &PipelineContext,
    retry: Duration,
) -> Option<Classification>
where
    T: Transport + ?Sized,
    P: StimulusProcessor + ?Sized,
{
    let item = context.queue().dequeue().await;
    let classification = processor.process(item.value).await;

    if let Classification::Composite { divisor } = classification {
        if !write_fully(line, &divisor.to_le_bytes(), context, item.epoch, retry).await {
            debug!("dropping divisor {} of {} after reset", divisor, item.value);
            return None;
        }
    }

    if !context.record(item.epoch, classification) {
        debug!("dropping result for {} after reset", item.value);
        return None;
    }

    let counters = context.counters();
    info!(
        "composite: {}, prime: {}, total: {}",
        counters.composite,
        counters.prime,
        counters.total()
    );
    Some(classification)
}

/// Keep sending until every byte is out, yielding between attempts.
///
/// Gives up only when a reset starts a new epoch: the peer the bytes were
/// meant for is gone.
async fn write_fully<T: Transport + ?Sized>(
    line: &T,
    bytes: &[u8],
    context: &PipelineContext,
    epoch: u64,
    retry: Duration,
) -> bool {
    let mut written = 0;
    while written < bytes.len() {
        if !context.queue().is_current(epoch) {
            return false;
        }
        written += line.send(&bytes[written..]).await;
        if written < bytes.len() {
            delay(retry).await;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{DelayedProcessor, SmallestDivisorProcessor};
    use crate::transport::link_channel;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::time::sleep;

    // Mock transport for testing
    #[derive(Clone)]
    struct MockTransport {
        sent_data: Arc<AsyncMutex<Vec<u8>>>,
        receive_data: Arc<AsyncMutex<VecDeque<u8>>>,
        connected: Arc<AtomicBool>,
        // at most this many bytes per send
        send_limit: usize,
    }

    impl MockTransport {
        fn new() -> Self {
            Self::with_send_limit(usize::MAX)
        }

        fn with_send_limit(send_limit: usize) -> Self {
            Self {
                sent_data: Arc::new(AsyncMutex::new(Vec::new())),
                receive_data: Arc::new(AsyncMutex::new(VecDeque::new())),
                connected: Arc::new(AtomicBool::new(true)),
                send_limit,
            }
        }

        async fn add_input_data(&self, data: &[u8]) {
            self.receive_data.lock().await.extend(data);
        }

        async fn get_sent_data(&self) -> Vec<u8> {
            self.sent_data.lock().await.clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, data: &[u8]) -> usize {
            if !self.is_connected() {
                return 0;
            }
            let n = data.len().min(self.send_limit);
            self.sent_data.lock().await.extend_from_slice(&data[..n]);
            n
        }

        async fn receive(&self, buffer: &mut [u8]) -> usize {
            if !self.is_connected() {
                return 0;
            }
            let mut queue = self.receive_data.lock().await;
            let to_read = buffer.len().min(queue.len());
            for slot in buffer.iter_mut().take(to_read) {
                *slot = queue.pop_front().unwrap();
            }
            to_read
        }

        async fn peek(&self, buffer: &mut [u8]) -> usize {
            if !self.is_connected() {
                return buffer.len();
            }
            buffer.len().min(self.receive_data.lock().await.len())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn test_config(queue_capacity: usize) -> PipelineConfig {
        PipelineConfig {
            queue_capacity,
            ingest_interval: Duration::from_millis(1),
            write_retry_interval: Duration::from_millis(1),
            ..PipelineConfig::default()
        }
    }

    /// Submit one record and wait for its acknowledgment byte.
    async fn submit(line: &MockTransport, value: u32) -> u8 {
        let before = line.get_sent_data().await.len();
        line.add_input_data(&value.to_le_bytes()).await;
        for _ in 0..500 {
            let sent = line.get_sent_data().await;
            if sent.len() > before {
                return sent[before];
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("no acknowledgment for {}", value);
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(2)).await;
        }
        false
    }

    #[test]
    fn test_counter_snapshot_total() {
        let counters = PipelineCounters::default();
        counters.record(Classification::Prime);
        counters.record(Classification::Composite { divisor: 3 });
        counters.record(Classification::Composite { divisor: 2 });
        let snapshot = counters.snapshot();
        assert_eq!(snapshot, CounterSnapshot { composite: 2, prime: 1 });
        assert_eq!(snapshot.total(), 3);
    }

    #[tokio::test]
    async fn test_idle_line_is_a_no_op() {
        let line = MockTransport::new();
        let context = PipelineContext::new(4);
        let mut record = [0u8; RECORD_LEN];
        let mut scratch = [0u8; INGEST_CHUNK];

        let outcome = ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;
        assert_eq!(outcome, None);
        assert!(context.queue().is_empty());
        assert!(line.get_sent_data().await.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_discards_surplus_in_same_chunk() {
        let line = MockTransport::new();
        let context = PipelineContext::new(4);
        let mut record = [0u8; RECORD_LEN];
        let mut scratch = [0u8; INGEST_CHUNK];

        let mut input = 21u32.to_le_bytes().to_vec();
        input.extend(std::iter::repeat(0xAA).take(40));
        line.add_input_data(&input).await;

        let outcome = ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;
        assert_eq!(outcome, Some(IngestOutcome::Accepted(21)));
        assert!(line.receive_data.lock().await.is_empty());
        assert_eq!(context.queue().len(), 1);
        assert_eq!(line.get_sent_data().await, vec![ACK_ACCEPTED]);
    }

    #[tokio::test]
    async fn test_flood_is_consumed_one_chunk_per_iteration() {
        let line = MockTransport::new();
        let context = PipelineContext::new(4);
        let mut record = [0u8; RECORD_LEN];
        let mut scratch = [0u8; INGEST_CHUNK];

        let flood: Vec<u8> = (0..100u32).flat_map(|n| n.to_le_bytes()).collect();
        line.add_input_data(&flood).await;

        let outcome = ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;
        assert_eq!(outcome, Some(IngestOutcome::Accepted(0)));
        assert_eq!(line.receive_data.lock().await.len(), flood.len() - INGEST_CHUNK);

        // Chunks stay record-aligned, so the next iteration starts at record 16
        let outcome = ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;
        assert_eq!(outcome, Some(IngestOutcome::Accepted(16)));
        assert_eq!(line.get_sent_data().await, vec![ACK_ACCEPTED, ACK_ACCEPTED]);
    }

    #[tokio::test]
    async fn test_short_record_is_zero_extended() {
        let line = MockTransport::new();
        let context = PipelineContext::new(4);
        let mut record = [0xFFu8; RECORD_LEN];
        let mut scratch = [0u8; INGEST_CHUNK];

        line.add_input_data(&[0x2A, 0x01]).await;
        let outcome = ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;
        assert_eq!(outcome, Some(IngestOutcome::Accepted(0x012A)));
    }

    #[tokio::test]
    async fn test_ingest_rejects_when_queue_full() {
        let line = MockTransport::new();
        let context = PipelineContext::new(1);
        let mut record = [0u8; RECORD_LEN];
        let mut scratch = [0u8; INGEST_CHUNK];

        line.add_input_data(&4u32.to_le_bytes()).await;
        ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;
        line.add_input_data(&9u32.to_le_bytes()).await;
        let outcome = ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;

        assert_eq!(outcome, Some(IngestOutcome::Rejected(9)));
        assert_eq!(line.get_sent_data().await, vec![ACK_ACCEPTED, ACK_REJECTED]);
        assert_eq!(context.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_divisor_write_survives_short_sends() {
        let line = MockTransport::with_send_limit(1);
        let context = PipelineContext::new(4);
        context.queue().try_enqueue(1_000_001).unwrap();

        let outcome = compute_once(&line, &SmallestDivisorProcessor, &context, Duration::ZERO).await;
        assert_eq!(outcome, Some(Classification::Composite { divisor: 101 }));
        assert_eq!(line.get_sent_data().await, 101u32.to_le_bytes().to_vec());
        assert_eq!(context.counters(), CounterSnapshot { composite: 1, prime: 0 });
    }

    // Hands out one record, then the peer closes while the surplus is being
    // read and the reset handler runs before ingest gets to the queue
    struct VanishingPeer {
        inner: MockTransport,
        context: Arc<PipelineContext>,
        reads: AtomicU64,
    }

    #[async_trait]
    impl Transport for VanishingPeer {
        async fn send(&self, data: &[u8]) -> usize {
            self.inner.send(data).await
        }

        async fn receive(&self, buffer: &mut [u8]) -> usize {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 1 {
                self.inner.connected.store(false, Ordering::SeqCst);
                self.context.reset();
                return buffer.len();
            }
            self.inner.receive(buffer).await
        }

        async fn peek(&self, buffer: &mut [u8]) -> usize {
            self.inner.peek(buffer).await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
    }

    #[tokio::test]
    async fn test_record_from_departed_peer_is_not_queued() {
        let context = Arc::new(PipelineContext::new(4));
        let line = VanishingPeer {
            inner: MockTransport::new(),
            context: context.clone(),
            reads: AtomicU64::new(0),
        };
        line.inner.add_input_data(&21u32.to_le_bytes()).await;
        let mut record = [0u8; RECORD_LEN];
        let mut scratch = [0u8; INGEST_CHUNK];

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            ingest_once(&line, &context, &mut record, &mut scratch, Duration::from_millis(1)),
        )
        .await
        .expect("ingest never finished");
        assert_eq!(outcome, None);
        assert!(context.queue().is_empty());

        // A new peer must not inherit an acknowledgment
        line.inner.connected.store(true, Ordering::SeqCst);
        let outcome = ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;
        assert_eq!(outcome, None);
        assert!(line.inner.get_sent_data().await.is_empty());
        assert_eq!(context.counters(), CounterSnapshot::default());
    }

    #[tokio::test]
    async fn test_admit_refuses_stale_epoch() {
        let line = MockTransport::new();
        let context = PipelineContext::new(4);
        let mut record = [0u8; RECORD_LEN];
        let mut scratch = [0u8; INGEST_CHUNK];
        line.add_input_data(&9u32.to_le_bytes()).await;

        // A value admitted under an epoch that has since moved is refused
        let epoch = context.queue().epoch();
        context.reset();
        assert_eq!(context.admit(epoch, 9), None);
        assert!(context.queue().is_empty());

        let outcome = ingest_once(&line, &context, &mut record, &mut scratch, Duration::ZERO).await;
        assert_eq!(outcome, Some(IngestOutcome::Accepted(9)));
    }

    #[tokio::test]
    async fn test_reset_abandons_pending_divisor() {
        let line = MockTransport::new();
        line.connected.store(false, Ordering::SeqCst);
        let context = Arc::new(PipelineContext::new(4));
        context.queue().try_enqueue(21).unwrap();

        let resetter = context.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            resetter.reset();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            compute_once(&line, &SmallestDivisorProcessor, &context, Duration::from_millis(1)),
        )
        .await
        .expect("divisor write never gave up");
        assert_eq!(outcome, None);
        assert_eq!(context.counters(), CounterSnapshot::default());
    }

    #[tokio::test]
    async fn test_prime_round_trip() {
        let ingest = MockTransport::new();
        let output = MockTransport::new();
        let (_events_tx, events_rx) = link_channel();

        let pipeline = Pipeline::new(
            ingest.clone(),
            output.clone(),
            SmallestDivisorProcessor,
            test_config(10),
        )
        .unwrap();
        pipeline.start(events_rx).unwrap();

        assert_eq!(submit(&ingest, 17).await, ACK_ACCEPTED);
        assert!(wait_for(|| pipeline.counters().prime == 1).await);
        sleep(Duration::from_millis(20)).await;

        assert!(output.get_sent_data().await.is_empty());
        assert_eq!(pipeline.counters(), CounterSnapshot { composite: 0, prime: 1 });
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_composite_round_trip() {
        let ingest = MockTransport::new();
        let output = MockTransport::new();
        let (_events_tx, events_rx) = link_channel();

        let pipeline = Pipeline::new(
            ingest.clone(),
            output.clone(),
            SmallestDivisorProcessor,
            test_config(10),
        )
        .unwrap();
        pipeline.start(events_rx).unwrap();

        assert_eq!(submit(&ingest, 21).await, ACK_ACCEPTED);
        assert!(wait_for(|| pipeline.counters().composite == 1).await);

        assert_eq!(output.get_sent_data().await, vec![3, 0, 0, 0]);
        assert_eq!(pipeline.counters(), CounterSnapshot { composite: 1, prime: 0 });
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_backpressure_rejects_overflow() {
        let ingest = MockTransport::new();
        let output = MockTransport::new();
        let (_events_tx, events_rx) = link_channel();
        let slow = DelayedProcessor::new(SmallestDivisorProcessor, Duration::from_secs(30));

        let pipeline = Pipeline::new(ingest.clone(), output.clone(), slow, test_config(2)).unwrap();
        pipeline.start(events_rx).unwrap();
        let context = pipeline.context();

        // The first value is taken straight off the queue and stalls compute
        assert_eq!(submit(&ingest, 21).await, ACK_ACCEPTED);
        assert!(wait_for(|| context.queue().is_empty()).await);

        assert_eq!(submit(&ingest, 25).await, ACK_ACCEPTED);
        assert_eq!(submit(&ingest, 27).await, ACK_ACCEPTED);
        assert_eq!(submit(&ingest, 49).await, ACK_REJECTED);

        assert_eq!(context.queue().len(), 2);
        assert!(output.get_sent_data().await.is_empty());
        assert_eq!(pipeline.counters(), CounterSnapshot::default());
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_disconnect_resets_counters_and_queue() {
        let ingest = MockTransport::new();
        let output = MockTransport::new();
        let (events_tx, events_rx) = link_channel();
        let slow = DelayedProcessor::new(SmallestDivisorProcessor, Duration::from_millis(200));

        let pipeline = Pipeline::new(ingest.clone(), output.clone(), slow, test_config(10)).unwrap();
        pipeline.start(events_rx).unwrap();
        let context = pipeline.context();

        assert_eq!(submit(&ingest, 9).await, ACK_ACCEPTED);
        assert!(wait_for(|| pipeline.counters().composite == 1).await);
        assert_eq!(output.get_sent_data().await, vec![3, 0, 0, 0]);

        // 21 goes into the computation, 25 and 49 wait in the queue
        assert_eq!(submit(&ingest, 21).await, ACK_ACCEPTED);
        assert!(wait_for(|| context.queue().is_empty()).await);
        assert_eq!(submit(&ingest, 25).await, ACK_ACCEPTED);
        assert_eq!(submit(&ingest, 49).await, ACK_ACCEPTED);

        events_tx
            .send(LinkEvent::Disconnected { line: "U2".into() })
            .unwrap();
        assert!(wait_for(|| pipeline.counters() == CounterSnapshot::default()).await);
        assert!(context.queue().is_empty());

        // Nothing queued or in flight before the reset ever reaches the output
        sleep(Duration::from_millis(500)).await;
        assert_eq!(output.get_sent_data().await, vec![3, 0, 0, 0]);
        assert_eq!(pipeline.counters(), CounterSnapshot::default());

        assert_eq!(submit(&ingest, 35).await, ACK_ACCEPTED);
        assert!(wait_for(|| pipeline.counters().composite == 1).await);
        assert_eq!(output.get_sent_data().await, vec![3, 0, 0, 0, 5, 0, 0, 0]);
        pipeline.stop();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (_events_tx, events_rx) = link_channel();
        let (_other_tx, other_rx) = link_channel();
        let pipeline = Pipeline::new(
            MockTransport::new(),
            MockTransport::new(),
            SmallestDivisorProcessor,
            test_config(4),
        )
        .unwrap();

        pipeline.start(events_rx).unwrap();
        assert!(matches!(pipeline.start(other_rx), Err(PipelineError::AlreadyRunning)));
        assert!(pipeline.is_running());
        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Pipeline::new(
            MockTransport::new(),
            MockTransport::new(),
            SmallestDivisorProcessor,
            test_config(0),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
