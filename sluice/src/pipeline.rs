//! Pipeline lifecycle and the publish API.
//!
//! ```text
//! Created -> Running <-> Paused -> Draining -> Stopped
//! ```
//!
//! Producers hold a `Publisher` (cheap to clone, usable from any thread).
//! Publishes are accepted only while `Running`. `stop()` drains: it refuses
//! new publishes, lets everything already claimed finish both stages within
//! `shutdown_timeout`, joins the workers and force-resolves whatever is left.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::backpressure::{PublishError, PublishOutcome};
use crate::completion::{completion_pair, Completion, CompletionHandle};
use crate::config::{PipelineConfig, PublishMode};
use crate::disruptor::{Backoff, RingBuffer, Sequence, WaitStrategy, OUTPUT_STAGE};
use crate::error::{FailureReason, Result, SluiceError};
use crate::handler::{Filter, FilterStage, OutputStage, Sink};
use crate::insights::{MetricsSink, MetricsSnapshot, NoopMetrics, ProducerMetrics};
use crate::worker::{PoolContext, Stage, WorkerPool};

/// Poll interval while draining.
const DRAIN_POLL: Duration = Duration::from_millis(1);
/// Minimum time workers get to exit after the halt flag is raised.
const JOIN_GRACE: Duration = Duration::from_millis(50);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created = 0,
    Running = 1,
    Paused = 2,
    Draining = 3,
    Stopped = 4,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Created,
            1 => State::Running,
            2 => State::Paused,
            3 => State::Draining,
            _ => State::Stopped,
        }
    }
}

/// What `stop()` observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Messages that finished the output stage during the drain.
    pub drained: u64,
    /// Handles resolved with `ShutdownForced`.
    pub forced: u64,
    /// Worker threads that did not exit in time and were left running.
    pub detached_workers: usize,
}

/// State shared between the pipeline and its publishers.
struct Shared<I, O> {
    ring: OnceLock<Arc<RingBuffer<I, O>>>,
    state: AtomicU8,
    /// Publish calls currently between the state check and `publish(seq)`.
    active_publishers: AtomicUsize,
    /// Set by `stop()` right before it force-resolves the ring.
    swept: AtomicBool,
    capacity: u64,
    publish_mode: PublishMode,
    wait_strategy: WaitStrategy,
    producer_metrics: ProducerMetrics,
    metrics_sink: Arc<dyn MetricsSink>,
}

/// Keeps `active_publishers` raised for the duration of one publish attempt.
struct PublishGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<I, O> Shared<I, O> {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: State, to: State) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| SluiceError::InvalidState {
                expected: from,
                actual: State::from_u8(actual),
            })
    }

    /// Register a publish attempt. `None` when the pipeline is not accepting.
    ///
    /// The counter is raised before the state is read, and `stop()` writes the
    /// state before reading the counter, so either this call sees `Draining`
    /// or the drain waits for this call to finish.
    fn enter(&self) -> Option<(PublishGuard<'_>, &Arc<RingBuffer<I, O>>)> {
        self.active_publishers.fetch_add(1, Ordering::SeqCst);
        let guard = PublishGuard {
            active: &self.active_publishers,
        };
        if self.state() != State::Running {
            return None;
        }
        self.ring.get().map(|ring| (guard, ring))
    }

    fn try_publish(&self, message: I) -> PublishOutcome<I> {
        let Some((_guard, ring)) = self.enter() else {
            return PublishOutcome::ProcessingDisabled(message);
        };
        match ring.sequencer().try_claim() {
            // SAFETY: `sequence` was just claimed by this call.
            Some(sequence) => PublishOutcome::Accepted(unsafe {
                self.publish_claimed(ring, sequence, message)
            }),
            None => PublishOutcome::CapacityExceeded(message),
        }
    }

    /// Write and publish a claimed sequence. A publish that lands after the
    /// shutdown sweep resolves its own handle, since nothing else will.
    ///
    /// # Safety
    ///
    /// `sequence` must have been claimed from `ring` by the caller and not
    /// written yet.
    unsafe fn publish_claimed(
        &self,
        ring: &RingBuffer<I, O>,
        sequence: Sequence,
        message: I,
    ) -> CompletionHandle {
        let (handle, completer) = completion_pair(sequence);
        ring.write_and_publish(sequence, message, completer);
        // The completer is installed (SeqCst swap) before this load and
        // `stop()` raises `swept` before its sweep, so one of the two takes it.
        if self.swept.load(Ordering::SeqCst) {
            if let Some(completer) = ring.slot(sequence).completer().take() {
                trace_warn!(sequence, "publish landed after shutdown sweep");
                completer.resolve(Completion::Failure(FailureReason::ShutdownForced));
            }
        }
        handle
    }

    fn record(&self, outcome: &PublishOutcome<I>) {
        let event = outcome.event();
        self.producer_metrics.record(event);
        self.metrics_sink.publish(event);
    }

    fn remaining_capacity(&self) -> u64 {
        match self.ring.get() {
            Some(ring) => ring.sequencer().remaining_capacity(),
            None => self.capacity,
        }
    }
}

/// Producer entry point used by protocol adapters.
pub struct Publisher<I, O> {
    shared: Arc<Shared<I, O>>,
}

impl<I, O> Clone for Publisher<I, O> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<I, O> Publisher<I, O> {
    /// Never blocks. On rejection the message is handed back.
    pub fn try_publish(&self, message: I) -> PublishOutcome<I> {
        let outcome = self.shared.try_publish(message);
        self.shared.record(&outcome);
        outcome
    }

    /// Wait until there is room. Fails with `ProcessingDisabled` if the
    /// pipeline is not running, or stops running while this call waits.
    pub fn publish(&self, message: I) -> std::result::Result<CompletionHandle, PublishError<I>> {
        let mut backoff = Backoff::new(self.shared.wait_strategy);
        let mut message = message;
        loop {
            match self.shared.try_publish(message) {
                PublishOutcome::CapacityExceeded(returned) => {
                    message = returned;
                    if let Some(ring) = self.shared.ring.get() {
                        let sequencer = ring.sequencer();
                        backoff.wait(sequencer.capacity_signal(), || {
                            sequencer.remaining_capacity() > 0
                                || self.shared.state() != State::Running
                        });
                    }
                }
                outcome => {
                    self.shared.record(&outcome);
                    return outcome.into_result();
                }
            }
        }
    }

    /// Publish the way the pipeline's `publish_mode` says.
    pub fn submit(&self, message: I) -> PublishOutcome<I> {
        match self.shared.publish_mode {
            PublishMode::NonBlocking => self.try_publish(message),
            PublishMode::Blocking => match self.publish(message) {
                Ok(handle) => PublishOutcome::Accepted(handle),
                Err(rejected) => PublishOutcome::ProcessingDisabled(rejected.into_message()),
            },
        }
    }

    pub fn remaining_capacity(&self) -> u64 {
        self.shared.remaining_capacity()
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }
}

/// Two-stage (filter, output) processing pipeline over a shared ring.
pub struct Pipeline<I, O> {
    config: PipelineConfig,
    shared: Arc<Shared<I, O>>,
    filter: Arc<dyn Filter<I, O>>,
    sink: Arc<dyn Sink<O>>,
    halt: Arc<AtomicBool>,
    pools: Vec<WorkerPool>,
}

impl<I: Send + 'static, O: Send + 'static> Pipeline<I, O> {
    pub fn new<F, S>(config: PipelineConfig, filter: F, sink: S) -> Result<Self>
    where
        F: Filter<I, O> + 'static,
        S: Sink<O> + 'static,
    {
        Self::builder(config).filter(filter).sink(sink).build()
    }

    pub fn builder(config: PipelineConfig) -> PipelineBuilder<I, O> {
        PipelineBuilder {
            config,
            filter: None,
            sink: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Allocate the ring and start both worker pools.
    pub fn start(&mut self) -> Result<()> {
        let state = self.shared.state();
        if state != State::Created {
            return Err(SluiceError::InvalidState {
                expected: State::Created,
                actual: state,
            });
        }

        let filter_workers = self.config.filter_workers as usize;
        let output_workers = self.config.output_workers as usize;
        let ring = Arc::new(RingBuffer::new(
            self.config.capacity as usize,
            self.config.padded_slots,
            &[filter_workers, output_workers],
        )?);

        let ctx = PoolContext {
            halt: self.halt.clone(),
            wait_strategy: self.config.wait_strategy,
            metrics_sink: self.shared.metrics_sink.clone(),
            thread_name: self.config.thread_name.clone(),
            worker_cores: self.config.worker_cores.clone(),
        };

        if self.shared.ring.set(ring.clone()).is_err() {
            return Err(SluiceError::InvalidState {
                expected: State::Created,
                actual: self.shared.state(),
            });
        }

        let filter_stage = Arc::new(FilterStage::new(self.filter.clone()));
        let output_stage = Arc::new(OutputStage::new(self.sink.clone()));
        let spawned = WorkerPool::spawn(
            ring.clone(),
            Stage::Filter,
            filter_workers,
            filter_stage,
            &ctx,
            0,
        )
        .and_then(|pool| {
            self.pools.push(pool);
            WorkerPool::spawn(
                ring.clone(),
                Stage::Output,
                output_workers,
                output_stage,
                &ctx,
                filter_workers,
            )
        });
        match spawned {
            Ok(pool) => self.pools.push(pool),
            Err(e) => {
                for pool in &mut self.pools {
                    pool.join(None);
                }
                self.shared.set_state(State::Stopped);
                return Err(e);
            }
        }

        self.shared.transition(State::Created, State::Running)?;

        trace_info!(
            capacity = self.config.capacity,
            filter_workers,
            output_workers,
            padded_slots = self.config.padded_slots,
            wait_strategy = ?self.config.wait_strategy,
            "pipeline started"
        );
        Ok(())
    }
}

impl<I, O> Pipeline<I, O> {
    pub fn publisher(&self) -> Publisher<I, O> {
        Publisher {
            shared: self.shared.clone(),
        }
    }

    /// Stop accepting publishes. In-flight messages keep flowing.
    pub fn pause(&self) -> Result<()> {
        self.shared.transition(State::Running, State::Paused)?;
        self.wake_publishers();
        trace_info!("pipeline paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.shared.transition(State::Paused, State::Running)?;
        trace_info!("pipeline resumed");
        Ok(())
    }

    /// Drain and stop. Every handle issued by this pipeline is resolved when
    /// this returns, except ones whose producer is still mid-publish.
    pub fn stop(&mut self) -> Result<ShutdownReport> {
        let state = self.shared.state();
        match state {
            State::Running | State::Paused => {}
            State::Created => {
                self.shared.set_state(State::Stopped);
                return Ok(ShutdownReport::default());
            }
            State::Draining | State::Stopped => {
                return Err(SluiceError::InvalidState {
                    expected: State::Running,
                    actual: state,
                });
            }
        }

        self.shared.set_state(State::Draining);
        self.wake_publishers();
        trace_info!("pipeline draining");

        let Some(ring) = self.shared.ring.get().cloned() else {
            self.shared.set_state(State::Stopped);
            return Ok(ShutdownReport::default());
        };
        let sequencer = ring.sequencer();
        // `None`: the timeout is too large to represent, wait without bound.
        let deadline = Instant::now().checked_add(self.config.shutdown_timeout());
        let in_time = || deadline.map_or(true, |d| Instant::now() < d);
        let drain_start = sequencer.watermark(OUTPUT_STAGE);

        while self.shared.active_publishers.load(Ordering::SeqCst) > 0 && in_time() {
            thread::sleep(DRAIN_POLL);
        }
        while sequencer.watermark(OUTPUT_STAGE) < sequencer.claimed() && in_time() {
            thread::sleep(DRAIN_POLL);
        }
        let drained = sequencer.watermark(OUTPUT_STAGE) - drain_start;

        self.halt.store(true, Ordering::SeqCst);
        sequencer.notify_all();
        let join_deadline = deadline.map(|d| d.max(Instant::now() + JOIN_GRACE));
        let detached_workers = self
            .pools
            .iter_mut()
            .map(|pool| pool.join(join_deadline))
            .sum::<usize>();

        self.shared.swept.store(true, Ordering::SeqCst);
        let forced = Self::force_resolve(&ring);
        self.shared.set_state(State::Stopped);

        if forced > 0 || detached_workers > 0 {
            trace_error!(forced, detached_workers, "shutdown timed out");
        } else {
            trace_info!(drained, "pipeline stopped");
        }
        Ok(ShutdownReport {
            drained,
            forced,
            detached_workers,
        })
    }

    /// Resolve every handle still parked in the ring.
    fn force_resolve(ring: &RingBuffer<I, O>) -> u64 {
        let sequencer = ring.sequencer();
        let mut forced = 0;
        let mut sequence: Sequence = sequencer.watermark(OUTPUT_STAGE);
        let end = sequencer.claimed();
        while sequence < end {
            if let Some(completer) = ring.slot(sequence).completer().take() {
                if completer.resolve(Completion::Failure(FailureReason::ShutdownForced)) {
                    forced += 1;
                }
            }
            sequence += 1;
        }
        forced
    }

    fn wake_publishers(&self) {
        if let Some(ring) = self.shared.ring.get() {
            ring.sequencer().capacity_signal().notify();
        }
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// `capacity - (claimed - output watermark)`.
    pub fn remaining_capacity(&self) -> u64 {
        self.shared.remaining_capacity()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let workers: Vec<_> = self
            .pools
            .iter()
            .flat_map(|pool| pool.metrics().iter().cloned())
            .collect();
        MetricsSnapshot::collect(
            &self.shared.producer_metrics,
            self.shared.remaining_capacity(),
            &workers,
        )
    }
}

impl<I, O> Drop for Pipeline<I, O> {
    fn drop(&mut self) {
        if matches!(self.shared.state(), State::Running | State::Paused) {
            trace_debug!("pipeline dropped while running");
            let _ = self.stop();
        }
    }
}

pub struct PipelineBuilder<I, O> {
    config: PipelineConfig,
    filter: Option<Arc<dyn Filter<I, O>>>,
    sink: Option<Arc<dyn Sink<O>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<I: Send + 'static, O: Send + 'static> PipelineBuilder<I, O> {
    pub fn filter<F: Filter<I, O> + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn sink<S: Sink<O> + 'static>(mut self, sink: S) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<Pipeline<I, O>> {
        self.config.validate()?;
        let filter = self
            .filter
            .ok_or_else(|| SluiceError::config("a filter is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| SluiceError::config("a sink is required"))?;

        let shared = Arc::new(Shared {
            ring: OnceLock::new(),
            state: AtomicU8::new(State::Created as u8),
            active_publishers: AtomicUsize::new(0),
            swept: AtomicBool::new(false),
            capacity: u64::from(self.config.capacity),
            publish_mode: self.config.publish_mode,
            wait_strategy: self.config.wait_strategy,
            producer_metrics: ProducerMetrics::default(),
            metrics_sink: self.metrics,
        });

        Ok(Pipeline {
            config: self.config,
            shared,
            filter,
            sink,
            halt: Arc::new(AtomicBool::new(false)),
            pools: Vec::new(),
        })
    }
}
