//! Stage-agnostic worker pool.
//!
//! N threads share one stage cursor and steal sequences from it one at a
//! time, so every sequence visible to the stage is processed by exactly one
//! worker. A failing message never stops a worker: the handler reports the
//! failure and the sequence is still marked done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::affinity;
use crate::completion::{Completer, Completion};
use crate::disruptor::{Backoff, RingBuffer, Sequence, WaitStrategy, FILTER_STAGE, OUTPUT_STAGE};
use crate::error::Result;
use crate::insights::{MetricsSink, WorkerMetrics};

const JOIN_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Filter,
    Output,
}

impl Stage {
    /// Position of this stage in the sequencer.
    pub fn index(self) -> usize {
        match self {
            Stage::Filter => FILTER_STAGE,
            Stage::Output => OUTPUT_STAGE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Filter => "filter",
            Stage::Output => "output",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of handling one sequence.
pub(crate) struct Processed {
    pub ok: bool,
    /// Resolved by the worker after the sequence is marked done.
    pub resolve: Option<(Completer, Completion)>,
}

impl Processed {
    pub(crate) fn ok(ok: bool) -> Self {
        Self { ok, resolve: None }
    }
}

pub(crate) trait StageHandler<I, O>: Send + Sync + 'static {
    /// Handle `sequence`. The caller owns the sequence for this stage until
    /// it marks it done, and must not call this twice for one sequence.
    fn handle(&self, ring: &RingBuffer<I, O>, sequence: Sequence) -> Processed;
}

/// Settings shared by every pool of a pipeline.
pub(crate) struct PoolContext {
    pub halt: Arc<AtomicBool>,
    pub wait_strategy: WaitStrategy,
    pub metrics_sink: Arc<dyn MetricsSink>,
    pub thread_name: String,
    pub worker_cores: Vec<usize>,
}

pub(crate) struct WorkerPool {
    stage: Stage,
    threads: Vec<JoinHandle<()>>,
    metrics: Vec<Arc<WorkerMetrics>>,
}

impl WorkerPool {
    /// Spawn `size` workers for `stage`. `core_offset` shifts this pool's
    /// position in the CPU pinning list.
    pub(crate) fn spawn<I, O, H>(
        ring: Arc<RingBuffer<I, O>>,
        stage: Stage,
        size: usize,
        handler: Arc<H>,
        ctx: &PoolContext,
        core_offset: usize,
    ) -> Result<Self>
    where
        I: Send + 'static,
        O: Send + 'static,
        H: StageHandler<I, O>,
    {
        let mut pool = Self {
            stage,
            threads: Vec::with_capacity(size),
            metrics: Vec::with_capacity(size),
        };

        for worker in 0..size {
            let metrics = Arc::new(WorkerMetrics::new(stage, worker));
            let core = affinity::core_for_worker(&ctx.worker_cores, core_offset + worker);
            let runner = Worker {
                ring: ring.clone(),
                stage,
                worker,
                handler: handler.clone(),
                halt: ctx.halt.clone(),
                wait_strategy: ctx.wait_strategy,
                metrics: metrics.clone(),
                sink: ctx.metrics_sink.clone(),
            };

            let spawned = thread::Builder::new()
                .name(format!("{}-{}-{}", ctx.thread_name, stage, worker))
                .spawn(move || {
                    if let Some(core) = core {
                        if let Err(_e) = affinity::pin_to_core(core) {
                            trace_warn!(core, error = %_e, "failed to pin worker thread");
                        }
                    }
                    runner.run();
                });

            match spawned {
                Ok(handle) => {
                    pool.threads.push(handle);
                    pool.metrics.push(metrics);
                }
                Err(e) => {
                    ctx.halt.store(true, Ordering::SeqCst);
                    ring.sequencer().notify_all();
                    pool.join(None);
                    return Err(e.into());
                }
            }
        }

        Ok(pool)
    }

    pub(crate) fn metrics(&self) -> &[Arc<WorkerMetrics>] {
        &self.metrics
    }

    /// Join every worker. With a deadline, workers still running when it
    /// passes are detached instead. Returns the number detached.
    pub(crate) fn join(&mut self, deadline: Option<Instant>) -> usize {
        let mut detached = 0;
        for handle in self.threads.drain(..) {
            if let Some(deadline) = deadline {
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(JOIN_POLL);
                }
                if !handle.is_finished() {
                    trace_warn!(
                        thread = handle.thread().name().unwrap_or("?"),
                        "worker did not stop in time, detaching"
                    );
                    detached += 1;
                    continue;
                }
            }
            if handle.join().is_err() {
                trace_error!(stage = %self.stage, "worker thread panicked outside a handler");
            }
        }
        detached
    }
}

struct Worker<I, O, H> {
    ring: Arc<RingBuffer<I, O>>,
    stage: Stage,
    worker: usize,
    handler: Arc<H>,
    halt: Arc<AtomicBool>,
    wait_strategy: WaitStrategy,
    metrics: Arc<WorkerMetrics>,
    sink: Arc<dyn MetricsSink>,
}

impl<I, O, H: StageHandler<I, O>> Worker<I, O, H> {
    fn run(self) {
        let sequencer = self.ring.sequencer();
        let stage = self.stage.index();
        let mut backoff = Backoff::new(self.wait_strategy);
        trace_debug!(stage = %self.stage, worker = self.worker, "worker started");

        while !self.halt.load(Ordering::Acquire) {
            let Some(sequence) = sequencer.try_claim_for_stage(stage, self.worker) else {
                backoff.wait(sequencer.upstream_signal(stage), || {
                    sequencer.has_work(stage) || self.halt.load(Ordering::Acquire)
                });
                continue;
            };

            let start = Instant::now();
            let processed = self.handler.handle(&self.ring, sequence);
            sequencer.mark_done(stage, self.worker, sequence);
            if let Some((completer, completion)) = processed.resolve {
                completer.resolve(completion);
            }

            let elapsed = start.elapsed();
            self.metrics.record(elapsed, processed.ok);
            self.sink
                .message_processed(self.stage, self.worker, elapsed, processed.ok);
            backoff.reset();
        }

        trace_debug!(stage = %self.stage, worker = self.worker, "worker stopped");
    }
}
