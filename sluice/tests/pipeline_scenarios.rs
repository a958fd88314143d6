//! End-to-end pipeline scenarios: backpressure, exactly-once, failures and
//! shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use sluice::{
    Codec, CodecRegistry, Completion, DecodingFilter, DeliveryError, FailureReason,
    LogPipeline, Message, MetricsSink, Pipeline, PipelineConfig, ProcessingError, PublishEvent,
    PublishMode, PublishOutcome, RawCodec, RawMessage, Rejection, RetryPolicy, Stage, State,
    WaitStrategy,
};
use sluice_test_support::{DeliveryLedger, Fault, FaultInjector};

const WAIT: Duration = Duration::from_secs(5);

/// Sink-side latch: closed until `open()` is called.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    fn pass(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

fn config(capacity: u32, filter_workers: u32, output_workers: u32) -> PipelineConfig {
    PipelineConfig::new(capacity)
        .unwrap()
        .with_filter_workers(filter_workers)
        .unwrap()
        .with_output_workers(output_workers)
        .unwrap()
        .with_wait_strategy(WaitStrategy::Yielding)
}

fn echo_pipeline(config: PipelineConfig) -> Pipeline<u64, u64> {
    Pipeline::new(
        config,
        |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
        |_n: u64| -> Result<(), DeliveryError> { Ok(()) },
    )
    .unwrap()
}

#[test]
fn test_all_succeed_and_capacity_restored() {
    let mut pipeline = echo_pipeline(config(4, 2, 1));
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    let handles: Vec<_> = (1..=4)
        .map(|n| publisher.try_publish(n).into_result().unwrap())
        .collect();
    for handle in &handles {
        assert_eq!(handle.wait_timeout(WAIT), Some(Completion::Success));
    }
    assert_eq!(pipeline.remaining_capacity(), 4);

    let report = pipeline.stop().unwrap();
    assert_eq!(report.forced, 0);
}

#[test]
fn test_capacity_exceeded_until_output_completes() {
    let gate = Arc::new(Gate::default());
    let sink_gate = gate.clone();
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(2, 1, 1).with_publish_mode(PublishMode::NonBlocking),
        |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
        move |_n: u64| -> Result<(), DeliveryError> {
            sink_gate.pass();
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    let m1 = publisher.submit(1).into_result().unwrap();
    let _m2 = publisher.submit(2).into_result().unwrap();
    assert_eq!(publisher.remaining_capacity(), 0);

    match publisher.submit(3) {
        PublishOutcome::CapacityExceeded(returned) => assert_eq!(returned, 3),
        other => panic!("expected CapacityExceeded, got accepted={}", other.is_accepted()),
    }

    gate.open();
    assert_eq!(m1.wait_timeout(WAIT), Some(Completion::Success));
    let m3 = publisher.try_publish(3).into_result().unwrap();
    assert_eq!(m3.wait_timeout(WAIT), Some(Completion::Success));

    pipeline.stop().unwrap();
    let metrics = pipeline.metrics();
    assert_eq!(metrics.capacity_exceeded, 1);
    assert_eq!(metrics.accepted, 3);
}

#[test]
fn test_blocking_publish_waits_for_output() {
    let gate = Arc::new(Gate::default());
    let sink_gate = gate.clone();
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(2, 1, 1),
        |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
        move |_n: u64| -> Result<(), DeliveryError> {
            sink_gate.pass();
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    let m1 = publisher.publish(1).unwrap();
    let m2 = publisher.publish(2).unwrap();
    let blocked = {
        let publisher = publisher.clone();
        thread::spawn(move || publisher.publish(3).unwrap())
    };

    // Both slots are held until the sink lets m1 through.
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());
    assert!(!m1.is_resolved());

    gate.open();
    assert_eq!(m1.wait_timeout(WAIT), Some(Completion::Success));
    let m3 = blocked.join().unwrap();
    assert_eq!(m2.wait_timeout(WAIT), Some(Completion::Success));
    assert_eq!(m3.wait_timeout(WAIT), Some(Completion::Success));

    let report = pipeline.stop().unwrap();
    assert_eq!(report.forced, 0);
    assert_eq!(pipeline.metrics().accepted, 3);
}

#[test]
fn test_blocking_publish_never_exceeds_capacity() {
    const CAPACITY: u32 = 4;
    let publisher_slot: Arc<Mutex<Option<sluice::Publisher<u64, u64>>>> =
        Arc::new(Mutex::new(None));
    let observed = publisher_slot.clone();
    let max_in_use = Arc::new(AtomicU64::new(0));
    let sink_max = max_in_use.clone();

    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(CAPACITY, 2, 2),
        |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
        move |_n: u64| -> Result<(), DeliveryError> {
            if let Some(publisher) = observed.lock().as_ref() {
                let in_use = u64::from(CAPACITY) - publisher.remaining_capacity();
                sink_max.fetch_max(in_use, Ordering::Relaxed);
            }
            thread::sleep(Duration::from_micros(50));
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();
    *publisher_slot.lock() = Some(pipeline.publisher());

    let producers: Vec<_> = (0..4u64)
        .map(|p| {
            let publisher = pipeline.publisher();
            thread::spawn(move || {
                (0..100)
                    .map(|i| publisher.publish(p * 100 + i).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for producer in producers {
        for handle in producer.join().unwrap() {
            assert_eq!(handle.wait_timeout(WAIT), Some(Completion::Success));
        }
    }

    publisher_slot.lock().take();
    pipeline.stop().unwrap();
    assert!(max_in_use.load(Ordering::Relaxed) <= u64::from(CAPACITY));
    assert_eq!(pipeline.metrics().capacity_exceeded, 0);
    assert_eq!(pipeline.metrics().accepted, 400);
}

#[test]
fn test_exactly_once_per_stage_multi_producer() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 250;
    let ledger = Arc::new(DeliveryLedger::new(2));
    let out_of_order = Arc::new(AtomicU64::new(0));

    let filter_ledger = ledger.clone();
    let sink_ledger = ledger.clone();
    let sink_order = out_of_order.clone();
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(64, 3, 2),
        move |id: u64| -> Result<Option<u64>, ProcessingError> {
            filter_ledger.record(Stage::Filter.index(), id);
            Ok(Some(id))
        },
        move |id: u64| -> Result<(), DeliveryError> {
            if !sink_ledger.contains(Stage::Filter.index(), id) {
                sink_order.fetch_add(1, Ordering::Relaxed);
            }
            sink_ledger.record(Stage::Output.index(), id);
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let publisher = pipeline.publisher();
            thread::spawn(move || {
                (0..PER_PRODUCER)
                    .map(|i| publisher.publish(p * PER_PRODUCER + i).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let handles: Vec<_> = producers
        .into_iter()
        .flat_map(|p| p.join().unwrap())
        .collect();

    let report = pipeline.stop().unwrap();
    assert_eq!(report.forced, 0);
    for handle in &handles {
        assert_eq!(handle.try_result(), Some(Completion::Success));
    }

    let total = PRODUCERS * PER_PRODUCER;
    for stage in [Stage::Filter, Stage::Output] {
        let seen = ledger.report(stage.index(), 0..total);
        assert!(seen.is_exact(), "{} stage: {:?}", stage, seen);
        assert!(seen.per_worker.keys().all(|w| w.starts_with("sluice-")));
    }
    assert_eq!(out_of_order.load(Ordering::Relaxed), 0);
}

#[test]
fn test_padded_and_packed_slots_agree() {
    fn run(padded: bool) -> Vec<String> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let mut pipeline: Pipeline<u64, String> = Pipeline::new(
            config(16, 2, 2).with_padded_slots(padded),
            |n: u64| -> Result<Option<String>, ProcessingError> {
                Ok((n % 3 != 0).then(|| format!("msg-{}", n)))
            },
            move |s: String| -> Result<(), DeliveryError> {
                sink.lock().push(s);
                Ok(())
            },
        )
        .unwrap();
        pipeline.start().unwrap();
        let publisher = pipeline.publisher();
        for n in 0..300 {
            let _ = publisher.publish(n).unwrap();
        }
        pipeline.stop().unwrap();

        let mut out = collected.lock().clone();
        out.sort();
        out
    }

    let packed = run(false);
    assert_eq!(packed.len(), 200);
    assert_eq!(packed, run(true));
}

#[test]
fn test_filter_failure_is_isolated() {
    let faults = Arc::new(FaultInjector::new().with_fault(2, Fault::Fail));
    let filter_faults = faults.clone();
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(4, 1, 1),
        move |n: u64| -> Result<Option<u64>, ProcessingError> {
            filter_faults.check(n).map_err(ProcessingError::new)?;
            Ok(Some(n))
        },
        |_n: u64| -> Result<(), DeliveryError> { Ok(()) },
    )
    .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    let handles: Vec<_> = (1..=3).map(|n| publisher.publish(n).unwrap()).collect();
    assert_eq!(handles[0].wait_timeout(WAIT), Some(Completion::Success));
    assert!(matches!(
        handles[1].wait_timeout(WAIT),
        Some(Completion::Failure(FailureReason::Filter(_)))
    ));
    assert_eq!(handles[2].wait_timeout(WAIT), Some(Completion::Success));

    let later: Vec<_> = (4..20).map(|n| publisher.publish(n).unwrap()).collect();
    for handle in &later {
        assert_eq!(handle.wait_timeout(WAIT), Some(Completion::Success));
    }
    assert_eq!(faults.injected(), 1);

    pipeline.stop().unwrap();
    assert_eq!(pipeline.metrics().failures(Stage::Filter), 1);
}

#[test]
fn test_sink_panic_resolves_panicked() {
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(8, 1, 1),
        |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
        |n: u64| -> Result<(), DeliveryError> {
            if n == 2 {
                panic!("sink exploded on {}", n);
            }
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    let handles: Vec<_> = (1..=3).map(|n| publisher.publish(n).unwrap()).collect();
    assert_eq!(handles[0].wait_timeout(WAIT), Some(Completion::Success));
    match handles[1].wait_timeout(WAIT) {
        Some(Completion::Failure(FailureReason::Panicked { stage, message })) => {
            assert_eq!(stage, "output");
            assert!(message.contains("sink exploded"));
        }
        other => panic!("expected a panic failure, got {:?}", other),
    }
    assert_eq!(handles[2].wait_timeout(WAIT), Some(Completion::Success));

    let report = pipeline.stop().unwrap();
    assert_eq!(report.detached_workers, 0);
}

#[test]
fn test_delivery_error_reaches_handle() {
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(8, 1, 1),
        |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
        |n: u64| -> Result<(), DeliveryError> {
            if n % 2 == 0 {
                Err(DeliveryError::new("index unavailable"))
            } else {
                Ok(())
            }
        },
    )
    .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    let odd = publisher.publish(1).unwrap();
    let even = publisher.publish(2).unwrap();
    assert_eq!(odd.wait_timeout(WAIT), Some(Completion::Success));
    assert_eq!(
        even.wait_timeout(WAIT),
        Some(Completion::Failure(FailureReason::Delivery(
            DeliveryError::new("index unavailable")
        )))
    );
    pipeline.stop().unwrap();
}

#[test]
fn test_pause_and_resume() {
    let mut pipeline = echo_pipeline(config(8, 1, 1));
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    pipeline.pause().unwrap();
    assert_eq!(publisher.state(), State::Paused);
    assert!(matches!(
        publisher.try_publish(1),
        PublishOutcome::ProcessingDisabled(1)
    ));
    let err = publisher.publish(2).unwrap_err();
    assert_eq!(err.kind(), Rejection::ProcessingDisabled);

    pipeline.resume().unwrap();
    let handle = publisher.publish(3).unwrap();
    assert_eq!(handle.wait_timeout(WAIT), Some(Completion::Success));

    pipeline.stop().unwrap();
    assert!(matches!(
        publisher.try_publish(4),
        PublishOutcome::ProcessingDisabled(4)
    ));
    let metrics = pipeline.metrics();
    assert_eq!(metrics.processing_disabled, 3);
    assert_eq!(metrics.accepted, 1);
}

#[test]
fn test_stop_wakes_blocked_publisher() {
    let gate = Arc::new(Gate::default());
    let sink_gate = gate.clone();
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(1, 1, 1)
            .with_shutdown_timeout(Duration::from_millis(100))
            .unwrap(),
        |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
        move |_n: u64| -> Result<(), DeliveryError> {
            sink_gate.pass();
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();
    let _first = publisher.publish(1).unwrap();

    let blocked = {
        let publisher = publisher.clone();
        thread::spawn(move || publisher.publish(2))
    };
    thread::sleep(Duration::from_millis(20));

    let report = pipeline.stop().unwrap();
    let rejected = blocked.join().unwrap().unwrap_err();
    assert_eq!(rejected.kind(), Rejection::ProcessingDisabled);
    assert_eq!(rejected.into_message(), 2);
    assert_eq!(report.forced, 1);

    gate.open();
}

#[test]
fn test_forced_shutdown() {
    let gate = Arc::new(Gate::default());
    let sink_gate = gate.clone();
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config(8, 1, 1)
            .with_shutdown_timeout(Duration::from_millis(100))
            .unwrap(),
        |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
        move |_n: u64| -> Result<(), DeliveryError> {
            sink_gate.pass();
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    let handles: Vec<_> = (1..=3).map(|n| publisher.publish(n).unwrap()).collect();
    let report = pipeline.stop().unwrap();

    assert_eq!(pipeline.state(), State::Stopped);
    assert_eq!(report.forced, 3);
    assert_eq!(report.drained, 0);
    assert_eq!(report.detached_workers, 1);
    for handle in &handles {
        assert_eq!(
            handle.try_result(),
            Some(Completion::Failure(FailureReason::ShutdownForced))
        );
    }

    // Let the detached output worker return.
    gate.open();
}

#[test]
fn test_drop_drains_running_pipeline() {
    let delivered = Arc::new(AtomicU64::new(0));
    let counter = delivered.clone();
    let handles = {
        let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
            config(32, 2, 1),
            |n: u64| -> Result<Option<u64>, ProcessingError> { Ok(Some(n)) },
            move |_n: u64| -> Result<(), DeliveryError> {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
        )
        .unwrap();
        pipeline.start().unwrap();
        let publisher = pipeline.publisher();
        (0..20).map(|n| publisher.publish(n).unwrap()).collect::<Vec<_>>()
    };

    assert_eq!(delivered.load(Ordering::Relaxed), 20);
    assert!(handles.iter().all(|h| h.try_result() == Some(Completion::Success)));
}

#[test]
fn test_retry_policy_gives_up() {
    let mut pipeline = echo_pipeline(config(4, 1, 1));
    pipeline.start().unwrap();
    pipeline.pause().unwrap();
    let publisher = pipeline.publisher();

    let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(1))
        .with_max_attempts(3);
    let err = policy.publish(&publisher, 7).unwrap_err();
    assert_eq!(err.kind(), Rejection::ProcessingDisabled);
    assert_eq!(*err.message(), 7);
    assert_eq!(pipeline.metrics().processing_disabled, 3);

    let resumer = {
        let publisher = publisher.clone();
        thread::spawn(move || {
            let policy = RetryPolicy::new(Duration::from_millis(2), Duration::from_millis(2));
            policy.publish(&publisher, 8)
        })
    };
    thread::sleep(Duration::from_millis(20));
    pipeline.resume().unwrap();
    let handle = resumer.join().unwrap().unwrap();
    assert_eq!(handle.wait_timeout(WAIT), Some(Completion::Success));

    pipeline.stop().unwrap();
}

#[derive(Default)]
struct CountingMetrics {
    processed: [AtomicU64; 2],
    failed: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl MetricsSink for CountingMetrics {
    fn message_processed(&self, stage: Stage, _worker: usize, _elapsed: Duration, ok: bool) {
        self.processed[stage.index()].fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn publish(&self, event: PublishEvent) {
        match event {
            PublishEvent::Accepted => self.accepted.fetch_add(1, Ordering::Relaxed),
            _ => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
    }
}

#[test]
fn test_metrics_sink_sees_every_event() {
    let metrics = Arc::new(CountingMetrics::default());
    let mut pipeline = Pipeline::<u64, u64>::builder(config(16, 2, 1))
        .filter(|n: u64| -> Result<Option<u64>, ProcessingError> {
            if n == 5 {
                Err(ProcessingError::new("bad"))
            } else {
                Ok(Some(n))
            }
        })
        .sink(|_n: u64| -> Result<(), DeliveryError> { Ok(()) })
        .metrics(metrics.clone())
        .build()
        .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();
    for n in 0..50 {
        let _ = publisher.publish(n).unwrap();
    }
    pipeline.stop().unwrap();
    let _ = publisher.try_publish(99);

    assert_eq!(metrics.processed[Stage::Filter.index()].load(Ordering::Relaxed), 50);
    assert_eq!(metrics.processed[Stage::Output.index()].load(Ordering::Relaxed), 50);
    // Counted once by the filter and again by the output stage.
    assert_eq!(metrics.failed.load(Ordering::Relaxed), 2);
    assert_eq!(metrics.accepted.load(Ordering::Relaxed), 50);
    assert_eq!(metrics.rejected.load(Ordering::Relaxed), 1);

    let snapshot = pipeline.metrics();
    assert_eq!(snapshot.processed(Stage::Output), 50);
    assert_eq!(snapshot.failures(Stage::Filter), 1);
}

struct UpperCodec;

impl Codec for UpperCodec {
    fn name(&self) -> &str {
        "upper"
    }

    fn decode(&self, raw: &RawMessage) -> Result<Option<Message>, ProcessingError> {
        let text = std::str::from_utf8(&raw.payload)
            .map_err(|e| ProcessingError::new(e.to_string()))?;
        Ok(Some(Message::new(raw.id, "upper-host", text.to_uppercase())))
    }
}

#[test]
fn test_log_pipeline_decodes_and_stamps() {
    let mut registry = CodecRegistry::with_defaults();
    registry.register(UpperCodec);

    let delivered = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink = delivered.clone();
    let mut pipeline: LogPipeline = Pipeline::new(
        config(16, 2, 1),
        DecodingFilter::new(registry),
        move |message: Message| -> Result<(), DeliveryError> {
            sink.lock().push(message);
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();
    let publisher = pipeline.publisher();

    let addr: SocketAddr = "10.0.0.7:5140".parse().unwrap();
    let syslog = publisher
        .publish(
            RawMessage::new(1, RawCodec::NAME, "<13>host app: hello\r\n")
                .with_remote_addr(addr)
                .with_source_input("syslog-udp"),
        )
        .unwrap();
    let upper = publisher
        .publish(RawMessage::new(2, "upper", "quiet"))
        .unwrap();
    let unknown = publisher
        .publish(RawMessage::new(3, "gelf", "{}"))
        .unwrap();
    let empty = publisher.publish(RawMessage::new(4, RawCodec::NAME, "")).unwrap();
    let invalid = publisher
        .publish(RawMessage::new(5, "upper", vec![0xff, 0xfe]))
        .unwrap();

    for handle in [&syslog, &upper, &unknown, &empty] {
        assert_eq!(handle.wait_timeout(WAIT), Some(Completion::Success));
    }
    match invalid.wait_timeout(WAIT) {
        Some(Completion::Failure(FailureReason::Filter(e))) => {
            assert!(e.to_string().starts_with("upper codec: "))
        }
        other => panic!("expected a codec failure, got {:?}", other),
    }
    pipeline.stop().unwrap();

    let mut delivered = delivered.lock().clone();
    delivered.sort_by_key(|m| m.id);
    assert_eq!(delivered.len(), 2);

    let first = &delivered[0];
    assert_eq!(first.text(), Some("<13>host app: hello"));
    assert_eq!(first.source, "10.0.0.7");
    assert_eq!(first.field("remote_ip"), Some(&serde_json::json!("10.0.0.7")));
    assert_eq!(first.field("remote_port"), Some(&serde_json::json!(5140)));
    assert_eq!(first.field("source_input"), Some(&serde_json::json!("syslog-udp")));

    let second = &delivered[1];
    assert_eq!(second.text(), Some("QUIET"));
    assert_eq!(second.source, "upper-host");
}
