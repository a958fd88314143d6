//! Throughput Example
//!
//! Several producers push integers through a filter pool and an output pool,
//! then the per-worker latency figures are printed.

use sluice::{
    DeliveryError, Pipeline, PipelineConfig, ProcessingError, Stage, WaitStrategy,
};
use std::thread;
use std::time::Instant;

const RING_SIZE: u32 = 1024 * 64;
const PRODUCERS: u64 = 4;
const MESSAGES_PER_PRODUCER: u64 = 250_000;

fn main() {
    println!("\n=== Pipeline Throughput Example ===\n");

    let config = PipelineConfig::new(RING_SIZE)
        .unwrap()
        .with_filter_workers(4)
        .unwrap()
        .with_output_workers(2)
        .unwrap()
        .with_padded_slots(true)
        .with_wait_strategy(WaitStrategy::Yielding)
        .with_thread_name("bench");

    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        config,
        // Drop every tenth message
        |n: u64| -> Result<Option<u64>, ProcessingError> {
            Ok((n % 10 != 0).then_some(n * 2))
        },
        |n: u64| -> Result<(), DeliveryError> {
            std::hint::black_box(n);
            Ok(())
        },
    )
    .unwrap();
    pipeline.start().unwrap();

    let start = Instant::now();
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let publisher = pipeline.publisher();
            thread::spawn(move || {
                let base = p * MESSAGES_PER_PRODUCER;
                for i in 0..MESSAGES_PER_PRODUCER {
                    // Handles are dropped: fire and forget.
                    let _ = publisher.publish(base + i).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let report = pipeline.stop().unwrap();
    let elapsed = start.elapsed();
    let metrics = pipeline.metrics();
    let total = PRODUCERS * MESSAGES_PER_PRODUCER;

    println!("Messages:   {}", total);
    println!("Elapsed:    {:?}", elapsed);
    println!(
        "Throughput: {:.2} M msg/s",
        total as f64 / elapsed.as_secs_f64() / 1_000_000.0
    );
    println!("Drained on stop: {}", report.drained);
    println!(
        "Filter: {} processed, Output: {} processed\n",
        metrics.processed(Stage::Filter),
        metrics.processed(Stage::Output)
    );

    for worker in &metrics.workers {
        println!(
            "{:>6}-{}: {:>8} msgs  mean {:>8?}  p50 {:>8?}  p99 {:>8?}",
            worker.stage,
            worker.worker,
            worker.processed,
            worker.mean(),
            worker.quantile(0.5),
            worker.quantile(0.99)
        );
    }
}
