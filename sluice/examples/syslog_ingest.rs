//! Syslog Ingest Example
//!
//! A UDP listener feeds raw datagrams into a `LogPipeline`. The decoding
//! filter turns them into messages and the sink prints them as JSON.
//!
//! The example sends its own datagrams so it runs standalone.

use sluice::{
    CodecRegistry, DecodingFilter, DeliveryError, LogPipeline, Message, Pipeline,
    PipelineConfig, RawCodec, RawMessage, RetryPolicy,
};
use std::net::UdpSocket;
use std::time::Duration;

const LINES: &[&str] = &[
    "<34>Oct 11 22:14:15 gateway su: 'su root' failed for lonvick on /dev/pts/8",
    "<13>Oct 11 22:14:16 gateway sshd[4121]: Accepted publickey for deploy",
    "",
    "<165>Oct 11 22:14:17 gateway app: cache warmed in 812ms\r\n",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n=== Syslog Ingest Example ===\n");

    let listener = UdpSocket::bind("127.0.0.1:0")?;
    listener.set_read_timeout(Some(Duration::from_millis(200)))?;
    let listen_addr = listener.local_addr()?;

    let config = PipelineConfig::new(1024)?
        .with_filter_workers(2)?
        .with_shutdown_timeout(Duration::from_secs(2))?
        .with_thread_name("syslog");
    let mut pipeline: LogPipeline = Pipeline::new(
        config,
        DecodingFilter::new(CodecRegistry::with_defaults()),
        |message: Message| -> Result<(), DeliveryError> {
            let json = serde_json::to_string(&message)
                .map_err(|e| DeliveryError::new(e.to_string()))?;
            println!("{}", json);
            Ok(())
        },
    )?;
    pipeline.start()?;
    let publisher = pipeline.publisher();
    let retry = RetryPolicy::default().with_max_attempts(10);

    let sender = UdpSocket::bind("127.0.0.1:0")?;
    for line in LINES {
        sender.send_to(line.as_bytes(), listen_addr)?;
    }

    let mut handles = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    let mut next_id = 0u64;
    // An empty datagram is still a datagram; stop on the read timeout.
    while let Ok((len, remote)) = listener.recv_from(&mut buf) {
        let raw = RawMessage::new(next_id, RawCodec::NAME, &buf[..len])
            .with_remote_addr(remote)
            .with_source_input("syslog-udp");
        next_id += 1;

        match retry.publish(&publisher, raw) {
            Ok(handle) => handles.push(handle),
            Err(rejected) => eprintln!("dropped datagram {}: {}", rejected.message().id, rejected),
        }
    }

    for handle in &handles {
        println!("message #{} -> {:?}", handle.sequence(), handle.wait());
    }

    let report = pipeline.stop()?;
    let metrics = pipeline.metrics();
    println!(
        "\naccepted {} | drained on stop {} | forced {}",
        metrics.accepted, report.drained, report.forced
    );
    Ok(())
}
