//! Flip-Flop Producer
//!
//! Membuat segment (sebagai owner), lalu publish payload acak 10 huruf
//! `[a-zA-Z]` dan menunggu semua consumer membaca sebelum publish berikutnya.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin flipflop_producer -- --consumers 2 --interval-ms 500
//! ```

use std::process::ExitCode;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;

use flipflop::config::{DEFAULT_CONSUMERS, DEFAULT_NAME};
use flipflop::{ChannelConfig, ChannelError, ChannelOwner, DrainStrategy, PAYLOAD_CAPACITY};

#[derive(Debug, Parser)]
#[command(name = "flipflop_producer", about = "Publish into a flip-flop shared memory channel")]
struct Args {
    /// Shared memory name (must start with '/')
    #[arg(long, default_value = DEFAULT_NAME)]
    name: String,

    /// Number of consumers that must read each version
    #[arg(short, long, default_value_t = DEFAULT_CONSUMERS)]
    consumers: u32,

    /// Stop after this many publishes (default: run forever)
    #[arg(long)]
    count: Option<u64>,

    /// Pause between publishes
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Poll reader_count with this interval instead of waiting on the drained signal
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Report a stall after this long without a full drain (0 = never)
    #[arg(long, default_value_t = 10_000)]
    drain_timeout_ms: u64,

    /// Remove a stale segment with the same name before creating
    #[arg(long)]
    replace: bool,

    /// Remove the segment when the producer finishes
    #[arg(long)]
    destroy_on_exit: bool,

    /// Seed for the payload generator
    #[arg(long)]
    seed: Option<u64>,
}

/// Generator payload acak (LCG, tanpa alokasi)
struct PayloadGenerator {
    state: u64,
}

impl PayloadGenerator {
    const CHARSET: &'static [u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_payload(&mut self) -> [u8; PAYLOAD_CAPACITY] {
        let mut out = [0u8; PAYLOAD_CAPACITY];
        for b in out.iter_mut() {
            self.state = self
                .state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            *b = Self::CHARSET[((self.state >> 33) % Self::CHARSET.len() as u64) as usize];
        }
        out
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn run(args: Args) -> Result<(), ChannelError> {
    let drain = match args.poll_ms {
        Some(ms) => DrainStrategy::Poll {
            interval: Duration::from_millis(ms.max(1)),
        },
        None => DrainStrategy::Signal,
    };
    let config = ChannelConfig::new(args.name)
        .with_consumers(args.consumers)
        .with_drain(drain)
        .with_drain_timeout(millis(args.drain_timeout_ms));

    let owner = if args.replace {
        ChannelOwner::replace(config)?
    } else {
        ChannelOwner::create(config)?
    };
    tracing::info!(name = owner.name(), consumers = args.consumers, "producer created channel");

    let mut producer = owner.producer()?;
    let seed = args.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    });
    let mut generator = PayloadGenerator::new(seed);

    let mut published = 0u64;
    while args.count.map_or(true, |count| published < count) {
        let payload = generator.next_payload();
        let report = producer.publish(&payload)?;
        published += 1;
        tracing::info!(
            version = report.version,
            slot = report.slot,
            flipped = report.flipped,
            payload = %String::from_utf8_lossy(&payload),
            "wrote"
        );

        loop {
            match producer.wait_for_drain() {
                Ok(()) => break,
                Err(err @ ChannelError::ProtocolStall { .. }) => {
                    tracing::warn!(%err, "consumers are not draining, still waiting");
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(interval) = millis(args.interval_ms) {
            thread::sleep(interval);
        }
    }

    producer.detach();
    if args.destroy_on_exit {
        owner.destroy()?;
    } else {
        tracing::info!(
            name = owner.name(),
            "segment left in place; remove it with flipflop_cleanup"
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    flipflop::init_tracing();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "producer failed");
            ExitCode::FAILURE
        }
    }
}
