//! Flip-Flop Consumer
//!
//! Attach ke channel yang sudah dibuat producer, lalu baca setiap versi baru.
//! Setiap pesan dicetak ke stdout:
//!
//! ```text
//! version=<v> slot=<s> payload=<p>
//! ```
//!
//! Log diagnostik ke stderr (atur dengan `RUST_LOG`).

use std::io::{self, Write};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;

use flipflop::config::DEFAULT_NAME;
use flipflop::{ChannelConfig, ChannelError, Consumer};

#[derive(Debug, Parser)]
#[command(name = "flipflop_consumer", about = "Read from a flip-flop shared memory channel")]
struct Args {
    /// Shared memory name (must start with '/')
    #[arg(long, default_value = DEFAULT_NAME)]
    name: String,

    /// Stop after this many messages (default: run forever)
    #[arg(long)]
    count: Option<u64>,

    /// Pause after each read
    #[arg(long, default_value_t = 100)]
    delay_ms: u64,

    /// How many times to try attaching before giving up
    #[arg(long, default_value_t = 50)]
    attach_attempts: u32,

    /// Report a stall after this long without a new version (0 = never)
    #[arg(long, default_value_t = 10_000)]
    version_timeout_ms: u64,
}

fn run(args: Args) -> Result<(), ChannelError> {
    let version_timeout = (args.version_timeout_ms > 0)
        .then(|| Duration::from_millis(args.version_timeout_ms));
    let config = ChannelConfig::new(args.name)
        .with_version_timeout(version_timeout)
        .with_attach_retry(args.attach_attempts, Duration::from_millis(20));

    let mut consumer = Consumer::attach(config)?;
    tracing::info!(pid = std::process::id(), name = consumer.name(), "consumer attached");

    let stdout = io::stdout();
    let mut received = 0u64;
    while args.count.map_or(true, |count| received < count) {
        let msg = match consumer.recv() {
            Ok(msg) => msg,
            Err(err @ ChannelError::ProtocolStall { .. }) => {
                tracing::warn!(%err, "no new version yet");
                continue;
            }
            Err(err) => return Err(err),
        };
        received += 1;

        let mut out = stdout.lock();
        let _ = writeln!(
            out,
            "version={} slot={} payload={}",
            msg.version, msg.slot, msg.payload
        );
        let _ = out.flush();
        drop(out);

        if args.delay_ms > 0 {
            thread::sleep(Duration::from_millis(args.delay_ms));
        }
    }

    consumer.detach();
    Ok(())
}

fn main() -> ExitCode {
    flipflop::init_tracing();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "consumer failed");
            ExitCode::FAILURE
        }
    }
}
