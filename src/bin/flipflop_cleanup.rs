//! Flip-Flop Cleanup
//!
//! Teardown eksplisit: hapus nama segment dari sistem. Proses yang masih
//! attach tetap bisa memakai mapping-nya sampai keluar.

use std::process::ExitCode;

use clap::Parser;

use flipflop::config::DEFAULT_NAME;
use flipflop::{ChannelError, ChannelOwner};

#[derive(Debug, Parser)]
#[command(name = "flipflop_cleanup", about = "Remove a flip-flop shared memory segment")]
struct Args {
    /// Shared memory name (must start with '/')
    #[arg(long, default_value = DEFAULT_NAME)]
    name: String,
}

fn main() -> ExitCode {
    flipflop::init_tracing();
    let args = Args::parse();

    match ChannelOwner::destroy_by_name(&args.name) {
        Ok(()) => {
            tracing::info!(name = %args.name, "shared memory cleaned up");
            ExitCode::SUCCESS
        }
        Err(err @ ChannelError::SegmentNotFound { .. }) => {
            tracing::warn!(%err, "nothing to clean up");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!(%err, "cleanup failed");
            ExitCode::FAILURE
        }
    }
}
