//! Flip-Flop - Cross-Process Broadcast Channel
//!
//! Satu producer, beberapa consumer, berkomunikasi lewat named POSIX shared
//! memory yang berisi dua slot bergantian (flip-flop), version counter, dan
//! reader count. Sinkronisasi memakai pthread mutex + condvar yang ada di
//! dalam segment itu sendiri.
//!
//! Arsitektur:
//! - [`core`]: segment manager, primitive lintas proses, layout state
//! - [`channel`]: owner (create/destroy), producer, consumer
//! - [`config`]: timeout, strategi drain, retry attach
//!
//! ```no_run
//! use flipflop::{ChannelConfig, ChannelOwner, Consumer};
//!
//! let config = ChannelConfig::new("/shm_flipflop").with_consumers(1);
//! let owner = ChannelOwner::create(config.clone())?;
//! let mut producer = owner.producer()?;
//! let mut consumer = Consumer::attach(config)?;
//!
//! producer.publish(b"AAAAAAAAAA")?;
//! let received = consumer.recv()?;
//! assert_eq!(received.payload.as_bytes(), b"AAAAAAAAAA");
//! producer.wait_for_drain()?;
//!
//! owner.destroy()?;
//! # Ok::<(), flipflop::ChannelError>(())
//! ```

#[cfg(not(unix))]
compile_error!("flipflop requires POSIX shared memory and process-shared pthread primitives");

pub mod channel;
pub mod config;
pub mod core;
pub mod error;

pub use channel::{ChannelOwner, Consumer, Producer, Received};
pub use config::{ChannelConfig, DrainStrategy};
pub use crate::core::{ChannelSnapshot, Payload, PublishReport, PAYLOAD_CAPACITY, STRING_SIZE};
pub use error::{ChannelError, Result, StallPhase};

/// Pasang subscriber `tracing` dengan filter dari `RUST_LOG`.
///
/// Dipanggil oleh binary; library sendiri tidak pernah memasang subscriber.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
