//! Channel controllers: owner, producer, consumer
//!
//! Alur kontrol:
//! producer publish → consumer bangun, baca, ack → consumer terakhir
//! signal `drained` → producer flip slot dan menulis lagi.
//!
//! Hanya [`ChannelOwner`] yang membuat dan menghapus segment. Producer dan
//! consumer cuma attach.

mod consumer;
mod owner;
mod producer;

pub use consumer::{Consumer, Received};
pub use owner::ChannelOwner;
pub use producer::Producer;

use std::thread;

use crate::config::ChannelConfig;
use crate::core::ChannelMapping;
use crate::error::Result;

/// Attach ke segment dengan retry + backoff selama segment belum ada
/// atau belum selesai di-init.
pub(crate) fn attach_mapping(config: &ChannelConfig, role: &'static str) -> Result<ChannelMapping> {
    config.validate()?;

    let mut attempt = 0;
    loop {
        match ChannelMapping::open(&config.name) {
            Ok(mapping) => {
                tracing::info!(role, name = %config.name, attempts = attempt + 1, "attached to channel");
                return Ok(mapping);
            }
            Err(err) if err.is_retryable() && attempt + 1 < config.attach_attempts => {
                let backoff = config.backoff_for(attempt);
                tracing::debug!(role, name = %config.name, attempt = attempt + 1, ?backoff, %err, "channel not available yet");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(err) => {
                tracing::warn!(role, name = %config.name, attempts = attempt + 1, %err, "giving up on attach");
                return Err(err);
            }
        }
    }
}
