//! Channel configuration
//!
//! Semua timeout bersifat opsional: `None` berarti menunggu tanpa batas,
//! sama seperti perilaku asli. Default-nya dibatasi supaya peer yang macet
//! terdeteksi sebagai [`ChannelError::ProtocolStall`].

use std::time::Duration;

use crate::core::validate_name;
use crate::error::{ChannelError, Result};

/// Nama segment default.
pub const DEFAULT_NAME: &str = "/shm_flipflop";

/// Jumlah consumer default.
pub const DEFAULT_CONSUMERS: u32 = 2;

/// Cara producer menunggu semua consumer selesai membaca.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStrategy {
    /// Blok di condvar `drained` yang di-signal consumer terakhir.
    Signal,
    /// Lock, cek `reader_count`, unlock, sleep, ulangi.
    Poll { interval: Duration },
}

impl Default for DrainStrategy {
    fn default() -> Self {
        Self::Signal
    }
}

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub name: String,
    /// Dipakai hanya oleh owner saat membuat segment.
    pub active_consumers: u32,
    pub drain: DrainStrategy,
    pub drain_timeout: Option<Duration>,
    pub version_timeout: Option<Duration>,
    pub lock_timeout: Option<Duration>,
    pub attach_attempts: u32,
    /// Backoff awal, digandakan tiap percobaan sampai [`MAX_ATTACH_BACKOFF`].
    pub attach_backoff: Duration,
}

/// Batas atas backoff saat attach.
pub const MAX_ATTACH_BACKOFF: Duration = Duration::from_secs(1);

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            active_consumers: DEFAULT_CONSUMERS,
            drain: DrainStrategy::Signal,
            drain_timeout: Some(Duration::from_secs(10)),
            version_timeout: Some(Duration::from_secs(10)),
            lock_timeout: Some(Duration::from_secs(5)),
            attach_attempts: 50,
            attach_backoff: Duration::from_millis(20),
        }
    }
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_consumers(mut self, active_consumers: u32) -> Self {
        self.active_consumers = active_consumers;
        self
    }

    pub fn with_drain(mut self, drain: DrainStrategy) -> Self {
        self.drain = drain;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_version_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.version_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_attach_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attach_attempts = attempts;
        self.attach_backoff = backoff;
        self
    }

    /// Validasi sebelum dipakai untuk create/attach.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.active_consumers == 0 {
            return Err(ChannelError::InvalidConfig(
                "active_consumers must be at least 1",
            ));
        }
        if self.attach_attempts == 0 {
            return Err(ChannelError::InvalidConfig(
                "attach_attempts must be at least 1",
            ));
        }
        if let DrainStrategy::Poll { interval } = self.drain {
            if interval.is_zero() {
                return Err(ChannelError::InvalidConfig(
                    "poll interval must be non-zero",
                ));
            }
        }
        Ok(())
    }

    /// Backoff untuk percobaan attach ke-`attempt` (mulai dari 0).
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.attach_backoff
            .saturating_mul(factor)
            .min(MAX_ATTACH_BACKOFF)
    }
}
