//! Consumer Controller
//!
//! State machine: `Idle → Locked → WaitVersion → Read → Ack → Idle`
//!
//! Read dan Ack terjadi dalam satu critical section, jadi flip dari producer
//! tidak bisa menyela di antara membaca `visible_index` dan isi slot.
//! Semantik most-recent-value: versi yang terlewat tidak dikirim ulang.

use std::time::{Duration, Instant};

use crate::channel::attach_mapping;
use crate::config::ChannelConfig;
use crate::core::{deadline_after, ChannelMapping, Payload, StateGuard, WaitOutcome, COND_CLOCK};
use crate::error::{ChannelError, Result, StallPhase};

/// Satu pesan yang diterima consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub version: u64,
    pub slot: usize,
    pub payload: Payload,
}

/// Pembaca channel. Setiap proses/thread consumer punya instance sendiri.
#[derive(Debug)]
pub struct Consumer {
    mapping: ChannelMapping,
    config: ChannelConfig,
    last_seen_version: u64,
}

impl Consumer {
    /// Attach dengan retry sampai `attach_attempts` habis.
    pub fn attach(config: ChannelConfig) -> Result<Self> {
        let mapping = attach_mapping(&config, "consumer")?;
        Ok(Self {
            mapping,
            config,
            last_seen_version: 0,
        })
    }

    /// Blok sampai ada versi lebih baru dari yang terakhir dilihat,
    /// dibatasi `version_timeout` dari config.
    pub fn recv(&mut self) -> Result<Received> {
        self.recv_inner(self.config.version_timeout)
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Received> {
        self.recv_inner(Some(timeout))
    }

    /// Non-blocking: `Ok(None)` kalau belum ada versi baru.
    pub fn try_recv(&mut self) -> Result<Option<Received>> {
        let mut guard = self.mapping.state().lock(self.config.lock_timeout)?;
        if guard.version() == self.last_seen_version {
            return Ok(None);
        }
        read_and_ack(&mut guard, &mut self.last_seen_version).map(Some)
    }

    fn recv_inner(&mut self, timeout: Option<Duration>) -> Result<Received> {
        let started = Instant::now();
        let deadline = timeout
            .map(|timeout| deadline_after(COND_CLOCK, timeout))
            .transpose()?;

        let mut guard = self.mapping.state().lock(self.config.lock_timeout)?;
        tracing::trace!(
            last_seen = self.last_seen_version,
            current = guard.version(),
            "waiting for new version"
        );

        // Predicate selalu dicek ulang: spurious wakeup dan broadcast ke
        // banyak consumer sekaligus
        while guard.version() == self.last_seen_version {
            let outcome = guard.wait_data_ready(deadline.as_ref())?;
            if outcome == WaitOutcome::TimedOut && guard.version() == self.last_seen_version {
                return Err(ChannelError::ProtocolStall {
                    phase: StallPhase::Version,
                    waited: started.elapsed(),
                });
            }
        }

        read_and_ack(&mut guard, &mut self.last_seen_version)
    }

    #[inline(always)]
    pub fn last_seen_version(&self) -> u64 {
        self.last_seen_version
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        self.mapping.name()
    }

    pub fn detach(self) {
        self.mapping.unmap();
    }
}

/// Read + Ack, dipanggil dengan mutex masih dipegang.
fn read_and_ack(guard: &mut StateGuard<'_>, last_seen: &mut u64) -> Result<Received> {
    let received = Received {
        version: guard.version(),
        slot: guard.visible_index(),
        payload: guard.read_visible(),
    };
    *last_seen = received.version;

    if guard.acknowledge() {
        guard.notify_drained()?;
    }

    tracing::debug!(
        version = received.version,
        slot = received.slot,
        payload = %received.payload,
        reader_count = guard.reader_count(),
        "consumer read"
    );
    Ok(received)
}
