//! Producer Controller
//!
//! State machine per iterasi:
//! `Idle → Locked → WaitForDrain → (MaybeFlip) → Write → Publish → Idle`
//!
//! Publish selalu menunggu drain versi sebelumnya dulu, di critical section
//! yang sama dengan Write. Slot yang terlihat tidak pernah ditimpa sebelum
//! semua consumer membacanya, dan consumer tidak pernah melihat slot yang
//! setengah ditulis.

use std::thread;
use std::time::{Duration, Instant};

use crate::channel::attach_mapping;
use crate::config::{ChannelConfig, DrainStrategy};
use crate::core::{
    deadline_after, validate_payload, ChannelMapping, ChannelSnapshot, PublishReport, StateGuard,
    WaitOutcome, COND_CLOCK,
};
use crate::error::{ChannelError, Result, StallPhase};

/// Satu-satunya penulis channel. Tidak `Clone`.
#[derive(Debug)]
pub struct Producer {
    mapping: ChannelMapping,
    config: ChannelConfig,
}

impl Producer {
    /// Attach ke channel yang sudah dibuat [`ChannelOwner`](crate::ChannelOwner).
    pub fn attach(config: ChannelConfig) -> Result<Self> {
        let mapping = attach_mapping(&config, "producer")?;
        Ok(Self { mapping, config })
    }

    /// Locked → WaitForDrain → MaybeFlip → Write → Publish.
    ///
    /// Kalau versi sebelumnya belum dibaca semua consumer, tunggu dulu sesuai
    /// `drain` dan `drain_timeout` dari config. Kalau lewat batas waktu,
    /// [`ChannelError::ProtocolStall`] fase `Drain` dikembalikan dan tidak
    /// ada yang ditulis.
    pub fn publish(&mut self, payload: &[u8]) -> Result<PublishReport> {
        validate_payload(payload)?;
        let mut guard = self.lock_drained()?;

        tracing::trace!(
            reader_count = guard.reader_count(),
            active_consumers = guard.active_consumers(),
            visible_index = guard.visible_index(),
            version = guard.version(),
            "producer locked"
        );

        let report = guard.publish(payload)?;
        if report.flipped {
            tracing::debug!(slot = report.slot, "all consumers read, flipped visible slot");
        }

        guard.notify_data_ready()?;
        drop(guard);

        tracing::debug!(
            version = report.version,
            slot = report.slot,
            payload = %String::from_utf8_lossy(payload),
            "published"
        );
        Ok(report)
    }

    /// Tunggu sampai semua consumer membaca versi sekarang.
    ///
    /// Channel yang belum pernah di-publish langsung dianggap drained.
    /// Dibatasi `drain_timeout`; kalau lewat, [`ChannelError::ProtocolStall`]
    /// dikembalikan dan state channel tidak berubah.
    pub fn wait_for_drain(&mut self) -> Result<()> {
        let guard = self.lock_drained()?;
        tracing::trace!(reader_count = guard.reader_count(), "channel drained");
        Ok(())
    }

    /// Satu iterasi penuh loop producer.
    pub fn publish_and_drain(&mut self, payload: &[u8]) -> Result<PublishReport> {
        let report = self.publish(payload)?;
        self.wait_for_drain()?;
        Ok(report)
    }

    /// Kembalikan guard yang dipegang saat channel sudah drained.
    fn lock_drained(&self) -> Result<StateGuard<'_>> {
        match self.config.drain {
            DrainStrategy::Signal => self.lock_drained_signal(),
            DrainStrategy::Poll { interval } => self.lock_drained_poll(interval),
        }
    }

    fn lock_drained_signal(&self) -> Result<StateGuard<'_>> {
        let started = Instant::now();
        let deadline = self
            .config
            .drain_timeout
            .map(|timeout| deadline_after(COND_CLOCK, timeout))
            .transpose()?;

        let mut guard = self.mapping.state().lock(self.config.lock_timeout)?;
        while !guard.is_drained() {
            let outcome = guard.wait_drained(deadline.as_ref())?;
            if outcome == WaitOutcome::TimedOut && !guard.is_drained() {
                return Err(ChannelError::ProtocolStall {
                    phase: StallPhase::Drain,
                    waited: started.elapsed(),
                });
            }
        }
        Ok(guard)
    }

    fn lock_drained_poll(&self, interval: Duration) -> Result<StateGuard<'_>> {
        let started = Instant::now();

        loop {
            let guard = self.mapping.state().lock(self.config.lock_timeout)?;
            tracing::trace!(
                reader_count = guard.reader_count(),
                expected = guard.active_consumers(),
                "checking drain"
            );
            if guard.is_drained() {
                return Ok(guard);
            }
            drop(guard);

            if let Some(timeout) = self.config.drain_timeout {
                if started.elapsed() >= timeout {
                    return Err(ChannelError::ProtocolStall {
                        phase: StallPhase::Drain,
                        waited: started.elapsed(),
                    });
                }
            }

            // Hindari tight loop
            thread::sleep(interval);
        }
    }

    pub fn snapshot(&self) -> Result<ChannelSnapshot> {
        let guard = self.mapping.state().lock(self.config.lock_timeout)?;
        Ok(guard.snapshot())
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        self.mapping.name()
    }

    /// Lepas mapping producer.
    pub fn detach(self) {
        self.mapping.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOwner;
    use crate::core::test_name;

    #[test]
    fn test_producer_attach_missing_gives_up() {
        let name = test_name("producer-missing");
        let config = ChannelConfig::new(&name).with_attach_retry(3, Duration::from_millis(1));
        assert!(matches!(
            Producer::attach(config),
            Err(ChannelError::SegmentNotFound { .. })
        ));
    }

    #[test]
    fn test_drain_stall_without_consumers() {
        for drain in [
            DrainStrategy::Signal,
            DrainStrategy::Poll {
                interval: Duration::from_millis(2),
            },
        ] {
            let name = test_name("producer-stall");
            let config = ChannelConfig::new(&name)
                .with_consumers(1)
                .with_drain(drain)
                .with_drain_timeout(Some(Duration::from_millis(30)));
            let owner = ChannelOwner::create(config).unwrap();
            let mut producer = owner.producer().unwrap();

            let report = producer.publish(b"lonely").unwrap();
            assert_eq!(report.version, 1);

            let started = Instant::now();
            assert!(matches!(
                producer.wait_for_drain(),
                Err(ChannelError::ProtocolStall {
                    phase: StallPhase::Drain,
                    ..
                })
            ));
            assert!(started.elapsed() >= Duration::from_millis(25));

            // Publish berikutnya juga menunggu drain, lalu menyerah tanpa
            // menimpa slot
            assert!(matches!(
                producer.publish(b"overwrite"),
                Err(ChannelError::ProtocolStall {
                    phase: StallPhase::Drain,
                    ..
                })
            ));

            // Stall tidak mengubah state
            let snapshot = producer.snapshot().unwrap();
            assert_eq!(snapshot.version, 1);
            assert_eq!(snapshot.visible_index, 0);
            assert_eq!(snapshot.reader_count, 0);

            producer.detach();
            owner.destroy().unwrap();
        }
    }

    #[test]
    fn test_wait_for_drain_before_first_publish() {
        let name = test_name("producer-fresh");
        let config = ChannelConfig::new(&name)
            .with_consumers(2)
            .with_drain_timeout(Some(Duration::from_secs(5)));
        let owner = ChannelOwner::create(config).unwrap();
        let mut producer = owner.producer().unwrap();

        let started = Instant::now();
        producer.wait_for_drain().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        producer.detach();
        owner.destroy().unwrap();
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let name = test_name("producer-large");
        let owner = ChannelOwner::create(ChannelConfig::new(&name)).unwrap();
        let mut producer = owner.producer().unwrap();

        assert!(matches!(
            producer.publish(b"this payload is too long"),
            Err(ChannelError::PayloadTooLarge { .. })
        ));
        assert!(matches!(
            producer.publish(b"a\0b"),
            Err(ChannelError::PayloadContainsNul { position: 1 })
        ));
        assert_eq!(producer.snapshot().unwrap().version, 0);

        owner.destroy().unwrap();
    }
}
