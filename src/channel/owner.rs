//! Designated owner: satu-satunya pihak yang create/destroy segment.

use crate::channel::Producer;
use crate::config::ChannelConfig;
use crate::core::{validate_name, ChannelMapping, ChannelSnapshot, SharedSegment};
use crate::error::{ChannelError, Result};

/// Pemilik segment channel.
///
/// Drop hanya melepas mapping milik owner; nama segment tetap ada sampai
/// [`destroy`](Self::destroy) atau [`destroy_by_name`](Self::destroy_by_name)
/// dipanggil secara eksplisit.
#[derive(Debug)]
pub struct ChannelOwner {
    mapping: ChannelMapping,
    config: ChannelConfig,
}

impl ChannelOwner {
    /// Buat segment baru dan inisialisasi mutex/condvar di dalamnya.
    ///
    /// Gagal dengan [`ChannelError::SegmentAlreadyExists`] kalau ada segment
    /// sisa run sebelumnya; pakai [`replace`](Self::replace) untuk
    /// menghapus lalu membuat ulang.
    pub fn create(config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        let mapping = ChannelMapping::create(&config.name, config.active_consumers)?;
        Ok(Self { mapping, config })
    }

    /// Hapus segment lama (kalau ada) lalu buat baru.
    pub fn replace(config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        match SharedSegment::destroy(&config.name) {
            Ok(()) => tracing::warn!(name = %config.name, "removed stale channel segment"),
            Err(ChannelError::SegmentNotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        Self::create(config)
    }

    /// Attach producer baru (mapping terpisah) ke channel ini.
    pub fn producer(&self) -> Result<Producer> {
        Producer::attach(self.config.clone())
    }

    pub fn snapshot(&self) -> Result<ChannelSnapshot> {
        let guard = self.mapping.state().lock(self.config.lock_timeout)?;
        Ok(guard.snapshot())
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        self.mapping.name()
    }

    #[inline(always)]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Unmap lalu hapus nama segment. Proses lain yang masih attach tetap
    /// bisa memakai mapping-nya sampai mereka unmap.
    pub fn destroy(self) -> Result<()> {
        let Self { mapping, config } = self;
        mapping.unmap();
        SharedSegment::destroy(&config.name)
    }

    /// Teardown berdasarkan nama saja (proses cleanup terpisah).
    pub fn destroy_by_name(name: &str) -> Result<()> {
        validate_name(name)?;
        SharedSegment::destroy(name)
    }
}
