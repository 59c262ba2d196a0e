//! Error taxonomy untuk flip-flop channel
//!
//! Semua operasi publik mengembalikan [`Result`]. Kegagalan mutex/condvar
//! selalu fatal: artinya segment korup atau peer mati di tengah critical
//! section, jadi tidak pernah di-retry otomatis.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias untuk semua operasi channel.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Fase protokol yang bisa macet (stall).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPhase {
    /// Menunggu mutex di shared segment
    Lock,
    /// Producer menunggu semua consumer selesai membaca
    Drain,
    /// Consumer menunggu versi baru
    Version,
}

impl fmt::Display for StallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StallPhase::Lock => "mutex acquisition",
            StallPhase::Drain => "drain wait",
            StallPhase::Version => "version wait",
        };
        f.write_str(s)
    }
}

/// Errors produced by the segment manager, the sync primitives and the
/// producer/consumer controllers.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Nama segment tidak memenuhi aturan POSIX `shm_open`.
    #[error("invalid shared memory name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Konfigurasi channel tidak valid.
    #[error("invalid channel config: {0}")]
    InvalidConfig(&'static str),

    /// Segment belum dibuat (atau sudah di-destroy).
    #[error("shared memory segment `{name}` not found")]
    SegmentNotFound { name: String },

    /// Segment dengan nama ini sudah ada, kemungkinan sisa run sebelumnya.
    #[error("shared memory segment `{name}` already exists")]
    SegmentAlreadyExists { name: String },

    /// Segment ada tapi creator belum selesai inisialisasi.
    #[error("shared memory segment `{name}` is not initialized yet")]
    SegmentNotReady { name: String },

    /// `shm_open`, `ftruncate`, `fstat` atau `mmap` gagal.
    #[error("{op} failed for `{name}`: {source}")]
    MappingFailure {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    /// Segment ada tapi layout-nya bukan milik versi crate ini.
    #[error("shared memory segment `{name}` has an incompatible layout: {reason}")]
    LayoutMismatch { name: String, reason: String },

    /// Payload lebih besar dari kapasitas slot.
    #[error("payload of {len} bytes exceeds slot capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    /// Payload berisi NUL; slot dibaca sampai NUL pertama.
    #[error("payload contains a NUL byte at offset {position}")]
    PayloadContainsNul { position: usize },

    /// Peer tidak membuat progress dalam batas waktu.
    #[error("protocol stall during {phase} after {waited:?}")]
    ProtocolStall { phase: StallPhase, waited: Duration },

    /// Pemegang mutex mati di dalam critical section.
    #[error("a peer died while holding the channel mutex; shared state is unrecoverable")]
    PeerDied,

    /// pthread call returned an unexpected error code.
    #[error("{op} failed with code {code}")]
    Sync { op: &'static str, code: i32 },
}

impl ChannelError {
    pub(crate) fn mapping(op: &'static str, name: &str, source: io::Error) -> Self {
        Self::MappingFailure {
            op,
            name: name.to_string(),
            source,
        }
    }

    /// True untuk kondisi sementara yang boleh di-retry oleh caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SegmentNotFound { .. } | Self::SegmentNotReady { .. } | Self::ProtocolStall { .. }
        )
    }

    /// True kalau channel tidak bisa dipakai lagi.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MappingFailure { .. }
                | Self::LayoutMismatch { .. }
                | Self::PeerDied
                | Self::Sync { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let stall = ChannelError::ProtocolStall {
            phase: StallPhase::Drain,
            waited: Duration::from_millis(10),
        };
        assert!(stall.is_retryable());
        assert!(!stall.is_fatal());

        let missing = ChannelError::SegmentNotFound {
            name: "/x".to_string(),
        };
        assert!(missing.is_retryable());

        assert!(ChannelError::PeerDied.is_fatal());
        assert!(ChannelError::Sync {
            op: "pthread_mutex_lock",
            code: 22
        }
        .is_fatal());
        assert!(!ChannelError::SegmentAlreadyExists {
            name: "/x".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ChannelError::ProtocolStall {
            phase: StallPhase::Version,
            waited: Duration::from_millis(5),
        };
        assert_eq!(err.to_string(), "protocol stall during version wait after 5ms");

        let nul = ChannelError::PayloadContainsNul { position: 3 };
        assert_eq!(nul.to_string(), "payload contains a NUL byte at offset 3");
        assert!(!nul.is_retryable());
        assert!(!nul.is_fatal());
    }
}
