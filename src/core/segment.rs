//! Named POSIX Shared Memory Segment
//!
//! Lifecycle:
//! - `create`: hanya dipanggil sekali oleh owner, gagal kalau nama sudah ada
//! - `open`: attach ke segment yang sudah ada, ukuran diambil dari `fstat`
//! - `unmap`: melepas view proses ini saja
//! - `destroy`: `shm_unlink`, mapping di proses lain tetap valid
//!
//! Drop hanya melakukan unmap. Nama segment TIDAK pernah di-unlink secara
//! implisit karena proses lain mungkin masih memakainya.

use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{ChannelError, Result};

/// Permission untuk segment baru (owner read/write).
const SEGMENT_MODE: libc::c_uint = 0o600;

/// Batas panjang nama (NAME_MAX).
const MAX_NAME_LEN: usize = 255;

/// Validasi nama sesuai aturan `shm_open`: `/nama`, tanpa `/` lain.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(ChannelError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if !name.starts_with('/') {
        return invalid("must start with '/'");
    }
    if name.len() == 1 {
        return invalid("must not be empty after '/'");
    }
    if name[1..].contains('/') {
        return invalid("must not contain '/' after the first character");
    }
    if name.contains('\0') {
        return invalid("must not contain NUL bytes");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("longer than 255 bytes");
    }
    Ok(())
}

fn c_name(name: &str) -> Result<CString> {
    validate_name(name)?;
    CString::new(name).map_err(|_| ChannelError::InvalidName {
        name: name.to_string(),
        reason: "must not contain NUL bytes",
    })
}

fn shm_open(name: &str, oflag: libc::c_int) -> Result<File> {
    let c_name = c_name(name)?;

    // SAFETY: c_name adalah C string valid selama pemanggilan
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, SEGMENT_MODE) };
    if fd == -1 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ENOENT) => ChannelError::SegmentNotFound {
                name: name.to_string(),
            },
            Some(libc::EEXIST) => ChannelError::SegmentAlreadyExists {
                name: name.to_string(),
            },
            _ => ChannelError::mapping("shm_open", name, err),
        });
    }

    // SAFETY: fd baru saja dibuka dan belum dimiliki siapa pun
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn shm_unlink(name: &str) -> Result<()> {
    let c_name = c_name(name)?;

    // SAFETY: c_name adalah C string valid selama pemanggilan
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ENOENT) => ChannelError::SegmentNotFound {
                name: name.to_string(),
            },
            _ => ChannelError::mapping("shm_unlink", name, err),
        });
    }
    Ok(())
}

fn map(file: &File, name: &str, len: usize) -> Result<MmapMut> {
    // SAFETY: fd menunjuk ke shared memory object dengan ukuran >= len.
    // Isi mapping boleh berubah dari proses lain; semua akses ke isinya
    // lewat atomics atau di bawah mutex yang ada di dalam segment.
    unsafe { MmapOptions::new().len(len).map_mut(file) }
        .map_err(|e| ChannelError::mapping("mmap", name, e))
}

/// Mapping read-write ke satu named shared memory object.
pub struct SharedSegment {
    name: String,
    mmap: MmapMut,
}

impl SharedSegment {
    /// Membuat segment baru berukuran tepat `size` byte, zero-initialized.
    ///
    /// Gagal dengan [`ChannelError::SegmentAlreadyExists`] kalau nama sudah
    /// dipakai. Kalau langkah setelah `shm_open` gagal, nama di-unlink lagi
    /// supaya tidak tertinggal segment setengah jadi.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(ChannelError::InvalidConfig("segment size must be non-zero"));
        }

        let file = shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;

        let mapped = file
            .set_len(size as u64)
            .map_err(|e| ChannelError::mapping("ftruncate", name, e))
            .and_then(|()| map(&file, name, size));

        match mapped {
            Ok(mmap) => {
                tracing::debug!(name, size, "shared segment created");
                Ok(Self {
                    name: name.to_string(),
                    mmap,
                })
            }
            Err(err) => {
                drop(file);
                let _ = shm_unlink(name);
                Err(err)
            }
        }
    }

    /// Attach ke segment yang sudah ada.
    ///
    /// Panjang mapping sama dengan ukuran object saat dibuat. Object dengan
    /// ukuran 0 berarti creator belum sempat `ftruncate`, dilaporkan sebagai
    /// [`ChannelError::SegmentNotReady`].
    pub fn open(name: &str) -> Result<Self> {
        let file = shm_open(name, libc::O_RDWR)?;

        let len = file
            .metadata()
            .map_err(|e| ChannelError::mapping("fstat", name, e))?
            .len() as usize;
        if len == 0 {
            return Err(ChannelError::SegmentNotReady {
                name: name.to_string(),
            });
        }

        let mmap = map(&file, name, len)?;
        tracing::debug!(name, len, "shared segment opened");

        Ok(Self {
            name: name.to_string(),
            mmap,
        })
    }

    /// Cek apakah nama segment masih terdaftar.
    pub fn exists(name: &str) -> Result<bool> {
        match shm_open(name, libc::O_RDONLY) {
            Ok(_) => Ok(true),
            Err(ChannelError::SegmentNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Menghapus nama segment dari namespace sistem.
    ///
    /// Memanggil ulang untuk nama yang sudah dihapus menghasilkan
    /// [`ChannelError::SegmentNotFound`] tanpa efek samping lain.
    pub fn destroy(name: &str) -> Result<()> {
        shm_unlink(name)?;
        tracing::info!(name, "shared segment destroyed");
        Ok(())
    }

    /// Melepas mapping proses ini. Segment tetap ada.
    pub fn unmap(self) {
        drop(self);
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

impl fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("len", &self.mmap.len())
            .finish()
    }
}
