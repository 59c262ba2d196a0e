//! Channel State - layout tetap di dalam shared segment
//!
//! Layout (repr(C), tanpa pointer):
//! ┌─────────────────────────────────────────────────────┐
//! │ magic / layout_version / slot_size (atomics)        │
//! ├─────────────────────────────────────────────────────┤
//! │ mutex │ data_ready condvar │ drained condvar        │
//! ├─────────────────────────────────────────────────────┤
//! │ slots[2][STRING_SIZE] │ visible_index │ reader_count │
//! │ active_consumers │ version   (guarded by mutex)     │
//! └─────────────────────────────────────────────────────┘
//!
//! `magic` ditulis paling akhir (Release) setelah semua primitive di-init,
//! jadi proses yang attach tidak pernah melihat mutex setengah jadi.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::segment::SharedSegment;
use super::sync::{SharedCondvar, SharedMutex, SharedMutexGuard, WaitOutcome};
use crate::error::{ChannelError, Result, StallPhase};

/// Ukuran slot termasuk NUL terminator.
pub const STRING_SIZE: usize = 11;

/// Panjang payload maksimum.
pub const PAYLOAD_CAPACITY: usize = STRING_SIZE - 1;

/// Flip-flop: selalu dua slot.
pub const SLOT_COUNT: usize = 2;

const MAGIC: u64 = 0x464C_4950_464C_4F50; // "FLIPFLOP" in hex
const LAYOUT_VERSION: u32 = 1;

/// Payload disimpan seperti C string: NUL menandai akhir isi, jadi NUL di
/// tengah payload akan memotongnya saat dibaca.
pub fn validate_payload(payload: &[u8]) -> Result<()> {
    if payload.len() > PAYLOAD_CAPACITY {
        return Err(ChannelError::PayloadTooLarge {
            len: payload.len(),
            capacity: PAYLOAD_CAPACITY,
        });
    }
    if let Some(position) = payload.iter().position(|&b| b == 0) {
        return Err(ChannelError::PayloadContainsNul { position });
    }
    Ok(())
}

/// Isi satu slot, fixed-width.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Payload {
    bytes: [u8; STRING_SIZE],
}

impl Payload {
    pub const fn from_raw(bytes: [u8; STRING_SIZE]) -> Self {
        Self { bytes }
    }

    /// Seluruh slot, termasuk padding NUL.
    #[inline(always)]
    pub fn raw(&self) -> &[u8; STRING_SIZE] {
        &self.bytes
    }

    /// Byte sampai NUL pertama.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(STRING_SIZE);
        &self.bytes[..end]
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()).ok()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Hasil satu langkah publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub version: u64,
    /// Slot yang ditulis (= visible_index setelah publish).
    pub slot: usize,
    /// True kalau visible_index berpindah pada publish ini.
    pub flipped: bool,
}

/// Salinan field yang dijaga mutex, untuk observasi.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub visible_index: usize,
    pub version: u64,
    pub reader_count: u32,
    pub active_consumers: u32,
}

/// Field yang hanya boleh disentuh sambil memegang mutex.
///
/// Semua langkah protokol ada di sini sebagai method biasa; pemanggil yang
/// bertanggung jawab memegang lock.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct ChannelFields {
    slots: [[u8; STRING_SIZE]; SLOT_COUNT],
    visible_index: u32,
    reader_count: u32,
    active_consumers: u32,
    version: u64,
}

impl ChannelFields {
    pub fn new(active_consumers: u32) -> Self {
        Self {
            slots: [[0; STRING_SIZE]; SLOT_COUNT],
            visible_index: 0,
            reader_count: 0,
            active_consumers,
            version: 0,
        }
    }

    #[inline(always)]
    pub fn visible_index(&self) -> usize {
        self.visible_index as usize
    }

    #[inline(always)]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline(always)]
    pub fn reader_count(&self) -> u32 {
        self.reader_count
    }

    #[inline(always)]
    pub fn active_consumers(&self) -> u32 {
        self.active_consumers
    }

    /// Semua consumer sudah ack versi sekarang. Sebelum publish pertama
    /// belum ada yang perlu dibaca, jadi channel dianggap drained.
    #[inline(always)]
    pub fn is_drained(&self) -> bool {
        self.version == 0 || self.reader_count >= self.active_consumers
    }

    /// Publish berikutnya pindah slot: ada versi sebelumnya dan semua
    /// consumer sudah membacanya.
    #[inline(always)]
    pub fn should_flip(&self) -> bool {
        self.version > 0 && self.reader_count >= self.active_consumers
    }

    /// Satu-satunya tempat visible_index berubah.
    fn flip(&mut self) {
        debug_assert!(self.should_flip(), "flip before drain");
        self.visible_index = 1 - (self.visible_index & 1);
        self.reader_count = 0;
    }

    /// MaybeFlip + Write + version bump.
    ///
    /// Payload yang tidak valid ditolak sebelum state disentuh. Kalau versi
    /// sekarang belum dibaca semua consumer, slot yang terlihat tidak boleh
    /// ditimpa: hasilnya [`ChannelError::ProtocolStall`] fase `Drain`
    /// dengan `waited` nol, dan state tetap sama.
    pub fn publish(&mut self, payload: &[u8]) -> Result<PublishReport> {
        validate_payload(payload)?;

        if !self.is_drained() {
            return Err(ChannelError::ProtocolStall {
                phase: StallPhase::Drain,
                waited: Duration::ZERO,
            });
        }

        let flipped = self.should_flip();
        if flipped {
            self.flip();
        }

        let slot = self.visible_index();
        let dst = &mut self.slots[slot];
        dst[..payload.len()].copy_from_slice(payload);
        dst[payload.len()..].fill(0);

        self.version += 1;

        Ok(PublishReport {
            version: self.version,
            slot,
            flipped,
        })
    }

    #[inline]
    pub fn read_visible(&self) -> Payload {
        Payload::from_raw(self.slots[self.visible_index()])
    }

    /// Catat satu consumer selesai membaca versi sekarang.
    ///
    /// Returns true kalau channel sekarang drained. reader_count tidak pernah
    /// melebihi active_consumers.
    pub fn acknowledge(&mut self) -> bool {
        if self.reader_count < self.active_consumers {
            self.reader_count += 1;
        }
        self.is_drained()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            visible_index: self.visible_index(),
            version: self.version,
            reader_count: self.reader_count,
            active_consumers: self.active_consumers,
        }
    }
}

/// Struktur lengkap yang hidup di shared memory.
#[repr(C, align(64))]
pub struct ChannelState {
    magic: AtomicU64,
    layout_version: AtomicU32,
    slot_size: AtomicU32,
    mutex: SharedMutex,
    data_ready: SharedCondvar,
    drained: SharedCondvar,
    fields: UnsafeCell<ChannelFields>,
}

// SAFETY: `fields` hanya diakses lewat StateGuard (mutex dipegang),
// sisanya atomics dan pthread primitives
unsafe impl Sync for ChannelState {}
unsafe impl Send for ChannelState {}

/// Ukuran segment yang dibutuhkan satu channel.
pub const STATE_SIZE: usize = mem::size_of::<ChannelState>();

impl ChannelState {
    /// Inisialisasi state in-place.
    ///
    /// # Safety
    /// `ptr` harus valid, aligned, zeroed, dan belum terlihat oleh proses
    /// lain sebagai ter-init (magic masih 0).
    pub unsafe fn initialize(ptr: *mut ChannelState, active_consumers: u32) -> Result<()> {
        addr_of_mut!((*ptr).fields).write(UnsafeCell::new(ChannelFields::new(active_consumers)));
        SharedMutex::init(addr_of_mut!((*ptr).mutex))?;
        SharedCondvar::init(addr_of_mut!((*ptr).data_ready))?;
        SharedCondvar::init(addr_of_mut!((*ptr).drained))?;

        let state = &*ptr;
        state.layout_version.store(LAYOUT_VERSION, Ordering::Relaxed);
        state.slot_size.store(STRING_SIZE as u32, Ordering::Relaxed);
        // Publish terakhir: semua write di atas visible sebelum magic
        state.magic.store(MAGIC, Ordering::Release);
        Ok(())
    }

    /// Cek header sebelum state dipakai.
    pub fn validate(&self, name: &str) -> Result<()> {
        let mismatch = |reason: String| ChannelError::LayoutMismatch {
            name: name.to_string(),
            reason,
        };

        match self.magic.load(Ordering::Acquire) {
            0 => {
                return Err(ChannelError::SegmentNotReady {
                    name: name.to_string(),
                })
            }
            MAGIC => {}
            other => return Err(mismatch(format!("bad magic 0x{:016X}", other))),
        }

        let layout = self.layout_version.load(Ordering::Relaxed);
        if layout != LAYOUT_VERSION {
            return Err(mismatch(format!(
                "layout version {} (expected {})",
                layout, LAYOUT_VERSION
            )));
        }

        let slot_size = self.slot_size.load(Ordering::Relaxed);
        if slot_size as usize != STRING_SIZE {
            return Err(mismatch(format!(
                "slot size {} (expected {})",
                slot_size, STRING_SIZE
            )));
        }
        Ok(())
    }

    /// Acquire mutex dan kembalikan akses ke field yang dijaga.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<StateGuard<'_>> {
        let guard = self.mutex.lock(timeout)?;
        Ok(StateGuard {
            guard,
            state: self,
        })
    }
}

/// Akses eksklusif ke [`ChannelFields`] selama mutex dipegang.
pub struct StateGuard<'a> {
    guard: SharedMutexGuard<'a>,
    state: &'a ChannelState,
}

impl StateGuard<'_> {
    /// Tunggu broadcast `data_ready`. `None` = tanpa batas.
    pub fn wait_data_ready(&mut self, deadline: Option<&libc::timespec>) -> Result<WaitOutcome> {
        wait_on(&self.state.data_ready, &mut self.guard, deadline)
    }

    /// Tunggu broadcast `drained`. `None` = tanpa batas.
    pub fn wait_drained(&mut self, deadline: Option<&libc::timespec>) -> Result<WaitOutcome> {
        wait_on(&self.state.drained, &mut self.guard, deadline)
    }

    pub fn notify_data_ready(&self) -> Result<()> {
        self.state.data_ready.broadcast()
    }

    pub fn notify_drained(&self) -> Result<()> {
        self.state.drained.broadcast()
    }
}

fn wait_on(
    cond: &SharedCondvar,
    guard: &mut SharedMutexGuard<'_>,
    deadline: Option<&libc::timespec>,
) -> Result<WaitOutcome> {
    match deadline {
        Some(deadline) => cond.wait_until(guard, deadline),
        None => cond.wait(guard).map(|()| WaitOutcome::Notified),
    }
}

impl Deref for StateGuard<'_> {
    type Target = ChannelFields;

    fn deref(&self) -> &ChannelFields {
        // SAFETY: mutex dipegang selama guard hidup
        unsafe { &*self.state.fields.get() }
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut ChannelFields {
        // SAFETY: mutex dipegang selama guard hidup, dan &mut self mencegah
        // alias lain dari guard yang sama
        unsafe { &mut *self.state.fields.get() }
    }
}

/// Unmap lalu unlink segment yang init-nya gagal. Error unlink hanya
/// di-log; error init yang asli tetap yang dikembalikan ke caller.
fn discard_half_initialized(segment: SharedSegment) {
    let name = segment.name().to_string();
    segment.unmap();
    if let Err(err) = SharedSegment::destroy(&name) {
        tracing::warn!(name = %name, %err, "failed to remove half-initialized segment");
    }
}

/// SharedSegment yang sudah tervalidasi berisi satu [`ChannelState`].
#[derive(Debug)]
pub struct ChannelMapping {
    segment: SharedSegment,
}

impl ChannelMapping {
    /// Buat segment baru dan inisialisasi state-nya. Hanya untuk owner.
    pub fn create(name: &str, active_consumers: u32) -> Result<Self> {
        let mut segment = SharedSegment::create(name, STATE_SIZE)?;
        let ptr = segment.as_mut_ptr() as *mut ChannelState;

        // SAFETY: segment baru (O_EXCL), zero-filled, page-aligned, ukuran STATE_SIZE
        if let Err(err) = unsafe { ChannelState::initialize(ptr, active_consumers) } {
            discard_half_initialized(segment);
            return Err(err);
        }

        tracing::info!(name, active_consumers, size = STATE_SIZE, "channel state initialized");
        Ok(Self { segment })
    }

    /// Attach ke channel yang sudah di-init. Tidak pernah menyentuh primitive.
    pub fn open(name: &str) -> Result<Self> {
        let segment = SharedSegment::open(name)?;
        if segment.len() != STATE_SIZE {
            return Err(ChannelError::LayoutMismatch {
                name: name.to_string(),
                reason: format!("segment is {} bytes (expected {})", segment.len(), STATE_SIZE),
            });
        }

        let mapping = Self { segment };
        mapping.state().validate(name)?;
        Ok(mapping)
    }

    #[inline(always)]
    pub fn state(&self) -> &ChannelState {
        // SAFETY: ukuran sudah dicek, mmap page-aligned; isi dibaca lewat
        // atomics / mutex saja
        unsafe { &*(self.segment.as_ptr() as *const ChannelState) }
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    pub fn unmap(self) {
        self.segment.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_name;

    #[test]
    fn test_first_publish_writes_slot_zero_without_flip() {
        let mut fields = ChannelFields::new(2);
        let report = fields.publish(b"AAAAAAAAAA").unwrap();

        assert_eq!(
            report,
            PublishReport {
                version: 1,
                slot: 0,
                flipped: false
            }
        );
        assert_eq!(fields.read_visible().as_bytes(), b"AAAAAAAAAA");
        assert_eq!(fields.reader_count(), 0);
    }

    #[test]
    fn test_flip_only_after_all_acks() {
        let mut fields = ChannelFields::new(2);
        fields.publish(b"AAAAAAAAAA").unwrap();

        assert!(!fields.acknowledge());
        assert!(!fields.should_flip());

        // Hanya satu ack: slot yang terlihat tidak boleh ditimpa
        let before = fields.snapshot();
        assert!(matches!(
            fields.publish(b"CCCCCCCCCC"),
            Err(ChannelError::ProtocolStall {
                phase: StallPhase::Drain,
                ..
            })
        ));
        assert_eq!(fields.snapshot(), before);
        assert_eq!(fields.read_visible().as_bytes(), b"AAAAAAAAAA");

        assert!(fields.acknowledge());
        let report = fields.publish(b"BBBBBBBBBB").unwrap();
        assert_eq!(
            report,
            PublishReport {
                version: 2,
                slot: 1,
                flipped: true
            }
        );
        assert_eq!(fields.reader_count(), 0);
        assert_eq!(fields.read_visible().as_bytes(), b"BBBBBBBBBB");
    }

    #[test]
    fn test_fresh_channel_counts_as_drained() {
        let fields = ChannelFields::new(3);
        assert!(fields.is_drained());
        assert!(!fields.should_flip());
    }

    #[test]
    fn test_payload_with_nul_rejected() {
        let mut fields = ChannelFields::new(1);
        let err = fields.publish(&0u64.to_le_bytes()).unwrap_err();
        assert!(matches!(err, ChannelError::PayloadContainsNul { position: 0 }));

        let err = fields.publish(b"ab\0cd").unwrap_err();
        assert!(matches!(err, ChannelError::PayloadContainsNul { position: 2 }));
        assert_eq!(fields.version(), 0);
    }

    #[test]
    fn test_slots_alternate() {
        let mut fields = ChannelFields::new(1);
        let mut slots = Vec::new();
        for i in 0..6u8 {
            let report = fields.publish(&[b'a' + i; 4]).unwrap();
            slots.push(report.slot);
            fields.acknowledge();
        }
        assert_eq!(slots, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(fields.version(), 6);
    }

    #[test]
    fn test_ack_is_clamped() {
        let mut fields = ChannelFields::new(2);
        fields.publish(b"x").unwrap();
        fields.acknowledge();
        fields.acknowledge();
        assert!(fields.acknowledge());
        assert_eq!(fields.reader_count(), 2);
    }

    #[test]
    fn test_payload_too_large_leaves_state_untouched() {
        let mut fields = ChannelFields::new(1);
        fields.publish(b"first").unwrap();
        fields.acknowledge();
        let before = fields.snapshot();

        let err = fields.publish(b"01234567890").unwrap_err();
        assert!(matches!(
            err,
            ChannelError::PayloadTooLarge {
                len: 11,
                capacity: PAYLOAD_CAPACITY
            }
        ));
        assert_eq!(fields.snapshot(), before);
    }

    #[test]
    fn test_shorter_payload_clears_tail() {
        let mut fields = ChannelFields::new(1);
        fields.publish(b"LONGPAYLOA").unwrap();
        fields.acknowledge();
        fields.publish(b"xy").unwrap();
        fields.acknowledge();
        // Kembali ke slot 0 yang tadinya berisi payload panjang
        let report = fields.publish(b"ab").unwrap();
        assert_eq!(report.slot, 0);

        let payload = fields.read_visible();
        assert_eq!(payload.as_bytes(), b"ab");
        assert!(payload.raw()[2..].iter().all(|&b| b == 0));
        assert_eq!(payload.as_str(), Some("ab"));
    }

    #[test]
    fn test_mapping_create_and_open() {
        let name = test_name("state-open");

        let owner = ChannelMapping::create(&name, 3).unwrap();
        let attached = ChannelMapping::open(&name).unwrap();

        {
            let mut guard = owner.state().lock(None).unwrap();
            guard.publish(b"hello").unwrap();
        }
        {
            let guard = attached.state().lock(None).unwrap();
            assert_eq!(guard.version(), 1);
            assert_eq!(guard.active_consumers(), 3);
            assert_eq!(guard.read_visible().as_bytes(), b"hello");
        }

        attached.unmap();
        owner.unmap();
        SharedSegment::destroy(&name).unwrap();
    }

    #[test]
    fn test_open_uninitialized_segment_is_not_ready() {
        let name = test_name("state-notready");
        let raw = SharedSegment::create(&name, STATE_SIZE).unwrap();

        assert!(matches!(
            ChannelMapping::open(&name),
            Err(ChannelError::SegmentNotReady { .. })
        ));

        raw.unmap();
        SharedSegment::destroy(&name).unwrap();
    }

    #[test]
    fn test_open_wrong_size_is_layout_mismatch() {
        let name = test_name("state-size");
        let raw = SharedSegment::create(&name, 16).unwrap();

        assert!(matches!(
            ChannelMapping::open(&name),
            Err(ChannelError::LayoutMismatch { .. })
        ));

        raw.unmap();
        SharedSegment::destroy(&name).unwrap();
    }

    #[test]
    fn test_discard_half_initialized_removes_name() {
        let name = test_name("state-discard");
        let raw = SharedSegment::create(&name, STATE_SIZE).unwrap();
        discard_half_initialized(raw);
        assert!(!SharedSegment::exists(&name).unwrap());

        // Nama sudah hilang (mis. dihapus proses cleanup): hanya warning
        let raw = SharedSegment::create(&name, STATE_SIZE).unwrap();
        SharedSegment::destroy(&name).unwrap();
        discard_half_initialized(raw);
        assert!(!SharedSegment::exists(&name).unwrap());
    }

    #[test]
    fn test_open_bad_magic_is_layout_mismatch() {
        let name = test_name("state-magic");
        let mut raw = SharedSegment::create(&name, STATE_SIZE).unwrap();
        unsafe { (raw.as_mut_ptr() as *mut u64).write(0xDEAD_BEEF) };

        assert!(matches!(
            ChannelMapping::open(&name),
            Err(ChannelError::LayoutMismatch { .. })
        ));

        raw.unmap();
        SharedSegment::destroy(&name).unwrap();
    }
}
