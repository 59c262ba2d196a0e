//! Cross-Process Mutex & Condition Variable
//!
//! Wrapper tipis di atas `pthread_mutex_t` / `pthread_cond_t` dengan atribut
//! `PTHREAD_PROCESS_SHARED`, supaya bisa diletakkan langsung di shared memory
//! dan dipakai oleh proses yang tidak saling berhubungan.
//!
//! Di Linux mutex dibuat robust: kalau pemegang lock mati, locker berikutnya
//! mendapat [`ChannelError::PeerDied`] alih-alih blok selamanya. State tidak
//! dipulihkan; mutex sengaja dibiarkan unrecoverable.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::time::Duration;

use crate::error::{ChannelError, Result, StallPhase};

/// Clock yang dipakai condvar (harus sama dengan clock untuk deadline).
#[cfg(target_os = "linux")]
pub const COND_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
pub const COND_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

/// Hasil wait dengan deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
}

#[inline]
fn check(op: &'static str, code: libc::c_int) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(ChannelError::Sync { op, code })
    }
}

/// Deadline absolut `timeout` dari sekarang pada `clock`.
pub fn deadline_after(clock: libc::clockid_t, timeout: Duration) -> Result<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();

    // SAFETY: clock_gettime menulis ke pointer yang valid
    if unsafe { libc::clock_gettime(clock, now.as_mut_ptr()) } != 0 {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
        return Err(ChannelError::Sync {
            op: "clock_gettime",
            code,
        });
    }
    // SAFETY: clock_gettime sukses
    let now = unsafe { now.assume_init() };

    // Timeout raksasa (mis. Duration::MAX) di-clamp, bukan wrap ke negatif
    let timeout_sec = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
    let mut sec = i64::from(now.tv_sec).saturating_add(timeout_sec);
    let mut nsec = i64::from(now.tv_nsec) + i64::from(timeout.subsec_nanos());
    if nsec >= 1_000_000_000 {
        sec = sec.saturating_add(1);
        nsec -= 1_000_000_000;
    }

    // SAFETY: timespec adalah POD; semua field diisi di bawah
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    ts.tv_sec = libc::time_t::try_from(sec).unwrap_or(libc::time_t::MAX);
    ts.tv_nsec = nsec as _;
    Ok(ts)
}

/// RAII untuk `pthread_mutexattr_t`. Hanya ada dalam keadaan ter-init.
struct MutexAttr(MaybeUninit<libc::pthread_mutexattr_t>);

impl MutexAttr {
    fn process_shared() -> Result<Self> {
        let mut raw = MaybeUninit::uninit();
        // SAFETY: pointer ke storage lokal
        check("pthread_mutexattr_init", unsafe {
            libc::pthread_mutexattr_init(raw.as_mut_ptr())
        })?;
        let mut attr = Self(raw);
        // SAFETY: attr sudah di-init
        check("pthread_mutexattr_setpshared", unsafe {
            libc::pthread_mutexattr_setpshared(attr.0.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED)
        })?;
        #[cfg(target_os = "linux")]
        // SAFETY: attr sudah di-init
        check("pthread_mutexattr_setrobust", unsafe {
            libc::pthread_mutexattr_setrobust(attr.0.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST)
        })?;
        Ok(attr)
    }
}

impl Drop for MutexAttr {
    fn drop(&mut self) {
        // SAFETY: MutexAttr hanya dibuat setelah pthread_mutexattr_init sukses
        unsafe { libc::pthread_mutexattr_destroy(self.0.as_mut_ptr()) };
    }
}

/// RAII untuk `pthread_condattr_t`.
struct CondAttr(MaybeUninit<libc::pthread_condattr_t>);

impl CondAttr {
    fn process_shared() -> Result<Self> {
        let mut raw = MaybeUninit::uninit();
        // SAFETY: pointer ke storage lokal
        check("pthread_condattr_init", unsafe {
            libc::pthread_condattr_init(raw.as_mut_ptr())
        })?;
        let mut attr = Self(raw);
        // SAFETY: attr sudah di-init
        check("pthread_condattr_setpshared", unsafe {
            libc::pthread_condattr_setpshared(attr.0.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED)
        })?;
        #[cfg(target_os = "linux")]
        // SAFETY: attr sudah di-init
        check("pthread_condattr_setclock", unsafe {
            libc::pthread_condattr_setclock(attr.0.as_mut_ptr(), COND_CLOCK)
        })?;
        Ok(attr)
    }
}

impl Drop for CondAttr {
    fn drop(&mut self) {
        // SAFETY: CondAttr hanya dibuat setelah pthread_condattr_init sukses
        unsafe { libc::pthread_condattr_destroy(self.0.as_mut_ptr()) };
    }
}

/// Mutex yang bisa dipakai lintas proses.
#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutex memang didesain untuk diakses bersamaan
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Inisialisasi mutex in-place.
    ///
    /// # Safety
    /// `this` harus menunjuk ke storage yang valid dan belum dipakai oleh
    /// proses mana pun. Hanya boleh dipanggil sekali per segment.
    pub unsafe fn init(this: *mut Self) -> Result<()> {
        let mut attr = MutexAttr::process_shared()?;
        let raw = UnsafeCell::raw_get(std::ptr::addr_of!((*this).inner));
        check(
            "pthread_mutex_init",
            libc::pthread_mutex_init(raw, attr.0.as_mut_ptr()),
        )
    }

    #[inline(always)]
    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }

    /// Acquire mutex, dibatasi `timeout` kalau diberikan (Linux).
    pub fn lock(&self, timeout: Option<Duration>) -> Result<SharedMutexGuard<'_>> {
        let started = std::time::Instant::now();

        let code = match timeout {
            #[cfg(target_os = "linux")]
            Some(timeout) => {
                // pthread_mutex_timedlock selalu pakai CLOCK_REALTIME
                let deadline = deadline_after(libc::CLOCK_REALTIME, timeout)?;
                // SAFETY: mutex sudah di-init oleh creator segment
                unsafe { libc::pthread_mutex_timedlock(self.raw(), &deadline) }
            }
            // SAFETY: mutex sudah di-init oleh creator segment
            _ => unsafe { libc::pthread_mutex_lock(self.raw()) },
        };

        match code {
            0 => Ok(SharedMutexGuard { mutex: self }),
            libc::ETIMEDOUT => Err(ChannelError::ProtocolStall {
                phase: StallPhase::Lock,
                waited: started.elapsed(),
            }),
            code => Err(self.lock_failure("pthread_mutex_lock", code, false)),
        }
    }

    /// Terjemahkan error lock. Kalau kita mendapat lock dari owner yang mati,
    /// lock dilepas tanpa `pthread_mutex_consistent`. `guarded` berarti ada
    /// guard yang nanti melepas lock sendiri (jalur condvar wait).
    fn lock_failure(&self, op: &'static str, code: libc::c_int, guarded: bool) -> ChannelError {
        #[cfg(target_os = "linux")]
        {
            if code == libc::EOWNERDEAD {
                tracing::error!(op, "mutex owner died inside the critical section");
                if !guarded {
                    // SAFETY: EOWNERDEAD berarti kita sekarang memegang lock
                    unsafe { libc::pthread_mutex_unlock(self.raw()) };
                }
                return ChannelError::PeerDied;
            }
            if code == libc::ENOTRECOVERABLE {
                return ChannelError::PeerDied;
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = guarded;
        ChannelError::Sync { op, code }
    }
}

/// Guard; unlock saat drop.
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: guard hanya ada selama lock dipegang
        let code = unsafe { libc::pthread_mutex_unlock(self.mutex.raw()) };
        if code != 0 {
            tracing::error!(code, "pthread_mutex_unlock failed");
        }
    }
}

/// Condition variable lintas proses.
#[repr(C)]
pub struct SharedCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: pthread condvar memang didesain untuk diakses bersamaan
unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// Inisialisasi condvar in-place.
    ///
    /// # Safety
    /// Sama dengan [`SharedMutex::init`].
    pub unsafe fn init(this: *mut Self) -> Result<()> {
        let mut attr = CondAttr::process_shared()?;
        let raw = UnsafeCell::raw_get(std::ptr::addr_of!((*this).inner));
        check(
            "pthread_cond_init",
            libc::pthread_cond_init(raw, attr.0.as_mut_ptr()),
        )
    }

    #[inline(always)]
    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.inner.get()
    }

    /// Lepas mutex secara atomik dan blok sampai di-signal.
    pub fn wait(&self, guard: &mut SharedMutexGuard<'_>) -> Result<()> {
        // SAFETY: guard membuktikan mutex sedang dipegang thread ini
        let code = unsafe { libc::pthread_cond_wait(self.raw(), guard.mutex.raw()) };
        match code {
            0 => Ok(()),
            code => Err(guard.mutex.lock_failure("pthread_cond_wait", code, true)),
        }
    }

    /// Seperti [`wait`](Self::wait) tapi berhenti di `deadline`
    /// (diukur dengan [`COND_CLOCK`]).
    pub fn wait_until(
        &self,
        guard: &mut SharedMutexGuard<'_>,
        deadline: &libc::timespec,
    ) -> Result<WaitOutcome> {
        // SAFETY: guard membuktikan mutex sedang dipegang thread ini
        let code =
            unsafe { libc::pthread_cond_timedwait(self.raw(), guard.mutex.raw(), deadline) };
        match code {
            0 => Ok(WaitOutcome::Notified),
            libc::ETIMEDOUT => Ok(WaitOutcome::TimedOut),
            code => Err(guard.mutex.lock_failure("pthread_cond_timedwait", code, true)),
        }
    }

    /// Bangunkan semua waiter.
    pub fn broadcast(&self) -> Result<()> {
        // SAFETY: condvar sudah di-init oleh creator segment
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.raw())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[repr(C)]
    struct Pair {
        mutex: SharedMutex,
        cond: SharedCondvar,
        flag: AtomicBool,
    }

    fn new_pair() -> Arc<Pair> {
        // SAFETY: Pair valid sebagai bytes nol sebelum di-init
        let mut pair: Arc<Pair> = Arc::new(unsafe { std::mem::zeroed() });
        let ptr = Arc::get_mut(&mut pair).unwrap() as *mut Pair;
        unsafe {
            SharedMutex::init(std::ptr::addr_of_mut!((*ptr).mutex)).unwrap();
            SharedCondvar::init(std::ptr::addr_of_mut!((*ptr).cond)).unwrap();
        }
        pair
    }

    #[test]
    fn test_lock_unlock() {
        let pair = new_pair();
        {
            let _guard = pair.mutex.lock(None).unwrap();
        }
        let _guard = pair.mutex.lock(Some(Duration::from_millis(50))).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_timed_lock_reports_stall() {
        let pair = new_pair();
        let holder = Arc::clone(&pair);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            let _guard = holder.mutex.lock(None).unwrap();
            locked_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        locked_rx.recv().unwrap();

        let result = pair.mutex.lock(Some(Duration::from_millis(30)));
        assert!(matches!(
            result,
            Err(ChannelError::ProtocolStall {
                phase: StallPhase::Lock,
                ..
            })
        ));

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(pair.mutex.lock(Some(Duration::from_millis(100))).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_owner_death_reports_peer_died() {
        let pair = new_pair();
        let holder = Arc::clone(&pair);

        // Thread keluar sambil memegang lock (guard tidak pernah di-drop)
        thread::spawn(move || {
            let guard = holder.mutex.lock(None).unwrap();
            std::mem::forget(guard);
        })
        .join()
        .unwrap();

        assert!(matches!(
            pair.mutex.lock(Some(Duration::from_millis(100))),
            Err(ChannelError::PeerDied)
        ));
        // Mutex sekarang unrecoverable
        assert!(matches!(
            pair.mutex.lock(Some(Duration::from_millis(100))),
            Err(ChannelError::PeerDied)
        ));
    }

    #[test]
    fn test_wait_until_times_out() {
        let pair = new_pair();
        let mut guard = pair.mutex.lock(None).unwrap();
        let deadline = deadline_after(COND_CLOCK, Duration::from_millis(20)).unwrap();

        let start = Instant::now();
        let mut outcome = WaitOutcome::Notified;
        // Spurious wakeup tetap mungkin
        while outcome == WaitOutcome::Notified {
            outcome = pair.cond.wait_until(&mut guard, &deadline).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_broadcast_wakes_all_waiters() {
        let pair = new_pair();
        let mut handles = Vec::new();

        for _ in 0..3 {
            let pair = Arc::clone(&pair);
            handles.push(thread::spawn(move || {
                let mut guard = pair.mutex.lock(None).unwrap();
                while !pair.flag.load(Ordering::Relaxed) {
                    pair.cond.wait(&mut guard).unwrap();
                }
            }));
        }

        thread::sleep(Duration::from_millis(20));
        {
            let _guard = pair.mutex.lock(None).unwrap();
            pair.flag.store(true, Ordering::Relaxed);
            pair.cond.broadcast().unwrap();
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_deadline_saturates_for_huge_timeout() {
        let now = deadline_after(COND_CLOCK, Duration::ZERO).unwrap();
        let ts = deadline_after(COND_CLOCK, Duration::MAX).unwrap();
        assert!(ts.tv_sec > now.tv_sec);
        assert_eq!(ts.tv_sec, libc::time_t::MAX);
        assert!((ts.tv_nsec as i64) < 1_000_000_000);

        let ts = deadline_after(COND_CLOCK, Duration::from_secs(u64::MAX / 2)).unwrap();
        assert!(ts.tv_sec > now.tv_sec);
    }

    #[test]
    fn test_wait_until_far_deadline_still_waits() {
        let pair = new_pair();
        let waker = Arc::clone(&pair);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let _guard = waker.mutex.lock(None).unwrap();
            waker.flag.store(true, Ordering::Relaxed);
            waker.cond.broadcast().unwrap();
        });

        let deadline = deadline_after(COND_CLOCK, Duration::MAX).unwrap();
        let mut guard = pair.mutex.lock(None).unwrap();
        while !pair.flag.load(Ordering::Relaxed) {
            let outcome = pair.cond.wait_until(&mut guard, &deadline).unwrap();
            assert_eq!(outcome, WaitOutcome::Notified);
        }
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn test_deadline_normalizes_nanos() {
        let ts = deadline_after(COND_CLOCK, Duration::from_nanos(1_999_999_999)).unwrap();
        assert!((ts.tv_nsec as i64) < 1_000_000_000);
        assert!(ts.tv_nsec >= 0);
    }
}
