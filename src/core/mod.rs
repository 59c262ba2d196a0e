//! Core module: shared segment, cross-process primitives, channel layout
//!
//! Prinsip desain:
//! - Fixed layout: tidak ada pointer di dalam segment, semua offset tetap
//! - Single init: hanya creator yang meng-init mutex/condvar
//! - Explicit teardown: nama segment hanya dihapus lewat `destroy`

mod segment;
mod state;
mod sync;

pub use segment::{validate_name, SharedSegment};
pub use state::{
    ChannelFields, ChannelMapping, ChannelSnapshot, ChannelState, Payload, PublishReport,
    StateGuard, validate_payload, PAYLOAD_CAPACITY, SLOT_COUNT, STATE_SIZE, STRING_SIZE,
};
pub use sync::{deadline_after, SharedCondvar, SharedMutex, SharedMutexGuard, WaitOutcome, COND_CLOCK};

#[cfg(test)]
pub(crate) fn test_name(tag: &str) -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/ff-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
