//! Monotonic tick clock and OS thread ids
//!
//! Both are called on the interception hot path, so neither may allocate or
//! take a lock.

/// Monotonic timestamp in nanoseconds
#[cfg(unix)]
#[inline]
pub fn ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out pointer; CLOCK_MONOTONIC is always available
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64)
}

/// Monotonic timestamp in nanoseconds
#[cfg(not(unix))]
#[inline]
pub fn ticks() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// OS id of the calling thread
#[cfg(target_os = "linux")]
#[inline]
pub fn current_thread_id() -> u32 {
    // SAFETY: gettid has no preconditions
    unsafe { libc::gettid() as u32 }
}

/// OS id of the calling thread
#[cfg(not(target_os = "linux"))]
#[inline]
pub fn current_thread_id() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static ID: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}
