//! Process-wide capture session id
//!
//! Threads never get told that a session started. Each one compares the id it
//! last saw against [`current_session`] on its next intercepted call and
//! resets its own state when they differ.

use std::sync::atomic::{AtomicU64, Ordering};

/// Current capture session id
static SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// Get the current session id
#[inline]
pub fn current_session() -> u64 {
    SESSION_ID.load(Ordering::Acquire)
}

/// Start a new session and return its id
pub fn begin_session() -> u64 {
    let id = SESSION_ID.fetch_add(1, Ordering::AcqRel) + 1;
    tracing::info!("Capture session {} started", id);
    id
}
