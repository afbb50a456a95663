//! Thread-local interception state
//!
//! Everything here is owned by exactly one thread and needs no locking. It
//! is reached through [`with_thread_state`], which refuses reentrant access
//! instead of panicking: bookkeeping that allocates can land in a hooked
//! allocator, and that nested call must pass through untracked.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use hijack_capture::current_thread_id;
use hijack_sdk::Timer;

use crate::frame::{FrameStack, MAX_DEPTH};

/// Open zones, innermost last
pub struct ZoneStack {
    zones: [Timer; MAX_DEPTH],
    len: usize,
}

impl ZoneStack {
    pub fn new() -> Self {
        Self {
            zones: [Timer::default(); MAX_DEPTH],
            len: 0,
        }
    }

    /// Returns `false` when the stack is full and the zone was not opened
    pub fn push(&mut self, zone: Timer) -> bool {
        if self.len >= MAX_DEPTH {
            return false;
        }
        self.zones[self.len] = zone;
        self.len += 1;
        true
    }

    pub fn pop(&mut self) -> Option<Timer> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.zones[self.len])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }
}

impl Default for ZoneStack {
    fn default() -> Self {
        Self::new()
    }
}

/// All per-thread state of the engine
pub struct ThreadState {
    pub frames: FrameStack,
    pub zones: ZoneStack,
    /// OS thread id, cached on first use
    pub thread_id: u32,
    /// Last session id this thread synchronized with
    session: Option<u64>,
    /// Per-function call counts for per-thread-unique hooks
    unique_calls: HashMap<u64, u64>,
    sent_callstacks: HashSet<u64>,
    sent_strings: HashSet<u64>,
}

impl ThreadState {
    pub fn new(thread_id: u32) -> Self {
        Self {
            frames: FrameStack::new(),
            zones: ZoneStack::new(),
            thread_id,
            session: None,
            unique_calls: HashMap::new(),
            sent_callstacks: HashSet::new(),
            sent_strings: HashSet::new(),
        }
    }

    /// Synchronize with the process-wide session id
    ///
    /// Returns `true` if state was reset. Frames still in flight keep their
    /// return addresses but are retired so the old session records nothing
    /// more.
    pub fn check_session(&mut self, current: u64) -> bool {
        if self.session == Some(current) {
            return false;
        }
        if self.frames.is_empty() {
            self.frames.reset();
        } else {
            self.frames.retire_all();
        }
        self.zones.reset();
        self.unique_calls.clear();
        self.sent_callstacks.clear();
        self.sent_strings.clear();
        self.session = Some(current);
        true
    }

    pub fn session(&self) -> Option<u64> {
        self.session
    }

    /// Count a call of a per-thread-unique function, returning the new count
    pub fn count_unique_call(&mut self, function: u64) -> u64 {
        let count = self.unique_calls.entry(function).or_insert(0);
        *count += 1;
        *count
    }

    /// Record that a callstack was sent; `true` the first time
    pub fn mark_callstack_sent(&mut self, hash: u64) -> bool {
        self.sent_callstacks.insert(hash)
    }

    /// Record that a string was sent; `true` the first time
    pub fn mark_string_sent(&mut self, key: u64) -> bool {
        self.sent_strings.insert(key)
    }

    pub fn is_string_sent(&self, key: u64) -> bool {
        self.sent_strings.contains(&key)
    }
}

thread_local! {
    static STATE: RefCell<ThreadState> = RefCell::new(ThreadState::new(current_thread_id()));
}

/// Run `f` with this thread's state
///
/// Returns `None` if the state is already borrowed further up this thread's
/// stack or has been torn down during thread exit.
pub fn with_thread_state<R>(f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
    STATE
        .try_with(|cell| cell.try_borrow_mut().ok().map(|mut state| f(&mut state)))
        .ok()
        .flatten()
}
