//! Per-thread reentrancy guard
//!
//! Prolog and epilog callbacks run arbitrary code (sinks, logging, the
//! allocator). When that code reaches another hooked function the nested
//! call must still be tracked for stack balance but must not record
//! anything, or instrumenting e.g. `malloc` would recurse forever.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running interception code until dropped
///
/// Scopes nest: dropping one restores whatever state was observed when it
/// was created, so an inner scope never clears an outer one.
pub struct ReentryScope {
    initial_state: bool,
    // Must be dropped on the thread that created it
    _not_send: PhantomData<*const ()>,
}

impl ReentryScope {
    pub fn new() -> Self {
        let initial_state = IN_CALLBACK.with(|flag| flag.replace(true));
        Self {
            initial_state,
            _not_send: PhantomData,
        }
    }

    /// Whether this scope was opened from inside another scope
    #[inline]
    pub fn is_internal_scope(&self) -> bool {
        self.initial_state
    }
}

impl Default for ReentryScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReentryScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(self.initial_state));
    }
}

/// Whether the current thread is inside a prolog or epilog callback
pub fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}
