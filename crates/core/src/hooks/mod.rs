//! Hook system
//!
//! Inline hooks that route a function's entry through a generated prolog
//! stub and its return through a generated epilog stub:
//! - [`trampoline`] - executable block allocation near the target
//! - [`relocate`] - moving the overwritten prologue into the trampoline
//! - [`stub`] - prolog/epilog code generation
//! - [`patch`] - jump encoding and live code patching
//! - [`context`] - per-hook data and the Rust entry points the stubs call
//! - [`inline`] - one installed hook
//! - [`manager`] - the registry callers interact with
//!
//! Each hook owns a single [`BLOCK_SIZE`] block:
//!
//! ```text
//! +0                trampoline (relocated prologue + jump back)
//! +PROLOG_OFFSET    prolog stub
//! +EPILOG_OFFSET    epilog stub
//! ```

pub mod context;
pub mod inline;
pub mod manager;
pub mod patch;
pub mod relocate;
pub mod stub;
pub mod trampoline;

pub use context::HookContext;
pub use inline::HookedFunction;
pub use manager::HookManager;
pub use trampoline::BLOCK_SIZE;

/// Room for the relocated prologue and its jump back
pub const TRAMPOLINE_CAPACITY: usize = 256;

/// Room for each generated stub
pub const STUB_CAPACITY: usize = 1920;

pub const PROLOG_OFFSET: usize = TRAMPOLINE_CAPACITY;

pub const EPILOG_OFFSET: usize = PROLOG_OFFSET + STUB_CAPACITY;

const _: () = assert!(EPILOG_OFFSET + STUB_CAPACITY <= BLOCK_SIZE);

/// Default depth of captured callstacks
pub const DEFAULT_CALLSTACK_DEPTH: usize = 32;

/// Per-hook behavior fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookOptions {
    /// Frames walked when callstack tracking is on
    pub max_callstack_depth: usize,
    /// Copy stack arguments of functions with a registered layout
    pub capture_arguments: bool,
    /// Place hook blocks within rel32 reach of the target when possible
    pub near_allocation: bool,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            max_callstack_depth: DEFAULT_CALLSTACK_DEPTH,
            capture_arguments: true,
            near_allocation: true,
        }
    }
}

/// Serializes tests that patch code, allocate blocks or bump the session
#[cfg(test)]
pub(crate) fn test_lock() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
    LOCK.lock()
}
