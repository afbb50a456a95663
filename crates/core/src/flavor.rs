//! Hook flavors
//!
//! A flavor decides what a hook records on entry and exit. The built-in
//! flavors cover the record kinds the capture side understands; anything
//! else goes through [`CallHandler`].

use std::fmt;
use std::sync::Arc;

use hijack_sdk::{RegisterSnapshot, TimerKind};

use crate::frame::Frame;

/// User-supplied entry/exit behavior
///
/// Both callbacks run with the reentrancy guard held, so hooked functions
/// they call are not recorded. Registers changed through the snapshot are
/// what the hooked function (on entry) or its caller (on exit) observes.
pub trait CallHandler: Send + Sync {
    /// Kind stamped on the emitted timer
    fn kind(&self) -> TimerKind {
        TimerKind::Call
    }

    fn on_entry(&self, _function: u64, _snapshot: &mut RegisterSnapshot, _frame: &mut Frame) {}

    fn on_exit(&self, _function: u64, _snapshot: &mut RegisterSnapshot, _frame: &mut Frame) {}
}

/// What an installed hook does with each call
#[derive(Clone)]
pub enum HookFlavor {
    /// Plain enter/exit timing
    Timing,
    /// Allocator: records requested size (arg 0) and returned pointer
    Alloc,
    /// Deallocator: records the freed pointer (arg 0)
    Free,
    /// File read/write: records the descriptor (arg 0) and sends its path
    FileIo,
    /// Opens a zone named by the string at arg 0
    ZoneStart,
    /// Closes the innermost open zone
    ZoneStop,
    /// Method on an engine object: records the object pointer (arg 0)
    EngineObject,
    /// Records only the first call per thread per session; no epilog
    PerThreadUnique,
    Custom(Arc<dyn CallHandler>),
}

impl HookFlavor {
    /// Kind of the timer emitted on exit
    pub fn kind(&self) -> TimerKind {
        match self {
            HookFlavor::Timing | HookFlavor::FileIo | HookFlavor::ZoneStart => TimerKind::Call,
            HookFlavor::Alloc => TimerKind::Alloc,
            HookFlavor::Free => TimerKind::Free,
            HookFlavor::ZoneStop => TimerKind::Zone,
            HookFlavor::EngineObject => TimerKind::EngineObject,
            HookFlavor::PerThreadUnique => TimerKind::PerThreadUniqueCall,
            HookFlavor::Custom(handler) => handler.kind(),
        }
    }

    /// Whether the return address is redirected through an epilog stub
    pub fn has_epilog(&self) -> bool {
        !matches!(self, HookFlavor::PerThreadUnique)
    }

    pub fn name(&self) -> &'static str {
        match self {
            HookFlavor::Timing => "timing",
            HookFlavor::Alloc => "alloc",
            HookFlavor::Free => "free",
            HookFlavor::FileIo => "file_io",
            HookFlavor::ZoneStart => "zone_start",
            HookFlavor::ZoneStop => "zone_stop",
            HookFlavor::EngineObject => "engine_object",
            HookFlavor::PerThreadUnique => "per_thread_unique",
            HookFlavor::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for HookFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
