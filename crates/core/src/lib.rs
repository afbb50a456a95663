//! Hijack Core - Dynamic Function Interception
//!
//! Patches the entry of native functions so every call runs a prolog
//! callback before the body and an epilog callback after it, and turns each
//! intercepted call into a [`Timer`] record handed to a
//! [`CaptureSink`](hijack_capture::CaptureSink).
//!
//! # Re-exports
//!
//! - [`sdk`] - Register snapshot, timer and argument layout types
//! - [`capture`] - Sinks, capture sessions and the tick clock
//!
//! # Threading
//!
//! Intercepted calls run on whatever thread made them. Each thread keeps its
//! own frame stack, zone stack and reentrancy flag; the [`HookManager`]
//! registry is only locked by setup calls.

pub use hijack_capture as capture;
pub use hijack_sdk as sdk;

pub mod callstack;
pub mod config;
pub mod error;
pub mod flavor;
pub mod frame;
pub mod hooks;
pub mod memory;
pub mod reentry;
pub mod thread_state;

// Re-export commonly used items
pub use config::{ConfigError, ConfigResult, EngineConfig};
pub use error::{fatal, HookError};
pub use flavor::{CallHandler, HookFlavor};
pub use frame::{Frame, FrameStack, MAX_DEPTH};
pub use hooks::{HookManager, HookOptions, HookedFunction};
pub use reentry::{in_callback, ReentryScope};

pub use hijack_capture::{CaptureEvent, CaptureSink, ChannelSink, MemorySink, NullSink};
pub use hijack_sdk::{ArgLayout, RegisterSnapshot, Timer, TimerKind};
