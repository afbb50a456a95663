//! Error types for the interception engine
//!
//! Setup failures are reported through [`HookError`]. Violations of the
//! per-thread call protocol cannot be recovered from and go through [`fatal`].

/// Error type for hook operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Invalid address: {0:#x}")]
    InvalidAddress(u64),

    #[error("Function at {0:#x} is already hooked")]
    AlreadyHooked(u64),

    #[error("Hook not found: {0:#x}")]
    NotFound(u64),

    #[error("Function at {0:#x} is too short to patch")]
    TooShort(u64),

    #[error("Instruction relocation failed: {0}")]
    RelocationFailed(String),

    #[error("Failed to allocate executable memory near {0:#x}")]
    Allocation(u64),

    #[error("Memory protection failed: {0}")]
    MemoryProtection(String),

    #[error("Code generation failed: {0}")]
    Encode(String),

    #[error("Hooking is not supported on this target")]
    Unsupported,

    #[error("Hook manager is not initialized")]
    NotInitialized,
}

impl From<region::Error> for HookError {
    fn from(err: region::Error) -> Self {
        HookError::MemoryProtection(err.to_string())
    }
}

impl From<iced_x86::IcedError> for HookError {
    fn from(err: iced_x86::IcedError) -> Self {
        HookError::Encode(err.to_string())
    }
}

/// Log and abort the process
///
/// Used when a thread's frame stack no longer matches its real call stack.
/// Continuing would return into the wrong address.
#[cold]
pub fn fatal(message: &str) -> ! {
    tracing::error!("Fatal interception error: {}", message);
    std::process::abort()
}
