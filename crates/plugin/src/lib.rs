//! Hijack - Injectable Interception Library
//!
//! This crate provides the C ABI boundary over the Rust interception engine.
//! It compiles to a cdylib (.so) that an agent loads into the target process
//! and drives through the `hijack_*` exports declared in `include/hijack.h`.

pub mod ffi;

use std::sync::Arc;

use parking_lot::RwLock;

use hijack_capture::ChannelSink;
use hijack_core::{EngineConfig, HookManager};

/// Live engine owned by the exports
pub struct Engine {
    pub manager: HookManager,
    pub sink: Arc<ChannelSink>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let sink = Arc::new(ChannelSink::new(config.sink_capacity));
        let manager = HookManager::with_config(sink.clone(), &config);
        manager.initialize();
        Self {
            manager,
            sink,
            config,
        }
    }
}

/// Global engine, present between initialize and deinitialize
static ENGINE: RwLock<Option<Engine>> = RwLock::new(None);

/// Run `f` with the engine, if initialized
pub fn with_engine<R>(f: impl FnOnce(&Engine) -> R) -> Option<R> {
    ENGINE.read().as_ref().map(f)
}

/// Install `engine`, returning false if one is already running
pub fn install(engine: Engine) -> bool {
    let mut slot = ENGINE.write();
    if slot.is_some() {
        return false;
    }
    *slot = Some(engine);
    true
}

/// Tear down the engine, restoring every hooked function
pub fn shutdown() -> bool {
    let engine = ENGINE.write().take();
    match engine {
        Some(engine) => {
            tracing::info!(
                "Hijack shutting down, {} records dropped by the sink",
                engine.sink.dropped()
            );
            drop(engine);
            true
        }
        None => false,
    }
}
