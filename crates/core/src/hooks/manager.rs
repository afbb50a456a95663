//! Hook manager
//!
//! Owns every installed hook and the per-address settings that outlive them
//! (callstack tracking, argument layouts). All registry changes happen under
//! one lock; the call path never touches it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use hijack_capture::CaptureSink;
use hijack_sdk::ArgLayout;

use super::inline::HookedFunction;
use super::HookOptions;
use crate::config::EngineConfig;
use crate::error::HookError;
use crate::flavor::{CallHandler, HookFlavor};

/// A pending enable/disable applied by [`HookManager::apply_queued`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueuedOp {
    Enable(u64),
    Disable(u64),
}

impl QueuedOp {
    fn address(self) -> u64 {
        match self {
            QueuedOp::Enable(address) | QueuedOp::Disable(address) => address,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    initialized: bool,
    hooks: HashMap<u64, HookedFunction>,
    /// Addresses with callstack capture on, hooked or not
    tracked: HashSet<u64>,
    layouts: HashMap<u64, Arc<ArgLayout>>,
    queued: Vec<QueuedOp>,
    /// Removed hooks that still had calls in flight
    retired: Vec<HookedFunction>,
}

impl ManagerState {
    /// Drop retired hooks whose last call has returned
    fn sweep_retired(&mut self) {
        self.retired.retain(|hook| hook.active_calls() > 0);
    }

    /// Unpatch `hook` and drop it, or park it while calls are in flight
    fn retire(&mut self, mut hook: HookedFunction) {
        if let Err(e) = hook.disable() {
            tracing::error!("Failed to restore {:x}: {}", hook.address(), e);
        }
        if hook.active_calls() > 0 {
            tracing::debug!(
                "Hook at {:x} removed with {} calls in flight",
                hook.address(),
                hook.active_calls()
            );
            self.retired.push(hook);
        }
    }

    fn hook_mut(&mut self, address: u64) -> Result<&mut HookedFunction, HookError> {
        self.hooks
            .get_mut(&address)
            .ok_or(HookError::NotFound(address))
    }
}

/// Registry of inline hooks sharing one capture sink
pub struct HookManager {
    sink: Arc<dyn CaptureSink>,
    options: HookOptions,
    state: Mutex<ManagerState>,
}

impl HookManager {
    pub fn new(sink: Arc<dyn CaptureSink>) -> Self {
        Self {
            sink,
            options: HookOptions::default(),
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn with_config(sink: Arc<dyn CaptureSink>, config: &EngineConfig) -> Self {
        Self {
            sink,
            options: HookOptions::from(config),
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn options(&self) -> HookOptions {
        self.options
    }

    pub fn sink(&self) -> &Arc<dyn CaptureSink> {
        &self.sink
    }

    /// Allow hook creation; idempotent
    pub fn initialize(&self) {
        let mut state = self.state.lock();
        if !state.initialized {
            state.initialized = true;
            tracing::info!("Hook manager initialized");
        }
    }

    /// Remove every hook and forget all settings; idempotent
    #[tracing::instrument(skip_all)]
    pub fn deinitialize(&self) {
        let mut state = self.state.lock();
        if !state.initialized && state.hooks.is_empty() {
            return;
        }

        let hooks: Vec<_> = state.hooks.drain().map(|(_, hook)| hook).collect();
        let count = hooks.len();
        for hook in hooks {
            state.retire(hook);
        }
        state.sweep_retired();
        state.tracked.clear();
        state.layouts.clear();
        state.queued.clear();
        state.initialized = false;

        tracing::info!("Hook manager deinitialized, removed {} hooks", count);
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Prepare a hook at `address`, returning its trampoline
    ///
    /// The hook starts disabled. Callstack tracking and argument layouts
    /// registered for the address beforehand are applied.
    #[tracing::instrument(skip(self, flavor))]
    pub fn create_hook(&self, address: u64, flavor: HookFlavor) -> Result<u64, HookError> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(HookError::NotInitialized);
        }
        if state.hooks.contains_key(&address) {
            return Err(HookError::AlreadyHooked(address));
        }
        state.sweep_retired();

        let name = flavor.name();
        let hook = HookedFunction::create(address, flavor, self.sink.clone(), self.options)?;
        hook.set_track_callstack(state.tracked.contains(&address));
        hook.set_arguments(state.layouts.get(&address).cloned());

        let trampoline = hook.trampoline();
        state.hooks.insert(address, hook);

        tracing::info!("Created {} hook at {:x}", name, address);
        Ok(trampoline)
    }

    pub fn create_timing_hook(&self, address: u64) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::Timing)
    }

    pub fn create_alloc_hook(&self, address: u64) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::Alloc)
    }

    pub fn create_free_hook(&self, address: u64) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::Free)
    }

    pub fn create_file_io_hook(&self, address: u64) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::FileIo)
    }

    pub fn create_zone_start_hook(&self, address: u64) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::ZoneStart)
    }

    pub fn create_zone_stop_hook(&self, address: u64) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::ZoneStop)
    }

    pub fn create_engine_object_hook(&self, address: u64) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::EngineObject)
    }

    pub fn create_per_thread_unique_hook(&self, address: u64) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::PerThreadUnique)
    }

    pub fn create_custom_hook(
        &self,
        address: u64,
        handler: Arc<dyn CallHandler>,
    ) -> Result<u64, HookError> {
        self.create_hook(address, HookFlavor::Custom(handler))
    }

    pub fn enable_hook(&self, address: u64) -> Result<(), HookError> {
        self.state.lock().hook_mut(address)?.enable()
    }

    pub fn disable_hook(&self, address: u64) -> Result<(), HookError> {
        self.state.lock().hook_mut(address)?.disable()
    }

    /// Restore the original bytes and release the hook
    ///
    /// The block stays alive until every call that entered it has returned.
    #[tracing::instrument(skip(self))]
    pub fn remove_hook(&self, address: u64) -> Result<(), HookError> {
        let mut state = self.state.lock();
        let mut hook = state
            .hooks
            .remove(&address)
            .ok_or(HookError::NotFound(address))?;

        if let Err(e) = hook.disable() {
            state.hooks.insert(address, hook);
            return Err(e);
        }
        state.queued.retain(|op| op.address() != address);
        state.retire(hook);
        state.sweep_retired();

        tracing::info!("Removed hook at {:x}", address);
        Ok(())
    }

    /// Disable every hook, continuing past failures
    ///
    /// Returns the first error encountered.
    pub fn disable_all_hooks(&self) -> Result<(), HookError> {
        let mut state = self.state.lock();
        let mut first_error = None;
        for hook in state.hooks.values_mut() {
            if let Err(e) = hook.disable() {
                tracing::warn!("Failed to disable hook at {:x}: {}", hook.address(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Enable several hooks, returning the addresses that failed
    pub fn enable_hooks(&self, addresses: &[u64]) -> Vec<u64> {
        let mut state = self.state.lock();
        let mut failed = Vec::new();
        for &address in addresses {
            if let Err(e) = state.hook_mut(address).and_then(|hook| hook.enable()) {
                tracing::warn!("Failed to enable hook at {:x}: {}", address, e);
                failed.push(address);
            }
        }
        failed
    }

    pub fn queue_enable(&self, address: u64) -> Result<(), HookError> {
        self.queue(QueuedOp::Enable(address))
    }

    pub fn queue_disable(&self, address: u64) -> Result<(), HookError> {
        self.queue(QueuedOp::Disable(address))
    }

    fn queue(&self, op: QueuedOp) -> Result<(), HookError> {
        let mut state = self.state.lock();
        if !state.hooks.contains_key(&op.address()) {
            return Err(HookError::NotFound(op.address()));
        }
        state.queued.push(op);
        Ok(())
    }

    /// Apply queued changes in order, returning the addresses that failed
    pub fn apply_queued(&self) -> Vec<u64> {
        let mut state = self.state.lock();
        let queued = std::mem::take(&mut state.queued);
        let mut failed = Vec::new();

        for op in queued {
            let result = state.hook_mut(op.address()).and_then(|hook| match op {
                QueuedOp::Enable(_) => hook.enable(),
                QueuedOp::Disable(_) => hook.disable(),
            });
            if let Err(e) = result {
                tracing::warn!("Queued {:?} failed: {}", op, e);
                failed.push(op.address());
            }
        }
        failed
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Capture callstacks for calls of `address`
    ///
    /// May be set before the address is hooked.
    pub fn track_callstack(&self, address: u64) {
        let mut state = self.state.lock();
        state.tracked.insert(address);
        if let Some(hook) = state.hooks.get(&address) {
            hook.set_track_callstack(true);
        }
    }

    pub fn untrack_callstack(&self, address: u64) {
        let mut state = self.state.lock();
        state.tracked.remove(&address);
        if let Some(hook) = state.hooks.get(&address) {
            hook.set_track_callstack(false);
        }
    }

    pub fn is_callstack_tracked(&self, address: u64) -> bool {
        self.state.lock().tracked.contains(&address)
    }

    /// Register the stack argument layout of `address`
    pub fn set_function_arguments(&self, address: u64, layout: ArgLayout) {
        if !layout.is_consistent() {
            tracing::warn!(
                "Argument layout for {:x} has slots past its {} copied bytes",
                address,
                layout.stack_bytes
            );
        }
        let layout = Arc::new(layout);
        let mut state = self.state.lock();
        if let Some(hook) = state.hooks.get(&address) {
            hook.set_arguments(Some(layout.clone()));
        }
        state.layouts.insert(address, layout);
    }

    /// Forget all argument layouts and callstack tracking
    pub fn clear_function_arguments(&self) {
        let mut state = self.state.lock();
        state.layouts.clear();
        state.tracked.clear();
        for hook in state.hooks.values() {
            hook.set_arguments(None);
            hook.set_track_callstack(false);
        }
    }

    pub fn is_hooked(&self, address: u64) -> bool {
        self.state.lock().hooks.contains_key(&address)
    }

    pub fn is_enabled(&self, address: u64) -> bool {
        self.state
            .lock()
            .hooks
            .get(&address)
            .is_some_and(|hook| hook.is_enabled())
    }

    /// Hooked addresses in ascending order
    pub fn hooked_addresses(&self) -> Vec<u64> {
        let mut addresses: Vec<_> = self.state.lock().hooks.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Pointer that calls the original body of a hooked function
    pub fn trampoline(&self, address: u64) -> Option<u64> {
        self.state.lock().hooks.get(&address).map(|hook| hook.trampoline())
    }

    /// Start a new capture session; every thread resets on its next call
    pub fn begin_session(&self) -> u64 {
        hijack_capture::begin_session()
    }
}

impl Drop for HookManager {
    fn drop(&mut self) {
        self.deinitialize();

        let state = self.state.get_mut();
        state.sweep_retired();
        for hook in state.retired.drain(..) {
            // Returning threads still need the epilog stub
            tracing::warn!(
                "Leaking hook block for {:x} with {} calls in flight",
                hook.address(),
                hook.active_calls()
            );
            std::mem::forget(hook);
        }
    }
}
