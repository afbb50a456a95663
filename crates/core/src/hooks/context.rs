//! Per-hook context and the entry points called by generated stubs
//!
//! Every hook owns one boxed [`HookContext`] whose address is baked into its
//! prolog and epilog stubs. The stubs call [`prolog_entry`] and
//! [`epilog_entry`] with that address, a pointer to the register snapshot
//! they built, and the stack slot holding the return address.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use hijack_capture::{current_session, ticks, CaptureSink};
use hijack_sdk::{ArgLayout, ArgumentCapture, RegisterSnapshot, Timer, TimerKind};

use super::HookOptions;
use crate::callstack::{self, fnv1a_64};
use crate::error::fatal;
use crate::flavor::HookFlavor;
use crate::frame::Frame;
use crate::memory::{read_c_string, safe_read};
use crate::reentry::ReentryScope;
use crate::thread_state::with_thread_state;

/// Longest zone name read from the target
const MAX_ZONE_NAME: usize = 256;

/// Data handed from a stub to its entry point
pub struct HookContext {
    pub(crate) function: u64,
    pub(crate) flavor: HookFlavor,
    pub(crate) trampoline: u64,
    pub(crate) epilog_stub: u64,
    pub(crate) sink: Arc<dyn CaptureSink>,
    pub(crate) track_callstack: AtomicBool,
    pub(crate) arguments: RwLock<Option<Arc<ArgLayout>>>,
    /// Calls between `prolog_entry` and the end of their epilog
    pub(crate) active_calls: AtomicUsize,
    pub(crate) options: HookOptions,
}

impl HookContext {
    pub fn new(
        function: u64,
        flavor: HookFlavor,
        trampoline: u64,
        epilog_stub: u64,
        sink: Arc<dyn CaptureSink>,
        options: HookOptions,
    ) -> Self {
        Self {
            function,
            flavor,
            trampoline,
            epilog_stub,
            sink,
            track_callstack: AtomicBool::new(false),
            arguments: RwLock::new(None),
            active_calls: AtomicUsize::new(0),
            options,
        }
    }

    pub fn function(&self) -> u64 {
        self.function
    }

    pub fn flavor(&self) -> &HookFlavor {
        &self.flavor
    }

    pub fn trampoline(&self) -> u64 {
        self.trampoline
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Acquire)
    }

    pub fn set_track_callstack(&self, enabled: bool) {
        self.track_callstack.store(enabled, Ordering::Release);
    }

    pub fn set_arguments(&self, layout: Option<Arc<ArgLayout>>) {
        *self.arguments.write() = layout;
    }

    /// Prolog work; `internal` is set when called from inside another
    /// callback on this thread
    ///
    /// Returns `true` if the return address now points at the epilog stub.
    fn on_prolog(
        &self,
        internal: bool,
        snapshot: &mut RegisterSnapshot,
        return_slot: *mut u64,
    ) -> bool {
        let session = current_session();

        if !self.flavor.has_epilog() {
            self.on_unique_call(internal, session);
            return false;
        }

        let return_address = unsafe { *return_slot };
        let mut frame = Frame {
            return_address,
            return_slot: return_slot as u64,
            timer: Timer::new(self.function, self.flavor.kind()),
            arguments: snapshot.integer.arguments(),
            is_internal: internal,
            callstack_hash: 0,
            session,
        };

        // Nested access (a hooked allocator reached from our own bookkeeping)
        // passes through untracked
        let Some(thread_id) = with_thread_state(|state| {
            state.check_session(session);
            frame.timer.thread_id = state.thread_id;
            frame.timer.depth = state.frames.len().min(u8::MAX as usize) as u8;
            state.frames.push(frame);
            state.thread_id
        }) else {
            return false;
        };
        frame.timer.thread_id = thread_id;
        unsafe {
            *return_slot = self.epilog_stub;
        }

        if !internal {
            // Callbacks see the frame already on the stack; the thread state
            // is not borrowed while they run
            self.enter(snapshot, &mut frame);
            if with_thread_state(|state| *state.frames.top_mut() = frame).is_none() {
                fatal("thread state unavailable in prolog");
            }
        }
        true
    }

    fn on_epilog(&self, snapshot: &mut RegisterSnapshot, return_slot: *mut u64) {
        let end = ticks();

        let Some(mut frame) = with_thread_state(|state| *state.frames.top()) else {
            fatal("thread state unavailable in epilog");
        };
        // A session that began mid-call must not receive this call
        if !frame.is_internal && frame.session == current_session() {
            self.exit(snapshot, &mut frame, end);
        }

        let Some(popped) = with_thread_state(|state| state.frames.pop()) else {
            fatal("thread state unavailable in epilog");
        };
        unsafe {
            *return_slot = popped.return_address;
        }
    }

    /// Prolog-only flavor: one record per thread per session
    fn on_unique_call(&self, internal: bool, session: u64) {
        if internal {
            return;
        }
        let Some((count, thread_id)) = with_thread_state(|state| {
            state.check_session(session);
            (state.count_unique_call(self.function), state.thread_id)
        }) else {
            return;
        };
        if count != 1 {
            return;
        }

        let mut timer = Timer::new(self.function, TimerKind::PerThreadUniqueCall);
        timer.thread_id = thread_id;
        timer.start_at(ticks());
        self.sink.add_timer(timer);
    }

    fn enter(&self, snapshot: &mut RegisterSnapshot, frame: &mut Frame) {
        let arg0 = frame.arguments[0];

        if self.options.capture_arguments {
            self.capture_arguments(snapshot, frame.timer.thread_id);
        }
        if self.track_callstack.load(Ordering::Acquire) {
            self.capture_callstack(snapshot, frame);
        }

        match &self.flavor {
            HookFlavor::Alloc => frame.timer.user_data[1] = arg0,
            HookFlavor::Free | HookFlavor::EngineObject => frame.timer.user_data[0] = arg0,
            HookFlavor::FileIo => self.record_file(frame, arg0),
            HookFlavor::ZoneStart => self.open_zone(frame, arg0),
            HookFlavor::Custom(handler) => handler.on_entry(self.function, snapshot, frame),
            HookFlavor::Timing | HookFlavor::ZoneStop | HookFlavor::PerThreadUnique => {}
        }

        frame.timer.start_at(ticks());
    }

    fn exit(&self, snapshot: &mut RegisterSnapshot, frame: &mut Frame, end: u64) {
        match &self.flavor {
            HookFlavor::Alloc => frame.timer.user_data[0] = snapshot.return_value(),
            HookFlavor::ZoneStart => return,
            HookFlavor::ZoneStop => {
                self.close_zone(end);
                return;
            }
            HookFlavor::Custom(handler) => handler.on_exit(self.function, snapshot, frame),
            _ => {}
        }

        frame.timer.stop_at(end);
        self.sink.add_timer(frame.timer);
    }

    /// Copy the stack argument area described by the registered layout
    fn capture_arguments(&self, snapshot: &RegisterSnapshot, thread_id: u32) {
        let Some(layout) = self.arguments.read().clone() else {
            return;
        };

        // Entry rsp points at the return address
        let mut stack = vec![0u8; layout.stack_bytes as usize];
        let copied = safe_read(snapshot.integer.rsp + 8, &mut stack);
        stack.truncate(copied);

        self.sink.add_arguments(ArgumentCapture {
            function_address: self.function,
            thread_id,
            timestamp: ticks(),
            registers: snapshot.integer,
            stack,
        });
    }

    fn capture_callstack(&self, snapshot: &RegisterSnapshot, frame: &mut Frame) {
        let return_address = frame.return_address;
        let rbp = snapshot.integer.rbp;
        let max_depth = self.options.max_callstack_depth;

        let Some((stack, first)) = with_thread_state(|state| {
            let stack = callstack::walk(return_address, rbp, max_depth, &state.frames);
            let first = !stack.frames().is_empty() && state.mark_callstack_sent(stack.hash());
            (stack, first)
        }) else {
            return;
        };
        if stack.frames().is_empty() {
            return;
        }

        if first {
            self.sink.add_callstack(stack.hash(), stack.frames());
        }
        frame.callstack_hash = stack.hash();
        frame.timer.callstack_hash = stack.hash();
    }

    fn record_file(&self, frame: &mut Frame, arg0: u64) {
        frame.timer.user_data[0] = arg0;

        let Some(path) = fd_path(arg0 as u32 as i32) else {
            return;
        };
        let key = fnv1a_64(path.as_bytes());
        frame.timer.user_data[1] = key;

        if with_thread_state(|state| state.mark_string_sent(key)) == Some(true) {
            self.sink.add_string(key, path);
        }
    }

    fn open_zone(&self, frame: &Frame, name: u64) {
        let mut zone = Timer::new(name, TimerKind::Zone);
        zone.thread_id = frame.timer.thread_id;
        zone.callstack_hash = frame.callstack_hash;

        let pushed = with_thread_state(|state| {
            zone.depth = state.zones.len().min(u8::MAX as usize) as u8;
            zone.start_at(ticks());
            state.zones.push(zone)
        });
        if pushed == Some(false) {
            tracing::warn!("Zone stack full, dropping zone {:x}", name);
        }
    }

    fn close_zone(&self, end: u64) {
        let Some(Some(mut zone)) = with_thread_state(|state| state.zones.pop()) else {
            tracing::warn!("Zone stop at {:x} with no open zone", self.function);
            return;
        };
        zone.stop_at(end);

        let name = zone.function_address;
        let unsent = with_thread_state(|state| !state.is_string_sent(name)) == Some(true);
        if unsent {
            if let Some(value) = read_c_string(name, MAX_ZONE_NAME) {
                with_thread_state(|state| state.mark_string_sent(name));
                self.sink.add_string(name, value);
            }
        }

        self.sink.add_timer(zone);
    }
}

#[cfg(target_os = "linux")]
fn fd_path(fd: i32) -> Option<String> {
    if fd < 0 {
        return None;
    }
    std::fs::read_link(format!("/proc/self/fd/{fd}"))
        .ok()
        .map(|path| path.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "linux"))]
fn fd_path(_fd: i32) -> Option<String> {
    None
}

/// Called by every prolog stub
///
/// The call counts as active from here until its epilog returns, or until
/// this function returns when no epilog was armed.
///
/// # Safety
/// Only generated stubs call this, with a live context, the snapshot they
/// built and the stack slot holding the caller's return address.
pub(crate) unsafe extern "C" fn prolog_entry(
    context: *const HookContext,
    snapshot: *mut RegisterSnapshot,
    return_slot: *mut u64,
) {
    let context = &*context;
    context.active_calls.fetch_add(1, Ordering::AcqRel);

    let scope = ReentryScope::new();
    let armed = context.on_prolog(scope.is_internal_scope(), &mut *snapshot, return_slot);
    drop(scope);

    if !armed {
        context.active_calls.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Called by every epilog stub
///
/// # Safety
/// Only generated stubs call this, with the slot their `push 0` reserved.
pub(crate) unsafe extern "C" fn epilog_entry(
    context: *const HookContext,
    snapshot: *mut RegisterSnapshot,
    return_slot: *mut u64,
) {
    let context = &*context;

    let scope = ReentryScope::new();
    context.on_epilog(&mut *snapshot, return_slot);
    drop(scope);

    context.active_calls.fetch_sub(1, Ordering::AcqRel);
}
