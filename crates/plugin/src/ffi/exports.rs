//! C-compatible exports called by the injecting agent
//!
//! Every export returns `false` (or 0) when the engine is not initialized or
//! the operation failed; details go to the log.

use std::ffi::{c_char, c_void};
use std::sync::Arc;

use tracing::instrument;
use tracing_subscriber::EnvFilter;

use hijack_capture::CaptureEvent;
use hijack_core::{CallHandler, EngineConfig, Frame, HookError, HookFlavor};
use hijack_sdk::{IntegerRegisters, RegisterSnapshot, Timer};

use crate::{install, shutdown, with_engine, Engine};

/// Environment variable holding the log filter
const LOG_ENV: &str = "HIJACK_LOG";

static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// Entry or exit callback supplied over the C ABI
pub type HijackCallback =
    unsafe extern "C" fn(function: u64, snapshot: *mut RegisterSnapshot, user_data: *mut c_void);

/// Record type carried by a [`HijackEvent`]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HijackEventKind {
    Timer = 0,
    /// `data` holds `len` UTF-8 bytes, not nul-terminated
    String = 1,
    /// `data` holds `len` return addresses
    Callstack = 2,
    /// `data` holds `len` bytes copied from the stack argument area
    Arguments = 3,
}

/// One drained record, borrowed for the duration of a visitor call
///
/// `key` is the string key, the callstack hash or the captured function.
/// Pointers are null when the kind carries no such payload.
#[repr(C)]
pub struct HijackEvent {
    pub kind: HijackEventKind,
    pub thread_id: u32,
    pub key: u64,
    pub timestamp: u64,
    pub timer: Timer,
    pub registers: *const IntegerRegisters,
    pub data: *const c_void,
    pub len: usize,
}

impl HijackEvent {
    fn empty(kind: HijackEventKind, key: u64) -> Self {
        Self {
            kind,
            thread_id: 0,
            key,
            timestamp: 0,
            timer: Timer::default(),
            registers: std::ptr::null(),
            data: std::ptr::null(),
            len: 0,
        }
    }
}

/// Receives drained records; the event and its payload are only valid
/// during the call
pub type HijackEventVisitor =
    unsafe extern "C" fn(event: *const HijackEvent, user_data: *mut c_void);

/// Initialize logging and the hook engine
///
/// Loads `hijack.toml` (see `EngineConfig`), falling back to defaults when
/// it cannot be read.
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn hijack_initialize(error: *mut c_char, maxlen: usize) -> bool {
    let (config, load_error) = match EngineConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (EngineConfig::default(), Some(e)),
    };
    init_logging(&config);
    if let Some(e) = load_error {
        tracing::warn!("Using default engine config: {}", e);
    }

    tracing::info!("Hijack initializing...");

    if !install(Engine::new(config)) {
        write_error(error, maxlen, "Hijack is already initialized");
        return false;
    }

    tracing::info!("Hijack initialized");
    true
}

/// Remove every hook and release the engine
#[no_mangle]
#[instrument(skip_all)]
pub extern "C" fn hijack_deinitialize() -> bool {
    match std::panic::catch_unwind(shutdown) {
        Ok(was_running) => was_running,
        Err(_) => {
            tracing::error!("Panic during shutdown");
            false
        }
    }
}

#[no_mangle]
pub extern "C" fn hijack_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

/// Prepare a timing hook; `original` receives the trampoline if non-null
///
/// # Safety
/// - `original` must be a valid pointer or null
#[no_mangle]
pub unsafe extern "C" fn hijack_create_hook(address: u64, original: *mut u64) -> bool {
    create(address, HookFlavor::Timing, original)
}

/// Prepare a hook running C callbacks on entry and exit
///
/// Either callback may be null. `user_data` is passed back unchanged and must
/// stay valid until the hook is removed.
///
/// # Safety
/// - `original` must be a valid pointer or null
/// - the callbacks must be safe to call from any thread
#[no_mangle]
pub unsafe extern "C" fn hijack_create_hook_with_callbacks(
    address: u64,
    on_entry: Option<HijackCallback>,
    on_exit: Option<HijackCallback>,
    user_data: *mut c_void,
    original: *mut u64,
) -> bool {
    let handler = CallbackHandler {
        on_entry,
        on_exit,
        user_data: user_data as usize,
    };
    create(address, HookFlavor::Custom(Arc::new(handler)), original)
}

/// # Safety
/// - `original` must be a valid pointer or null
#[no_mangle]
pub unsafe extern "C" fn hijack_create_alloc_hook(address: u64, original: *mut u64) -> bool {
    create(address, HookFlavor::Alloc, original)
}

/// # Safety
/// - `original` must be a valid pointer or null
#[no_mangle]
pub unsafe extern "C" fn hijack_create_free_hook(address: u64, original: *mut u64) -> bool {
    create(address, HookFlavor::Free, original)
}

/// # Safety
/// - `original` must be a valid pointer or null
#[no_mangle]
pub unsafe extern "C" fn hijack_create_file_io_hook(address: u64, original: *mut u64) -> bool {
    create(address, HookFlavor::FileIo, original)
}

/// # Safety
/// - `original` must be a valid pointer or null
#[no_mangle]
pub unsafe extern "C" fn hijack_create_zone_start_hook(address: u64, original: *mut u64) -> bool {
    create(address, HookFlavor::ZoneStart, original)
}

/// # Safety
/// - `original` must be a valid pointer or null
#[no_mangle]
pub unsafe extern "C" fn hijack_create_zone_stop_hook(address: u64, original: *mut u64) -> bool {
    create(address, HookFlavor::ZoneStop, original)
}

/// # Safety
/// - `original` must be a valid pointer or null
#[no_mangle]
pub unsafe extern "C" fn hijack_create_engine_object_hook(
    address: u64,
    original: *mut u64,
) -> bool {
    create(address, HookFlavor::EngineObject, original)
}

/// # Safety
/// - `original` must be a valid pointer or null
#[no_mangle]
pub unsafe extern "C" fn hijack_create_per_thread_unique_hook(
    address: u64,
    original: *mut u64,
) -> bool {
    create(address, HookFlavor::PerThreadUnique, original)
}

#[no_mangle]
pub extern "C" fn hijack_enable_hook(address: u64) -> bool {
    report(address, "enable", |engine| engine.manager.enable_hook(address))
}

#[no_mangle]
pub extern "C" fn hijack_disable_hook(address: u64) -> bool {
    report(address, "disable", |engine| engine.manager.disable_hook(address))
}

#[no_mangle]
pub extern "C" fn hijack_remove_hook(address: u64) -> bool {
    report(address, "remove", |engine| engine.manager.remove_hook(address))
}

#[no_mangle]
pub extern "C" fn hijack_disable_all_hooks() -> bool {
    report(0, "disable all", |engine| engine.manager.disable_all_hooks())
}

/// Enable `count` hooks, returning how many failed
///
/// # Safety
/// - `addresses` must point to `count` readable values, or be null with `count` 0
#[no_mangle]
pub unsafe extern "C" fn hijack_enable_hooks(addresses: *const u64, count: usize) -> usize {
    let addresses = if addresses.is_null() || count == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(addresses, count)
    };
    with_engine(|engine| engine.manager.enable_hooks(addresses).len()).unwrap_or(addresses.len())
}

#[no_mangle]
pub extern "C" fn hijack_queue_enable_hook(address: u64) -> bool {
    report(address, "queue enable", |engine| engine.manager.queue_enable(address))
}

#[no_mangle]
pub extern "C" fn hijack_queue_disable_hook(address: u64) -> bool {
    report(address, "queue disable", |engine| engine.manager.queue_disable(address))
}

/// Apply queued changes, returning how many failed
#[no_mangle]
pub extern "C" fn hijack_apply_queued() -> usize {
    with_engine(|engine| engine.manager.apply_queued().len()).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn hijack_track_callstack(address: u64, enabled: bool) -> bool {
    with_engine(|engine| {
        if enabled {
            engine.manager.track_callstack(address);
        } else {
            engine.manager.untrack_callstack(address);
        }
    })
    .is_some()
}

/// Start a new capture session, returning its id (0 if not initialized)
#[no_mangle]
pub extern "C" fn hijack_begin_session() -> u64 {
    with_engine(|engine| engine.manager.begin_session()).unwrap_or(0)
}

/// Pointer that runs the original body of a hooked function, or 0
#[no_mangle]
pub extern "C" fn hijack_get_trampoline(address: u64) -> u64 {
    with_engine(|engine| engine.manager.trampoline(address))
        .flatten()
        .unwrap_or(0)
}

/// Move up to `capacity` pending records into `out`, returning the number
/// of timers written
///
/// Non-timer records pulled from the queue are discarded; use
/// [`hijack_drain_events`] to receive them.
///
/// # Safety
/// - `out` must point to `capacity` writable timers
#[no_mangle]
pub unsafe extern "C" fn hijack_drain_timers(out: *mut Timer, capacity: usize) -> usize {
    if out.is_null() || capacity == 0 {
        return 0;
    }
    let events = with_engine(|engine| engine.sink.drain(capacity)).unwrap_or_default();

    let mut written = 0;
    for event in events {
        if let CaptureEvent::Timer(timer) = event {
            out.add(written).write(timer);
            written += 1;
        }
    }
    written
}

/// Pass up to `max` pending records of every kind to `visitor`, in the
/// order they were produced, returning how many were visited
///
/// # Safety
/// - `visitor` must not retain the event or its payload pointers
#[no_mangle]
pub unsafe extern "C" fn hijack_drain_events(
    visitor: Option<HijackEventVisitor>,
    user_data: *mut c_void,
    max: usize,
) -> usize {
    let Some(visitor) = visitor else {
        return 0;
    };
    let events = with_engine(|engine| engine.sink.drain(max)).unwrap_or_default();

    let count = events.len();
    for event in &events {
        visit_event(visitor, user_data, event);
    }
    count
}

unsafe fn visit_event(visitor: HijackEventVisitor, user_data: *mut c_void, event: &CaptureEvent) {
    let raw = match event {
        CaptureEvent::Timer(timer) => HijackEvent {
            thread_id: timer.thread_id,
            key: timer.function_address,
            timestamp: timer.start,
            timer: *timer,
            ..HijackEvent::empty(HijackEventKind::Timer, 0)
        },
        CaptureEvent::String { key, value } => HijackEvent {
            data: value.as_ptr() as *const c_void,
            len: value.len(),
            ..HijackEvent::empty(HijackEventKind::String, *key)
        },
        CaptureEvent::Callstack { hash, frames } => HijackEvent {
            data: frames.as_ptr() as *const c_void,
            len: frames.len(),
            ..HijackEvent::empty(HijackEventKind::Callstack, *hash)
        },
        CaptureEvent::Arguments(capture) => HijackEvent {
            thread_id: capture.thread_id,
            timestamp: capture.timestamp,
            registers: &capture.registers,
            data: capture.stack.as_ptr() as *const c_void,
            len: capture.stack.len(),
            ..HijackEvent::empty(HijackEventKind::Arguments, capture.function_address)
        },
    };
    visitor(&raw, user_data);
}

/// Handler forwarding to C function pointers
struct CallbackHandler {
    on_entry: Option<HijackCallback>,
    on_exit: Option<HijackCallback>,
    /// Opaque to us; stored as an address so the handler is Send + Sync
    user_data: usize,
}

impl CallHandler for CallbackHandler {
    fn on_entry(&self, function: u64, snapshot: &mut RegisterSnapshot, _frame: &mut Frame) {
        if let Some(callback) = self.on_entry {
            unsafe { callback(function, snapshot, self.user_data as *mut c_void) };
        }
    }

    fn on_exit(&self, function: u64, snapshot: &mut RegisterSnapshot, _frame: &mut Frame) {
        if let Some(callback) = self.on_exit {
            unsafe { callback(function, snapshot, self.user_data as *mut c_void) };
        }
    }
}

unsafe fn create(address: u64, flavor: HookFlavor, original: *mut u64) -> bool {
    let name = flavor.name();
    let result = with_engine(|engine| engine.manager.create_hook(address, flavor));
    match result {
        Some(Ok(trampoline)) => {
            if !original.is_null() {
                *original = trampoline;
            }
            true
        }
        Some(Err(e)) => {
            tracing::error!("Failed to create {} hook at {:x}: {}", name, address, e);
            false
        }
        None => {
            tracing::warn!("Hook creation at {:x} before hijack_initialize", address);
            false
        }
    }
}

fn report(
    address: u64,
    action: &str,
    f: impl FnOnce(&Engine) -> Result<(), HookError>,
) -> bool {
    match with_engine(f) {
        Some(Ok(())) => true,
        Some(Err(e)) => {
            tracing::warn!("Failed to {} hook {:x}: {}", action, address, e);
            false
        }
        None => false,
    }
}

fn init_logging(config: &EngineConfig) {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Helper to write an error message to a C buffer
///
/// # Safety
/// - `error` must be a valid pointer or null
/// - `maxlen` must accurately reflect the buffer size
unsafe fn write_error(error: *mut c_char, maxlen: usize, msg: &str) {
    if !error.is_null() && maxlen > 0 {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(maxlen - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), error as *mut u8, len);
        *error.add(len) = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{Mutex, MutexGuard};

    use hijack_capture::CaptureSink;
    use hijack_sdk::{ArgumentCapture, TimerKind};

    /// The engine is process-wide
    fn lock() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        LOCK.lock()
    }

    /// Owned copy of what the visitor was shown
    #[derive(Debug, PartialEq)]
    enum Seen {
        Timer(Timer),
        String(u64, String),
        Callstack(u64, Vec<u64>),
        Arguments(u64, u64, Vec<u8>),
    }

    unsafe extern "C" fn collect(event: *const HijackEvent, user_data: *mut c_void) {
        let seen = &mut *(user_data as *mut Vec<Seen>);
        let event = &*event;
        let bytes = |len: usize| {
            if event.data.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts(event.data as *const u8, len).to_vec()
            }
        };
        seen.push(match event.kind {
            HijackEventKind::Timer => Seen::Timer(event.timer),
            HijackEventKind::String => {
                Seen::String(event.key, String::from_utf8(bytes(event.len)).unwrap())
            }
            HijackEventKind::Callstack => Seen::Callstack(
                event.key,
                std::slice::from_raw_parts(event.data as *const u64, event.len).to_vec(),
            ),
            HijackEventKind::Arguments => {
                Seen::Arguments(event.key, (*event.registers).rdi, bytes(event.len))
            }
        });
    }

    #[test]
    fn test_write_error_truncates() {
        let mut buf = [0x7f as c_char; 8];
        unsafe { write_error(buf.as_mut_ptr(), buf.len(), "something long") };
        assert_eq!(buf[7], 0);
        let text = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(text.to_str().unwrap(), "somethi");
    }

    #[test]
    fn test_version_is_nul_terminated() {
        let version = unsafe { std::ffi::CStr::from_ptr(hijack_get_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_exports_fail_when_uninitialized() {
        let _lock = lock();
        assert!(!hijack_enable_hook(0x1000));
        assert!(!hijack_track_callstack(0x1000, true));
        assert_eq!(hijack_begin_session(), 0);
        assert_eq!(hijack_get_trampoline(0x1000), 0);
        assert_eq!(unsafe { hijack_enable_hooks([1u64, 2].as_ptr(), 2) }, 2);
        assert_eq!(unsafe { hijack_drain_timers(std::ptr::null_mut(), 4) }, 0);

        let mut seen: Vec<Seen> = Vec::new();
        let user_data = &mut seen as *mut Vec<Seen> as *mut c_void;
        assert_eq!(unsafe { hijack_drain_events(Some(collect), user_data, 4) }, 0);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_drain_events_delivers_every_kind_in_order() {
        let _lock = lock();
        assert!(install(Engine::new(EngineConfig::default())));

        let timer = Timer::new(0x1000, TimerKind::Call);
        let mut registers = IntegerRegisters::default();
        registers.rdi = 0x55;
        with_engine(|engine| {
            engine.sink.add_string(0x2000, "render".to_string());
            engine.sink.add_callstack(0x77, &[0xA, 0xB]);
            engine.sink.add_timer(timer);
            engine.sink.add_arguments(ArgumentCapture {
                function_address: 0x1000,
                thread_id: 3,
                timestamp: 9,
                registers,
                stack: vec![1, 2, 3],
            });
        })
        .unwrap();

        let mut seen: Vec<Seen> = Vec::new();
        let user_data = &mut seen as *mut Vec<Seen> as *mut c_void;
        assert_eq!(unsafe { hijack_drain_events(None, user_data, 8) }, 0);
        assert_eq!(unsafe { hijack_drain_events(Some(collect), user_data, 3) }, 3);
        assert_eq!(unsafe { hijack_drain_events(Some(collect), user_data, 8) }, 1);
        assert_eq!(unsafe { hijack_drain_events(Some(collect), user_data, 8) }, 0);

        assert_eq!(
            seen,
            vec![
                Seen::String(0x2000, "render".to_string()),
                Seen::Callstack(0x77, vec![0xA, 0xB]),
                Seen::Timer(timer),
                Seen::Arguments(0x1000, 0x55, vec![1, 2, 3]),
            ]
        );
        assert!(shutdown());
    }
}
