//! End-to-end interception of real functions in this test binary
//!
//! Every test patches live code, so they run one at a time behind a
//! process-wide lock. Targets are called through `black_box`ed pointers so
//! the compiler cannot inline or constant-fold the call.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::collections::HashSet;
use std::ffi::c_char;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use hijack_core::capture::{current_thread_id, CaptureEvent, MemorySink};
use hijack_core::{CallHandler, Frame, HookError, HookManager, RegisterSnapshot, TimerKind};

static CALLS: AtomicU64 = AtomicU64::new(0);

fn lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}

/// Lock, fresh session, and an initialized manager recording into memory
fn setup() -> (MutexGuard<'static, ()>, HookManager, Arc<MemorySink>) {
    let guard = lock();
    hijack_core::capture::begin_session();
    let sink = Arc::new(MemorySink::new());
    let manager = HookManager::new(sink.clone());
    manager.initialize();
    (guard, manager, sink)
}

fn addr(f: extern "C" fn(u64) -> u64) -> u64 {
    f as usize as u64
}

fn call(f: extern "C" fn(u64) -> u64, x: u64) -> u64 {
    black_box(f)(black_box(x))
}

fn prologue(address: u64) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(address as *const u8, 16) }.to_vec()
}

#[inline(never)]
extern "C" fn timed_leaf(x: u64) -> u64 {
    CALLS.fetch_add(1, Ordering::SeqCst);
    black_box(x).wrapping_mul(3).wrapping_add(1)
}

#[inline(never)]
extern "C" fn nested_inner(x: u64) -> u64 {
    CALLS.fetch_add(2, Ordering::SeqCst);
    black_box(x) ^ 0x55
}

#[inline(never)]
extern "C" fn nested_outer(x: u64) -> u64 {
    CALLS.fetch_add(3, Ordering::SeqCst);
    let inner: extern "C" fn(u64) -> u64 = black_box(nested_inner);
    inner(black_box(x) + 1) + 2
}

#[inline(never)]
extern "C" fn fake_alloc(size: u64) -> u64 {
    CALLS.fetch_add(4, Ordering::SeqCst);
    0x7000_0000 | black_box(size).wrapping_mul(0x10)
}

#[inline(never)]
extern "C" fn toggled(x: u64) -> u64 {
    CALLS.fetch_add(5, Ordering::SeqCst);
    black_box(x).rotate_left(7)
}

#[inline(never)]
extern "C" fn scale(x: f64, y: f64, n: u64) -> f64 {
    CALLS.fetch_add(6, Ordering::SeqCst);
    black_box(x) * y + n as f64
}

#[inline(never)]
extern "C" fn fib(n: u64) -> u64 {
    CALLS.fetch_add(7, Ordering::SeqCst);
    if black_box(n) < 2 {
        return n;
    }
    let f: extern "C" fn(u64) -> u64 = black_box(fib);
    f(n - 1) + f(n - 2)
}

#[inline(never)]
extern "C" fn deep(n: u64) -> u64 {
    CALLS.fetch_add(8, Ordering::SeqCst);
    if black_box(n) == 0 {
        return 0;
    }
    let f: extern "C" fn(u64) -> u64 = black_box(deep);
    f(n - 1) + 1
}

#[inline(never)]
extern "C" fn add_seven(x: u64) -> u64 {
    CALLS.fetch_add(9, Ordering::SeqCst);
    black_box(x) + 7
}

#[inline(never)]
extern "C" fn helper(x: u64) -> u64 {
    CALLS.fetch_add(10, Ordering::SeqCst);
    black_box(x) | 0x100
}

#[inline(never)]
extern "C" fn threaded(x: u64) -> u64 {
    CALLS.fetch_add(11, Ordering::SeqCst);
    black_box(x).wrapping_sub(11)
}

#[inline(never)]
extern "C" fn removable(x: u64) -> u64 {
    CALLS.fetch_add(12, Ordering::SeqCst);
    black_box(x).wrapping_add(12)
}

#[inline(never)]
extern "C" fn stacked(x: u64) -> u64 {
    CALLS.fetch_add(13, Ordering::SeqCst);
    black_box(x).wrapping_add(13)
}

#[inline(never)]
extern "C" fn zone_begin(name: *const c_char) {
    CALLS.fetch_add(14, Ordering::SeqCst);
    black_box(name);
}

#[inline(never)]
extern "C" fn zone_end() {
    CALLS.fetch_add(15, Ordering::SeqCst);
    black_box(());
}

#[inline(never)]
extern "C" fn once_per_thread(x: u64) -> u64 {
    CALLS.fetch_add(16, Ordering::SeqCst);
    black_box(x).wrapping_add(16)
}

#[inline(never)]
extern "C" fn fake_read(fd: i32, len: u64) -> u64 {
    CALLS.fetch_add(17, Ordering::SeqCst);
    black_box(fd) as u64 + len
}

static TABLE: [u64; 8] = [2, 3, 5, 7, 11, 13, 17, 19];

/// Opens with RIP-relative accesses that the trampoline must relocate
#[inline(never)]
extern "C" fn table_lookup(i: u64) -> u64 {
    CALLS.fetch_add(18, Ordering::SeqCst);
    TABLE[(black_box(i) & 7) as usize]
}

#[test]
fn test_single_call_emits_one_timer() {
    let (_lock, manager, sink) = setup();
    let target = addr(timed_leaf);

    manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    assert_eq!(call(timed_leaf, 4), 13);

    let timers = sink.timers_for(target);
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].kind, TimerKind::Call);
    assert_eq!(timers[0].thread_id, current_thread_id());
    assert!(timers[0].start <= timers[0].end);
}

#[test]
fn test_trampoline_runs_original_without_recording() {
    let (_lock, manager, sink) = setup();
    let target = addr(removable);

    let trampoline = manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();
    assert_eq!(manager.trampoline(target), Some(trampoline));

    let original: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(trampoline as usize) };
    assert_eq!(call(original, 30), 42);
    assert!(sink.timers_for(target).is_empty());
}

#[test]
fn test_rip_relative_prologue_is_relocated() {
    let (_lock, manager, sink) = setup();
    let target = addr(table_lookup);

    let trampoline = manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();
    assert!(trampoline.abs_diff(target) < 1 << 31);

    let before = CALLS.load(Ordering::SeqCst);
    assert_eq!(call(table_lookup, 3), 7);
    assert_eq!(call(table_lookup, 12), 11);
    assert_eq!(CALLS.load(Ordering::SeqCst) - before, 36);

    let original: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(trampoline as usize) };
    assert_eq!(call(original, 7), 19);
    assert_eq!(sink.timers_for(target).len(), 2);
}

#[test]
fn test_nested_calls_are_properly_nested() {
    let (_lock, manager, sink) = setup();
    let outer = addr(nested_outer);
    let inner = addr(nested_inner);

    manager.create_timing_hook(outer).unwrap();
    manager.create_timing_hook(inner).unwrap();
    assert!(manager.enable_hooks(&[outer, inner]).is_empty());

    assert_eq!(call(nested_outer, 1), (2 ^ 0x55) + 2);

    let outer_timer = sink.timers_for(outer)[0];
    let inner_timer = sink.timers_for(inner)[0];
    assert!(outer_timer.start <= inner_timer.start);
    assert!(inner_timer.end <= outer_timer.end);
    assert_eq!(inner_timer.depth, outer_timer.depth + 1);

    // Inner finishes first
    let order: Vec<u64> = sink
        .timers()
        .iter()
        .map(|t| t.function_address)
        .collect();
    assert_eq!(order, vec![inner, outer]);
}

#[test]
fn test_alloc_records_pointer_and_size() {
    let (_lock, manager, sink) = setup();
    let target = addr(fake_alloc);

    manager.create_alloc_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    let pointer = call(fake_alloc, 48);

    let timer = sink.timers_for(target)[0];
    assert_eq!(timer.kind, TimerKind::Alloc);
    assert_eq!(timer.user_data, [pointer, 48]);
}

#[test]
fn test_disable_and_reenable_keeps_trampoline() {
    let (_lock, manager, sink) = setup();
    let target = addr(toggled);
    let original = prologue(target);

    let trampoline = manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();
    manager.disable_hook(target).unwrap();
    assert_eq!(prologue(target), original);

    call(toggled, 1);
    assert!(sink.timers_for(target).is_empty());

    manager.enable_hook(target).unwrap();
    assert!(manager.is_enabled(target));
    assert_eq!(manager.trampoline(target), Some(trampoline));

    call(toggled, 1);
    assert_eq!(sink.timers_for(target).len(), 1);
}

#[test]
fn test_float_arguments_and_return_survive() {
    let (_lock, manager, _sink) = setup();
    let target = scale as usize as u64;
    let f: extern "C" fn(f64, f64, u64) -> f64 = black_box(scale);
    let expected = f(1.5, -2.25, 3);

    manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    assert_eq!(f(1.5, -2.25, 3), expected);
}

#[test]
fn test_recursion_pairs_every_call() {
    let (_lock, manager, sink) = setup();
    let target = addr(fib);

    manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    assert_eq!(call(fib, 10), 55);

    let timers = sink.timers_for(target);
    assert_eq!(timers.len(), 177);
    assert_eq!(timers.iter().map(|t| t.depth).max(), Some(9));
    assert!(timers.iter().all(|t| t.start <= t.end));
}

struct Rewriter;

impl CallHandler for Rewriter {
    fn on_entry(&self, _function: u64, snapshot: &mut RegisterSnapshot, frame: &mut Frame) {
        frame.timer.user_data[0] = snapshot.integer.rdi;
        let doubled = snapshot.integer.rdi * 2;
        snapshot.set_arg(0, doubled);
    }

    fn on_exit(&self, _function: u64, snapshot: &mut RegisterSnapshot, _frame: &mut Frame) {
        snapshot.set_return_value(snapshot.return_value() + 1);
    }
}

#[test]
fn test_custom_handler_rewrites_arguments_and_result() {
    let (_lock, manager, sink) = setup();
    let target = addr(add_seven);

    manager.create_custom_hook(target, Arc::new(Rewriter)).unwrap();
    manager.enable_hook(target).unwrap();

    assert_eq!(call(add_seven, 5), 18);
    assert_eq!(sink.timers_for(target)[0].user_data[0], 5);
}

struct CallsHelper;

impl CallHandler for CallsHelper {
    fn on_entry(&self, _function: u64, _snapshot: &mut RegisterSnapshot, _frame: &mut Frame) {
        assert!(hijack_core::in_callback());
        call(helper, 1);
    }
}

#[test]
fn test_calls_from_callbacks_are_not_recorded() {
    let (_lock, manager, sink) = setup();
    let target = addr(add_seven);
    let inner = addr(helper);

    manager.create_custom_hook(target, Arc::new(CallsHelper)).unwrap();
    manager.create_timing_hook(inner).unwrap();
    assert!(manager.enable_hooks(&[target, inner]).is_empty());

    call(add_seven, 1);
    assert_eq!(sink.timers_for(target).len(), 1);
    assert!(sink.timers_for(inner).is_empty());

    call(helper, 1);
    assert_eq!(sink.timers_for(inner).len(), 1);
}

#[test]
fn test_threads_record_their_own_ids() {
    let (_lock, manager, sink) = setup();
    let target = addr(threaded);

    manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    let ids: Vec<u32> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                for i in 0..50 {
                    call(threaded, i);
                }
                current_thread_id()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let timers = sink.timers_for(target);
    assert_eq!(timers.len(), 200);
    let seen: HashSet<u32> = timers.iter().map(|t| t.thread_id).collect();
    assert_eq!(seen, ids.into_iter().collect());
    assert!(timers.iter().all(|t| t.depth == 0));
}

#[test]
fn test_remove_restores_original_bytes() {
    let (_lock, manager, sink) = setup();
    let target = addr(removable);
    let original = prologue(target);

    manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();
    assert_ne!(prologue(target), original);

    manager.remove_hook(target).unwrap();
    assert_eq!(prologue(target), original);
    assert!(!manager.is_hooked(target));
    assert!(matches!(
        manager.enable_hook(target),
        Err(HookError::NotFound(_))
    ));

    assert_eq!(call(removable, 1), 13);
    assert!(sink.timers_for(target).is_empty());

    // The address can be hooked again
    manager.create_timing_hook(target).unwrap();
}

#[test]
fn test_create_twice_is_rejected() {
    let (_lock, manager, _sink) = setup();
    let target = addr(timed_leaf);

    manager.create_timing_hook(target).unwrap();
    assert!(matches!(
        manager.create_alloc_hook(target),
        Err(HookError::AlreadyHooked(_))
    ));
    assert_eq!(manager.hooked_addresses(), vec![target]);
}

#[test]
fn test_tracked_callstack_is_sent_once() {
    let (_lock, manager, sink) = setup();
    let target = addr(stacked);

    manager.track_callstack(target);
    manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    for _ in 0..3 {
        call(stacked, 1);
    }

    let callstacks = sink.callstacks();
    assert!(!callstacks.is_empty());
    let known: HashSet<u64> = callstacks.iter().map(|(hash, _)| *hash).collect();
    assert_eq!(known.len(), callstacks.len());

    let timers = sink.timers_for(target);
    assert_eq!(timers.len(), 3);
    assert!(timers.iter().all(|t| known.contains(&t.callstack_hash)));
}

#[test]
fn test_zone_spans_start_and_stop() {
    let (_lock, manager, sink) = setup();
    let start = zone_begin as usize as u64;
    let stop = zone_end as usize as u64;

    manager.create_zone_start_hook(start).unwrap();
    manager.create_zone_stop_hook(stop).unwrap();
    assert!(manager.enable_hooks(&[start, stop]).is_empty());

    let name = c"render";
    let begin: extern "C" fn(*const c_char) = black_box(zone_begin);
    let end: extern "C" fn() = black_box(zone_end);
    begin(name.as_ptr());
    call(timed_leaf, 1);
    end();

    let zones: Vec<_> = sink
        .timers()
        .into_iter()
        .filter(|t| t.kind == TimerKind::Zone)
        .collect();
    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0].function_address, name.as_ptr() as u64);
    assert!(zones[0].start <= zones[0].end);
    assert!(sink.timers_for(start).is_empty());
    assert!(sink
        .strings()
        .contains(&(name.as_ptr() as u64, "render".to_string())));
}

#[test]
fn test_per_thread_unique_records_first_call() {
    let (_lock, manager, sink) = setup();
    let target = addr(once_per_thread);

    manager.create_per_thread_unique_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    for i in 0..5 {
        assert_eq!(call(once_per_thread, i), i + 16);
    }
    assert_eq!(sink.timers_for(target).len(), 1);

    manager.begin_session();
    call(once_per_thread, 0);
    let timers = sink.timers_for(target);
    assert_eq!(timers.len(), 2);
    assert!(timers
        .iter()
        .all(|t| t.kind == TimerKind::PerThreadUniqueCall));
}

#[test]
fn test_file_io_resolves_descriptor_path() {
    use std::os::fd::AsRawFd;

    let (_lock, manager, sink) = setup();
    let target = fake_read as usize as u64;
    let path = std::env::temp_dir().join(format!("hijack-io-{}.txt", std::process::id()));
    let file = std::fs::File::create(&path).unwrap();

    manager.create_file_io_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    let read: extern "C" fn(i32, u64) -> u64 = black_box(fake_read);
    read(file.as_raw_fd(), 8);
    read(file.as_raw_fd(), 8);

    let timers = sink.timers_for(target);
    assert_eq!(timers.len(), 2);
    // Upper half of an int argument register is unspecified
    assert_eq!(timers[0].user_data[0] as u32 as i32, file.as_raw_fd());

    let strings = sink.strings();
    assert_eq!(strings.len(), 1);
    assert_eq!(strings[0].0, timers[0].user_data[1]);
    assert!(strings[0].1.ends_with(path.file_name().unwrap().to_str().unwrap()));

    drop(file);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_sink_events_keep_call_order() {
    let (_lock, manager, sink) = setup();
    let target = addr(timed_leaf);

    manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();
    for i in 0..3 {
        call(timed_leaf, i);
    }

    let starts: Vec<u64> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            CaptureEvent::Timer(t) => Some(t.start),
            _ => None,
        })
        .collect();
    assert_eq!(starts.len(), 3);
    assert!(starts.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_depth_overflow_aborts() {
    if std::env::var_os("HIJACK_FATAL_CHILD").is_some() {
        let (_lock, manager, _sink) = setup();
        let target = addr(deep);
        manager.create_timing_hook(target).unwrap();
        manager.enable_hook(target).unwrap();
        call(deep, hijack_core::MAX_DEPTH as u64 + 4);
        return;
    }

    let exe = std::env::current_exe().unwrap();
    let status = std::process::Command::new(exe)
        .args(["--exact", "test_depth_overflow_aborts", "--nocapture", "--test-threads=1"])
        .env("HIJACK_FATAL_CHILD", "1")
        .status()
        .unwrap();
    assert!(!status.success(), "frame stack overflow should abort");
}

#[test]
fn test_depth_at_limit_is_fine() {
    let (_lock, manager, sink) = setup();
    let target = addr(deep);

    manager.create_timing_hook(target).unwrap();
    manager.enable_hook(target).unwrap();

    // One frame per level, including the call with n = 0
    let levels = hijack_core::MAX_DEPTH as u64 - 1;
    assert_eq!(call(deep, levels), levels);
    assert_eq!(sink.timers_for(target).len(), hijack_core::MAX_DEPTH);
}
