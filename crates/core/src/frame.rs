//! Per-thread frame stack
//!
//! One [`Frame`] exists for every intercepted call that is currently
//! executing on a thread. The stack is a fixed array so pushing and popping
//! never reach the allocator, which may itself be hooked.

use hijack_sdk::{IntegerRegisters, Timer};

use crate::error::fatal;

/// Maximum nesting of intercepted calls on one thread
pub const MAX_DEPTH: usize = 64;

/// Bookkeeping for one in-flight intercepted call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame {
    /// Where the caller expects to resume
    pub return_address: u64,
    /// Stack address holding the return address, overwritten with the
    /// epilog stub while the call is in flight
    pub return_slot: u64,
    pub timer: Timer,
    /// Integer argument registers as seen on entry
    pub arguments: [u64; IntegerRegisters::ARG_REGISTERS],
    /// Entered from inside a prolog or epilog callback; nothing is recorded
    pub is_internal: bool,
    /// 0 when no callstack was captured
    pub callstack_hash: u64,
    /// Capture session the call started in
    pub session: u64,
}

/// Fixed-capacity LIFO of [`Frame`]s
///
/// Overflow and underflow abort the process: either one means the thread's
/// return addresses can no longer be restored.
pub struct FrameStack {
    frames: [Frame; MAX_DEPTH],
    len: usize,
}

impl FrameStack {
    pub fn new() -> Self {
        Self {
            frames: [Frame::default(); MAX_DEPTH],
            len: 0,
        }
    }

    /// Push a frame and return the new depth
    pub fn push(&mut self, frame: Frame) -> usize {
        if self.len >= MAX_DEPTH {
            fatal("frame stack overflow");
        }
        self.frames[self.len] = frame;
        self.len += 1;
        self.len
    }

    pub fn pop(&mut self) -> Frame {
        if self.len == 0 {
            fatal("frame stack underflow on pop");
        }
        self.len -= 1;
        self.frames[self.len]
    }

    pub fn top(&self) -> &Frame {
        if self.len == 0 {
            fatal("frame stack underflow on top");
        }
        &self.frames[self.len - 1]
    }

    pub fn top_mut(&mut self) -> &mut Frame {
        if self.len == 0 {
            fatal("frame stack underflow on top");
        }
        &mut self.frames[self.len - 1]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop every frame
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Keep live frames for return-address restoration but stop them from
    /// recording anything
    pub fn retire_all(&mut self) {
        for frame in &mut self.frames[..self.len] {
            frame.is_internal = true;
        }
    }

    /// Live frames, outermost first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Frame> {
        self.frames[..self.len].iter()
    }

    /// Original return address of the live frame owning `slot`
    pub fn original_return_address(&self, slot: u64) -> Option<u64> {
        self.iter()
            .rev()
            .find(|f| f.return_slot == slot)
            .map(|f| f.return_address)
    }
}

impl Default for FrameStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    const CHILD_ENV: &str = "HIJACK_FATAL_CHILD";

    /// Re-run a single test in a child process and check that it aborted
    fn assert_aborts(test_name: &str) {
        let exe = std::env::current_exe().unwrap();
        let status = Command::new(exe)
            .args(["--exact", test_name, "--nocapture", "--test-threads=1"])
            .env(CHILD_ENV, "1")
            .status()
            .unwrap();
        assert!(!status.success(), "{test_name} should have aborted");
    }

    fn in_child() -> bool {
        std::env::var_os(CHILD_ENV).is_some()
    }

    fn frame(return_address: u64) -> Frame {
        Frame {
            return_address,
            return_slot: return_address + 0x1000,
            ..Frame::default()
        }
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut stack = FrameStack::new();
        assert_eq!(stack.push(frame(1)), 1);
        assert_eq!(stack.push(frame(2)), 2);
        assert_eq!(stack.top().return_address, 2);
        assert_eq!(stack.pop().return_address, 2);
        assert_eq!(stack.pop().return_address, 1);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_fills_to_capacity() {
        let mut stack = FrameStack::new();
        for i in 0..MAX_DEPTH as u64 {
            stack.push(frame(i));
        }
        assert_eq!(stack.len(), MAX_DEPTH);
        assert_eq!(stack.top().return_address, MAX_DEPTH as u64 - 1);
    }

    #[test]
    fn test_retire_keeps_return_addresses() {
        let mut stack = FrameStack::new();
        stack.push(frame(10));
        stack.push(frame(20));
        stack.retire_all();

        assert!(stack.iter().all(|f| f.is_internal));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.original_return_address(20 + 0x1000), Some(20));
        assert_eq!(stack.original_return_address(0x5), None);
    }

    #[test]
    fn test_reset_empties() {
        let mut stack = FrameStack::new();
        stack.push(frame(1));
        stack.top_mut().callstack_hash = 7;
        assert_eq!(stack.top().callstack_hash, 7);
        stack.reset();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_push_overflow_aborts() {
        if in_child() {
            let mut stack = FrameStack::new();
            for i in 0..=MAX_DEPTH as u64 {
                stack.push(frame(i));
            }
            return;
        }
        assert_aborts("frame::tests::test_push_overflow_aborts");
    }

    #[test]
    fn test_pop_underflow_aborts() {
        if in_child() {
            let mut stack = FrameStack::new();
            stack.pop();
            return;
        }
        assert_aborts("frame::tests::test_pop_underflow_aborts");
    }

    #[test]
    fn test_top_underflow_aborts() {
        if in_child() {
            let stack = FrameStack::new();
            let _ = stack.top();
            return;
        }
        assert_aborts("frame::tests::test_top_underflow_aborts");
    }
}
