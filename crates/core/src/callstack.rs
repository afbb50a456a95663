//! Callstack capture for tracked functions
//!
//! Walks the frame-pointer chain starting at a hooked function's entry.
//! Return addresses that currently point at an epilog stub are replaced with
//! the caller addresses saved in the thread's frame stack, so a callstack
//! looks the same whether or not its callers are hooked.

use crate::frame::FrameStack;
use crate::memory::safe_read_u64;

/// Upper bound on captured frames, whatever the configuration says
pub const MAX_CALLSTACK_DEPTH: usize = 128;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001B3;

/// FNV-1a 64-bit hash (compile-time capable)
pub const fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < data.len() {
        hash ^= data[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Hash of a list of return addresses
///
/// Never 0, which is reserved for "no callstack".
pub fn callstack_hash(frames: &[u64]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for frame in frames {
        for byte in frame.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash.max(1)
}

/// Fixed-capacity callstack filled without allocating
pub struct Callstack {
    frames: [u64; MAX_CALLSTACK_DEPTH],
    len: usize,
}

impl Callstack {
    pub fn new() -> Self {
        Self {
            frames: [0; MAX_CALLSTACK_DEPTH],
            len: 0,
        }
    }

    fn push(&mut self, address: u64) -> bool {
        if self.len >= MAX_CALLSTACK_DEPTH {
            return false;
        }
        self.frames[self.len] = address;
        self.len += 1;
        true
    }

    pub fn frames(&self) -> &[u64] {
        &self.frames[..self.len]
    }

    pub fn hash(&self) -> u64 {
        callstack_hash(self.frames())
    }
}

impl Default for Callstack {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the callstack of a function that was just entered
///
/// * `return_address` - the value in the entry return slot
/// * `rbp` - the caller's frame pointer (the callee has not pushed its own)
/// * `frames` - live frames, used to undo return-address redirection
pub fn walk(return_address: u64, rbp: u64, max_depth: usize, frames: &FrameStack) -> Callstack {
    let mut stack = Callstack::new();
    let max_depth = max_depth.min(MAX_CALLSTACK_DEPTH);
    if max_depth == 0 || return_address == 0 {
        return stack;
    }
    stack.push(return_address);

    let mut rbp = rbp;
    while stack.len < max_depth {
        if rbp == 0 || rbp & 0x7 != 0 {
            break;
        }
        let Some(prev_rbp) = safe_read_u64(rbp) else {
            break;
        };
        let slot = rbp + 8;
        let Some(mut ret) = safe_read_u64(slot) else {
            break;
        };
        if ret == 0 {
            break;
        }
        if let Some(original) = frames.original_return_address(slot) {
            ret = original;
        }
        if !stack.push(ret) || prev_rbp <= rbp {
            break;
        }
        rbp = prev_rbp;
    }

    stack
}
