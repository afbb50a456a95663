//! Jump encoding and live code patching
//!
//! Patches are written while other threads may be executing the target.
//! A patch that fits in one aligned 8-byte word is a single atomic store.
//! Longer patches first park arriving threads on a 2-byte `jmp $`, write
//! the body, then store the real first two bytes.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use region::Protection;

use crate::error::HookError;

/// `jmp rel32`
pub const REL_JMP_SIZE: usize = 5;

/// `jmp [rip+0]` followed by the 8-byte target
pub const ABS_JMP_SIZE: usize = 14;

/// `jmp $`, a two-byte jump to itself
const SPIN: [u8; 2] = [0xEB, 0xFE];

const INT3: u8 = 0xCC;

/// Encode a 5-byte relative jump placed at `from`
///
/// Returns `None` when `to` is out of rel32 reach.
pub fn rel_jump(from: u64, to: u64) -> Option<[u8; REL_JMP_SIZE]> {
    let disp = to.wrapping_sub(from.wrapping_add(REL_JMP_SIZE as u64)) as i64;
    let disp = i32::try_from(disp).ok()?;
    let mut code = [0u8; REL_JMP_SIZE];
    code[0] = 0xE9;
    code[1..].copy_from_slice(&disp.to_le_bytes());
    Some(code)
}

/// Encode a position-independent 14-byte absolute jump
pub fn abs_jump(to: u64) -> [u8; ABS_JMP_SIZE] {
    let mut code = [0u8; ABS_JMP_SIZE];
    code[0] = 0xFF;
    code[1] = 0x25;
    // disp32 = 0: the target follows the instruction
    code[6..].copy_from_slice(&to.to_le_bytes());
    code
}

/// Bytes that replace a function's first `patch_len` bytes
///
/// Uses the short form when reachable; leftover bytes become `int3`.
pub fn redirect(from: u64, to: u64, patch_len: usize) -> Vec<u8> {
    let mut code = match rel_jump(from, to) {
        Some(jump) if patch_len >= REL_JMP_SIZE => jump.to_vec(),
        _ => abs_jump(to).to_vec(),
    };
    if code.len() < patch_len {
        code.resize(patch_len, INT3);
    }
    code
}

/// Store `bytes` at `address` with a single 8-byte atomic store
///
/// Caller guarantees the range does not cross an aligned 8-byte boundary
/// and the memory is writable.
unsafe fn store_in_word(address: u64, bytes: &[u8]) {
    let aligned = address & !7;
    let offset = (address - aligned) as usize;
    let word = &*(aligned as *const AtomicU64);

    let mut value = word.load(Ordering::Acquire).to_le_bytes();
    value[offset..offset + bytes.len()].copy_from_slice(bytes);
    word.store(u64::from_le_bytes(value), Ordering::Release);
}

fn fits_in_word(address: u64, len: usize) -> bool {
    (address & 7) as usize + len <= 8
}

/// Store a short prefix as one atomic write
unsafe fn store_head(address: u64, bytes: &[u8]) {
    match bytes {
        [first, second] if !fits_in_word(address, 2) => {
            store_pair(address, u16::from_le_bytes([*first, *second]))
        }
        _ => store_in_word(address, bytes),
    }
}

/// Two bytes crossing an 8-byte boundary; a locked `xchg` stays atomic
/// when misaligned
#[cfg(target_arch = "x86_64")]
unsafe fn store_pair(address: u64, value: u16) {
    std::arch::asm!(
        "xchg word ptr [{0}], {1:x}",
        in(reg) address,
        inout(reg) value => _,
        options(nostack),
    );
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn store_pair(address: u64, value: u16) {
    let dst = address as *mut u8;
    let [first, second] = value.to_le_bytes();
    // Second byte first so the opcode never pairs with a stale operand
    std::ptr::write_volatile(dst.add(1), second);
    fence(Ordering::SeqCst);
    std::ptr::write_volatile(dst, first);
}

/// Overwrite live code
///
/// # Safety
/// `address..address + bytes.len()` must be mapped code that no thread is
/// executing in the middle of, other than at its first byte.
pub unsafe fn write_code(address: u64, bytes: &[u8]) -> Result<(), HookError> {
    if bytes.is_empty() {
        return Ok(());
    }

    let _guard = region::protect_with_handle(
        address as *const u8,
        bytes.len(),
        Protection::READ_WRITE_EXECUTE,
    )
    .map_err(|e| HookError::MemoryProtection(e.to_string()))?;

    if fits_in_word(address, bytes.len()) {
        store_in_word(address, bytes);
        return Ok(());
    }

    let head = SPIN.len().min(bytes.len());
    store_head(address, &SPIN[..head]);
    fence(Ordering::SeqCst);

    let dst = address as *mut u8;
    for (i, b) in bytes.iter().enumerate().skip(head) {
        std::ptr::write_volatile(dst.add(i), *b);
    }
    fence(Ordering::SeqCst);

    store_head(address, &bytes[..head]);
    Ok(())
}
