//! CPU register snapshot captured by the prolog and epilog stubs
//!
//! The layout of [`RegisterSnapshot`] is the contract with the generated
//! machine code: the stubs store registers at the offsets exposed by the
//! `*_OFFSET` constants, and the engine reads and writes them through the
//! named fields. Modifications made by a callback are reflected in the CPU
//! state when the stub resumes.

use std::mem::offset_of;

/// XMM register (128-bit SIMD)
#[repr(C, align(16))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Xmm {
    pub data: [u8; 16],
}

impl Xmm {
    /// Interpret as 4 single-precision floats
    pub fn as_f32x4(&self) -> [f32; 4] {
        let d = &self.data;
        std::array::from_fn(|i| {
            let o = i * 4;
            f32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
        })
    }

    /// Interpret as 2 double-precision floats
    pub fn as_f64x2(&self) -> [f64; 2] {
        self.as_u64x2().map(f64::from_bits)
    }

    /// Interpret as 2 64-bit integers
    pub fn as_u64x2(&self) -> [u64; 2] {
        let d = &self.data;
        std::array::from_fn(|i| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&d[i * 8..(i + 1) * 8]);
            u64::from_le_bytes(word)
        })
    }

    /// Set from 4 single-precision floats
    pub fn set_f32x4(&mut self, values: [f32; 4]) {
        for (i, v) in values.iter().enumerate() {
            self.data[i * 4..(i + 1) * 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Set from 2 double-precision floats
    pub fn set_f64x2(&mut self, values: [f64; 2]) {
        for (i, v) in values.iter().enumerate() {
            self.data[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
        }
    }
}

impl Default for Xmm {
    fn default() -> Self {
        Self { data: [0u8; 16] }
    }
}

impl std::fmt::Debug for Xmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Xmm({:02x?})", &self.data[..])
    }
}

/// xmm0 through xmm15
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmmRegisters {
    pub xmm: [Xmm; 16],
}

/// General purpose registers plus RFLAGS
///
/// `rsp` holds the stack pointer as the hooked function saw it on entry
/// (pointing at the return address) and is read-only: the stubs never
/// restore it from the snapshot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegerRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
}

impl IntegerRegisters {
    /// Number of integer argument registers in the System V AMD64 ABI
    pub const ARG_REGISTERS: usize = 6;

    /// Integer argument registers in System V order: RDI, RSI, RDX, RCX, R8, R9
    pub fn arguments(&self) -> [u64; Self::ARG_REGISTERS] {
        [self.rdi, self.rsi, self.rdx, self.rcx, self.r8, self.r9]
    }
}

/// Full register state at an instruction boundary
///
/// Allocated on the stub's stack frame and only valid while the callback it
/// was handed to is running.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pub xmm: XmmRegisters,
    pub integer: IntegerRegisters,
}

impl RegisterSnapshot {
    /// Byte offset of `xmm[0]`
    pub const XMM_OFFSET: usize = offset_of!(RegisterSnapshot, xmm);

    /// Byte offset of the integer register block
    pub const INTEGER_OFFSET: usize = offset_of!(RegisterSnapshot, integer);

    /// Byte offset of `integer.rsp`
    pub const RSP_OFFSET: usize = Self::INTEGER_OFFSET + offset_of!(IntegerRegisters, rsp);

    /// Byte offset of `integer.rflags`
    pub const RFLAGS_OFFSET: usize = Self::INTEGER_OFFSET + offset_of!(IntegerRegisters, rflags);

    /// Get integer argument by index (System V AMD64 ABI)
    /// Arguments: RDI, RSI, RDX, RCX, R8, R9. Stack arguments are not
    /// reachable through the snapshot, see [`RegisterSnapshot::stack_arg`].
    pub fn arg(&self, index: usize) -> Option<u64> {
        self.integer.arguments().get(index).copied()
    }

    /// Set integer argument by index (System V AMD64 ABI)
    ///
    /// Returns `false` for stack-passed arguments.
    pub fn set_arg(&mut self, index: usize, value: u64) -> bool {
        let reg = match index {
            0 => &mut self.integer.rdi,
            1 => &mut self.integer.rsi,
            2 => &mut self.integer.rdx,
            3 => &mut self.integer.rcx,
            4 => &mut self.integer.r8,
            5 => &mut self.integer.r9,
            _ => return false,
        };
        *reg = value;
        true
    }

    /// Read a stack-passed integer argument (index 6 and above)
    ///
    /// # Safety
    /// Only meaningful in a prolog snapshot, and only for arguments the
    /// callee actually receives on the stack.
    pub unsafe fn stack_arg(&self, index: usize) -> Option<u64> {
        if index < IntegerRegisters::ARG_REGISTERS || self.integer.rsp == 0 {
            return None;
        }
        // Stack arguments start at RSP + 8 (after return address)
        let stack_index = index - IntegerRegisters::ARG_REGISTERS;
        Some(*((self.integer.rsp as *const u64).add(1 + stack_index)))
    }

    /// Get float argument from XMM register (System V: XMM0-7)
    pub fn float_arg(&self, index: usize) -> Option<f64> {
        (index < 8).then(|| self.xmm.xmm[index].as_f64x2()[0])
    }

    /// Set float argument in XMM register
    pub fn set_float_arg(&mut self, index: usize, value: f64) -> bool {
        if index >= 8 {
            return false;
        }
        self.xmm.xmm[index].set_f64x2([value, 0.0]);
        true
    }

    /// Integer return value (RAX); meaningful in an epilog snapshot
    pub fn return_value(&self) -> u64 {
        self.integer.rax
    }

    /// Replace the integer return value seen by the caller
    pub fn set_return_value(&mut self, value: u64) {
        self.integer.rax = value;
    }

    /// Floating point return value (low lane of XMM0)
    pub fn float_return_value(&self) -> f64 {
        self.xmm.xmm[0].as_f64x2()[0]
    }
}
