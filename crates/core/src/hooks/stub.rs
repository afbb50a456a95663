//! Prolog and epilog stub generation
//!
//! Both stubs build a [`RegisterSnapshot`] on the stack, call into Rust with
//! `(context, snapshot, return_slot)`, and restore every register from the
//! snapshot afterwards, so callbacks can rewrite arguments and return
//! values.
//!
//! Stack layout while the callback runs (rsp is 16-byte aligned):
//!
//! ```text
//! rsp + FRAME_SIZE    return slot (caller's return address / epilog push)
//! rsp + 400           padding
//! rsp + 0             RegisterSnapshot
//! ```
//!
//! Only `lea` and `mov` touch rsp before flags are saved and after they are
//! restored, so RFLAGS survives the round trip.

use std::mem::{offset_of, size_of};

use iced_x86::code_asm::*;
use iced_x86::IcedError;

use hijack_sdk::{IntegerRegisters, RegisterSnapshot};

use super::patch::abs_jump;
use crate::error::HookError;

const SNAPSHOT_SIZE: i32 = size_of::<RegisterSnapshot>() as i32;

/// Bytes reserved below the return slot; keeps rsp aligned for the call
pub const FRAME_SIZE: i32 = SNAPSHOT_SIZE + 8;

const RSP_OFFSET: i32 = RegisterSnapshot::RSP_OFFSET as i32;
const RFLAGS_OFFSET: i32 = RegisterSnapshot::RFLAGS_OFFSET as i32;

const fn gpr(offset: usize) -> i32 {
    (RegisterSnapshot::INTEGER_OFFSET + offset) as i32
}

/// Saved general purpose registers and their snapshot offsets (rsp excluded)
fn general_registers() -> [(AsmRegister64, i32); 15] {
    [
        (rax, gpr(offset_of!(IntegerRegisters, rax))),
        (rbx, gpr(offset_of!(IntegerRegisters, rbx))),
        (rcx, gpr(offset_of!(IntegerRegisters, rcx))),
        (rdx, gpr(offset_of!(IntegerRegisters, rdx))),
        (rsi, gpr(offset_of!(IntegerRegisters, rsi))),
        (rdi, gpr(offset_of!(IntegerRegisters, rdi))),
        (rbp, gpr(offset_of!(IntegerRegisters, rbp))),
        (r8, gpr(offset_of!(IntegerRegisters, r8))),
        (r9, gpr(offset_of!(IntegerRegisters, r9))),
        (r10, gpr(offset_of!(IntegerRegisters, r10))),
        (r11, gpr(offset_of!(IntegerRegisters, r11))),
        (r12, gpr(offset_of!(IntegerRegisters, r12))),
        (r13, gpr(offset_of!(IntegerRegisters, r13))),
        (r14, gpr(offset_of!(IntegerRegisters, r14))),
        (r15, gpr(offset_of!(IntegerRegisters, r15))),
    ]
}

fn xmm_registers() -> [AsmRegisterXmm; 16] {
    [
        xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
        xmm14, xmm15,
    ]
}

fn xmm_offset(index: usize) -> i32 {
    (RegisterSnapshot::XMM_OFFSET + index * 16) as i32
}

/// Fill the snapshot at `[rsp]`; rsp must already be lowered by FRAME_SIZE
fn save_state(a: &mut CodeAssembler) -> Result<(), IcedError> {
    for (reg, offset) in general_registers() {
        a.mov(qword_ptr(rsp + offset), reg)?;
    }
    a.pushfq()?;
    a.pop(rax)?;
    a.mov(qword_ptr(rsp + RFLAGS_OFFSET), rax)?;
    a.lea(rax, qword_ptr(rsp + FRAME_SIZE))?;
    a.mov(qword_ptr(rsp + RSP_OFFSET), rax)?;
    for (i, reg) in xmm_registers().into_iter().enumerate() {
        a.movdqu(xmmword_ptr(rsp + xmm_offset(i)), reg)?;
    }
    Ok(())
}

/// Load every register back from the snapshot at `[rsp]`
fn restore_state(a: &mut CodeAssembler) -> Result<(), IcedError> {
    for (i, reg) in xmm_registers().into_iter().enumerate() {
        a.movdqu(reg, xmmword_ptr(rsp + xmm_offset(i)))?;
    }
    a.mov(rax, qword_ptr(rsp + RFLAGS_OFFSET))?;
    a.push(rax)?;
    a.popfq()?;
    for (reg, offset) in general_registers() {
        a.mov(reg, qword_ptr(rsp + offset))?;
    }
    Ok(())
}

/// `entry(context, &mut snapshot, return_slot)`
fn call_entry(a: &mut CodeAssembler, context: u64, entry: u64) -> Result<(), IcedError> {
    a.cld()?;
    a.mov(rdi, context)?;
    a.mov(rsi, rsp)?;
    a.lea(rdx, qword_ptr(rsp + FRAME_SIZE))?;
    a.mov(rax, entry)?;
    a.call(rax)?;
    Ok(())
}

/// Generate the prolog stub placed at `ip`
///
/// Entered by the patched jump with the caller's return address at `[rsp]`.
/// Leaves through the trampoline with all registers as restored from the
/// snapshot.
pub fn build_prolog(ip: u64, context: u64, entry: u64, trampoline: u64) -> Result<Vec<u8>, HookError> {
    let mut a = CodeAssembler::new(64)?;
    a.lea(rsp, qword_ptr(rsp - FRAME_SIZE))?;
    save_state(&mut a)?;
    call_entry(&mut a, context, entry)?;
    restore_state(&mut a)?;
    a.lea(rsp, qword_ptr(rsp + FRAME_SIZE))?;

    let mut code = a.assemble(ip)?;
    code.extend_from_slice(&abs_jump(trampoline));
    Ok(code)
}

/// Generate the epilog stub placed at `ip`
///
/// Entered by the hooked function's `ret`. The entry point writes the real
/// return address into the slot pushed here, and the final `ret` uses it.
pub fn build_epilog(ip: u64, context: u64, entry: u64) -> Result<Vec<u8>, HookError> {
    let mut a = CodeAssembler::new(64)?;
    a.push(0i32)?;
    a.lea(rsp, qword_ptr(rsp - FRAME_SIZE))?;
    save_state(&mut a)?;
    call_entry(&mut a, context, entry)?;
    restore_state(&mut a)?;
    a.lea(rsp, qword_ptr(rsp + FRAME_SIZE))?;
    a.ret()?;

    Ok(a.assemble(ip)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, Register};

    const IP: u64 = 0x7f00_0000_1000;

    fn decode(code: &[u8]) -> Vec<Instruction> {
        Decoder::with_ip(64, code, IP, DecoderOptions::NONE)
            .into_iter()
            .collect()
    }

    #[test]
    fn test_frame_keeps_call_aligned() {
        // Entry rsp is 8 mod 16 in the prolog and after the push in the epilog
        assert_eq!(SNAPSHOT_SIZE, 400);
        assert_eq!((8 - FRAME_SIZE).rem_euclid(16), 0);
    }

    #[test]
    fn test_prolog_shape() {
        let trampoline = 0x7f00_0000_0000;
        let code = build_prolog(IP, 0x7f00_1111_0000, 0x7f00_2222_0000, trampoline).unwrap();
        let instrs = decode(&code[..code.len() - 14]);

        let first = instrs[0];
        assert_eq!(first.mnemonic(), Mnemonic::Lea);
        assert_eq!(first.op0_register(), Register::RSP);

        assert!(instrs.iter().any(|i| i.code() == Code::Pushfq));
        assert!(instrs.iter().any(|i| i.code() == Code::Popfq));
        assert!(instrs.iter().any(|i| i.mnemonic() == Mnemonic::Cld));
        assert!(instrs
            .iter()
            .any(|i| i.code() == Code::Mov_r64_imm64 && i.immediate64() == 0x7f00_1111_0000));
        assert_eq!(
            instrs.iter().filter(|i| i.mnemonic() == Mnemonic::Movdqu).count(),
            32
        );

        // Ends with jmp [rip+0]; dq trampoline
        let tail = &code[code.len() - 14..];
        assert_eq!(tail, abs_jump(trampoline));
        assert!(code.len() < 1024);
    }

    #[test]
    fn test_epilog_shape() {
        let code = build_epilog(IP, 0x7f00_1111_0000, 0x7f00_3333_0000).unwrap();
        let instrs = decode(&code);

        assert_eq!(instrs[0].mnemonic(), Mnemonic::Push);
        assert_eq!(instrs.last().unwrap().mnemonic(), Mnemonic::Ret);
        assert!(instrs
            .iter()
            .any(|i| i.code() == Code::Mov_r64_imm64 && i.immediate64() == 0x7f00_3333_0000));
        assert!(code.len() < 1024);
    }

    #[test]
    fn test_no_flag_writes_outside_saved_region() {
        // Nothing between entry and pushfq may modify flags
        let code = build_prolog(IP, 1, 2, 3).unwrap();
        let instrs = decode(&code[..code.len() - 14]);
        let pushfq = instrs.iter().position(|i| i.code() == Code::Pushfq).unwrap();
        assert!(instrs[..pushfq]
            .iter()
            .all(|i| matches!(i.mnemonic(), Mnemonic::Lea | Mnemonic::Mov)));

        let popfq = instrs.iter().position(|i| i.code() == Code::Popfq).unwrap();
        assert!(instrs[popfq + 1..]
            .iter()
            .all(|i| matches!(i.mnemonic(), Mnemonic::Lea | Mnemonic::Mov)));
    }
}
