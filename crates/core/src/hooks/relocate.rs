//! Prologue relocation
//!
//! Copies the instructions a patch will overwrite to the trampoline,
//! re-encoding them for their new address so RIP-relative operands and
//! relative branches keep their targets.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use crate::error::HookError;

/// Longest x86-64 instruction
const MAX_INSTRUCTION_LEN: usize = 15;

/// Bytes to read from the target to cover any patch
pub const MAX_PROLOGUE_READ: usize = 32 + MAX_INSTRUCTION_LEN;

/// Re-encoded prologue
#[derive(Debug)]
pub struct Relocated {
    /// Relocated instructions, without the jump back
    pub code: Vec<u8>,
    /// Number of original bytes covered by whole instructions
    pub patch_len: usize,
    pub instructions: usize,
}

/// Decode whole instructions at `address` until `min_len` bytes are covered
/// and re-encode them at `new_ip`
///
/// Fails with [`HookError::TooShort`] if the function ends (return,
/// unconditional jump, padding, undecodable bytes) before that.
pub fn relocate(
    address: u64,
    code: &[u8],
    min_len: usize,
    new_ip: u64,
) -> Result<Relocated, HookError> {
    let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut instr = Instruction::default();
    let mut covered = 0usize;

    while covered < min_len {
        if !decoder.can_decode() {
            return Err(HookError::TooShort(address));
        }
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            return Err(HookError::TooShort(address));
        }

        let end = covered + instr.len();
        match instr.flow_control() {
            // Padding or a trap: the function is already over
            FlowControl::Interrupt | FlowControl::Exception => {
                return Err(HookError::TooShort(address));
            }
            // Whatever follows may belong to another function
            FlowControl::Return | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
                if end < min_len =>
            {
                return Err(HookError::TooShort(address));
            }
            _ => {}
        }

        instructions.push(instr);
        covered = end;
    }

    let block = InstructionBlock::new(&instructions, new_ip);
    let result = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map_err(|e| HookError::RelocationFailed(e.to_string()))?;

    tracing::debug!(
        "Relocated {} instructions ({} bytes) from {:x} to {:x}",
        instructions.len(),
        covered,
        address,
        new_ip
    );

    Ok(Relocated {
        code: result.code_buffer,
        patch_len: covered,
        instructions: instructions.len(),
    })
}
