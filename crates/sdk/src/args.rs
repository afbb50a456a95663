//! Argument layout descriptors and captured argument payloads
//!
//! Layouts come from the symbol resolution side (which knows a function's
//! prototype); the engine only copies the bytes they describe.

use crate::registers::IntegerRegisters;

/// One named argument living in the stack argument area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSlot {
    pub name: String,
    /// Offset from the first stack-passed argument
    pub offset: u32,
    pub size: u32,
}

/// Argument layout of a hooked function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgLayout {
    /// Number of bytes of stack-passed arguments to copy on entry
    pub stack_bytes: u32,
    pub args: Vec<ArgSlot>,
}

impl ArgLayout {
    pub fn new(stack_bytes: u32) -> Self {
        Self {
            stack_bytes,
            args: Vec::new(),
        }
    }

    /// Builder-style slot registration
    pub fn with_arg(mut self, name: &str, offset: u32, size: u32) -> Self {
        self.args.push(ArgSlot {
            name: name.to_string(),
            offset,
            size,
        });
        self
    }

    /// Whether every slot fits inside the copied stack area
    pub fn is_consistent(&self) -> bool {
        self.args
            .iter()
            .all(|a| a.offset.saturating_add(a.size) <= self.stack_bytes)
    }
}

/// Arguments captured at the entry of a hooked function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentCapture {
    pub function_address: u64,
    pub thread_id: u32,
    pub timestamp: u64,
    pub registers: IntegerRegisters,
    /// Raw copy of `ArgLayout::stack_bytes` bytes above the return address
    pub stack: Vec<u8>,
}

impl ArgumentCapture {
    /// Bytes of a named slot, if the layout placed it inside the copy
    pub fn slot<'a>(&'a self, layout: &ArgLayout, name: &str) -> Option<&'a [u8]> {
        let slot = layout.args.iter().find(|a| a.name == name)?;
        let start = slot.offset as usize;
        self.stack.get(start..start + slot.size as usize)
    }
}
