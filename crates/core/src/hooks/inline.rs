//! Inline function hooks
//!
//! A [`HookedFunction`] redirects the first bytes of a function to its
//! prolog stub. The displaced instructions live on in the trampoline, which
//! jumps back into the original body, so the function still runs unchanged
//! between the prolog and epilog callbacks.

use std::ptr::NonNull;
use std::sync::Arc;

use hijack_capture::CaptureSink;
use hijack_sdk::ArgLayout;

use super::context::{epilog_entry, prolog_entry, HookContext};
use super::patch::{self, abs_jump, write_code, ABS_JMP_SIZE, REL_JMP_SIZE};
use super::relocate::{relocate, MAX_PROLOGUE_READ};
use super::stub;
use super::trampoline::{alloc_block, free_block, within_rel32};
use super::{HookOptions, EPILOG_OFFSET, PROLOG_OFFSET, STUB_CAPACITY, TRAMPOLINE_CAPACITY};
use crate::error::HookError;
use crate::flavor::HookFlavor;

/// An installed (but not necessarily enabled) inline hook
pub struct HookedFunction {
    address: u64,
    /// Bytes the redirect overwrites
    original: Vec<u8>,
    redirect: Vec<u8>,
    block: NonNull<u8>,
    trampoline: u64,
    prolog_stub: u64,
    epilog_stub: u64,
    /// Boxed so the address baked into the stubs stays valid
    context: Box<HookContext>,
    enabled: bool,
}

// SAFETY: The block is owned exclusively by this hook; everything else is Send
unsafe impl Send for HookedFunction {}

impl HookedFunction {
    /// Prepare a hook for the function at `address`
    ///
    /// The target is not modified until [`HookedFunction::enable`].
    pub fn create(
        address: u64,
        flavor: HookFlavor,
        sink: Arc<dyn CaptureSink>,
        options: HookOptions,
    ) -> Result<Self, HookError> {
        if !cfg!(all(target_arch = "x86_64", unix)) {
            return Err(HookError::Unsupported);
        }
        if address == 0 {
            return Err(HookError::InvalidAddress(address));
        }

        let region = region::query(address as *const u8)
            .map_err(|_| HookError::InvalidAddress(address))?;
        if !region.is_executable() || !region.is_readable() {
            return Err(HookError::InvalidAddress(address));
        }

        let available = (region.as_range().end - address as usize).min(MAX_PROLOGUE_READ);
        let code = unsafe { std::slice::from_raw_parts(address as *const u8, available) }.to_vec();

        let block =
            alloc_block(address, options.near_allocation).ok_or(HookError::Allocation(address))?;

        match Self::build(address, &code, block, flavor, sink, options) {
            Ok(hook) => Ok(hook),
            Err(e) => {
                free_block(block);
                Err(e)
            }
        }
    }

    fn build(
        address: u64,
        code: &[u8],
        block: NonNull<u8>,
        flavor: HookFlavor,
        sink: Arc<dyn CaptureSink>,
        options: HookOptions,
    ) -> Result<Self, HookError> {
        let base = block.as_ptr() as u64;
        let trampoline = base;
        let prolog_stub = base + PROLOG_OFFSET as u64;
        let epilog_stub = base + EPILOG_OFFSET as u64;

        let min_len = if within_rel32(address, prolog_stub) {
            REL_JMP_SIZE
        } else {
            ABS_JMP_SIZE
        };
        let relocated = relocate(address, code, min_len, trampoline)?;

        let mut trampoline_code = relocated.code;
        trampoline_code.extend_from_slice(&abs_jump(address + relocated.patch_len as u64));
        if trampoline_code.len() > TRAMPOLINE_CAPACITY {
            return Err(HookError::RelocationFailed(format!(
                "relocated prologue of {:x} needs {} bytes",
                address,
                trampoline_code.len()
            )));
        }

        let context = Box::new(HookContext::new(
            address,
            flavor,
            trampoline,
            epilog_stub,
            sink,
            options,
        ));
        let context_ptr = &*context as *const HookContext as u64;

        let prolog = stub::build_prolog(
            prolog_stub,
            context_ptr,
            prolog_entry as usize as u64,
            trampoline,
        )?;
        let epilog = if context.flavor().has_epilog() {
            stub::build_epilog(epilog_stub, context_ptr, epilog_entry as usize as u64)?
        } else {
            Vec::new()
        };
        if prolog.len() > STUB_CAPACITY || epilog.len() > STUB_CAPACITY {
            return Err(HookError::Encode(format!(
                "stubs of {} and {} bytes exceed {}",
                prolog.len(),
                epilog.len(),
                STUB_CAPACITY
            )));
        }

        // The block is private RWX memory nothing executes yet
        unsafe {
            copy_to(trampoline, &trampoline_code);
            copy_to(prolog_stub, &prolog);
            copy_to(epilog_stub, &epilog);
        }

        let redirect = patch::redirect(address, prolog_stub, relocated.patch_len);
        let original = code[..relocated.patch_len].to_vec();

        tracing::debug!(
            "Prepared {} hook at {:x}: patch {} bytes, trampoline {:x}, prolog {:x}",
            context.flavor().name(),
            address,
            redirect.len(),
            trampoline,
            prolog_stub
        );

        Ok(Self {
            address,
            original,
            redirect,
            block,
            trampoline,
            prolog_stub,
            epilog_stub,
            context,
            enabled: false,
        })
    }

    /// Write the redirect; no-op if already enabled
    pub fn enable(&mut self) -> Result<(), HookError> {
        if self.enabled {
            return Ok(());
        }
        unsafe { write_code(self.address, &self.redirect)? };
        self.enabled = true;
        tracing::info!("Enabled hook at {:x}", self.address);
        Ok(())
    }

    /// Restore the original bytes; trampoline and stubs stay allocated
    pub fn disable(&mut self) -> Result<(), HookError> {
        if !self.enabled {
            return Ok(());
        }
        unsafe { write_code(self.address, &self.original)? };
        self.enabled = false;
        tracing::info!("Disabled hook at {:x}", self.address);
        Ok(())
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Entry of the original function body
    pub fn trampoline(&self) -> u64 {
        self.trampoline
    }

    pub fn prolog_stub(&self) -> u64 {
        self.prolog_stub
    }

    pub fn epilog_stub(&self) -> u64 {
        self.epilog_stub
    }

    pub fn original_bytes(&self) -> &[u8] {
        &self.original
    }

    pub fn flavor(&self) -> &HookFlavor {
        self.context.flavor()
    }

    /// Calls currently between prolog and epilog on any thread
    pub fn active_calls(&self) -> usize {
        self.context.active_calls()
    }

    pub fn set_track_callstack(&self, enabled: bool) {
        self.context.set_track_callstack(enabled);
    }

    pub fn set_arguments(&self, layout: Option<Arc<ArgLayout>>) {
        self.context.set_arguments(layout);
    }
}

impl Drop for HookedFunction {
    fn drop(&mut self) {
        if let Err(e) = self.disable() {
            tracing::error!("Failed to restore {:x} on drop: {}", self.address, e);
            // Leave the block mapped; the redirect still points into it
            return;
        }
        free_block(self.block);
        tracing::debug!("Released hook block for {:x}", self.address);
    }
}

unsafe fn copy_to(address: u64, bytes: &[u8]) {
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
}
