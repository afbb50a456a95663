//! Executable block allocation
//!
//! Every hook owns one fixed-size block holding its trampoline and its
//! prolog/epilog stubs. Blocks are carved from slabs allocated as close to
//! the hooked function as possible: the entry patch wants a 5-byte relative
//! jump, and relocated RIP-relative operands must still reach the data the
//! function addresses.
//!
//! Freed blocks are quarantined for [`QUARANTINE`] before reuse. A thread can
//! still be inside a stub for a few instructions after its hook's last
//! bookkeeping, so a block is never handed to a new hook right away.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// Page size (4KB on most systems)
const PAGE_SIZE: usize = 4096;

/// Slab size requested from the OS
const SLAB_SIZE: usize = PAGE_SIZE * 16;

/// Per-hook block size
pub const BLOCK_SIZE: usize = PAGE_SIZE;

/// Search window for near allocation
///
/// Half the rel32 reach, leaving the other half for RIP-relative operands
/// of the relocated prologue.
const NEAR_RANGE: usize = 0x4000_0000;

/// Distance between successive near-allocation hints
const HINT_STEP: usize = PAGE_SIZE * 64;

/// Minimum time a freed block waits before reuse
pub const QUARANTINE: Duration = Duration::from_secs(1);

/// Global block allocator
static ALLOCATOR: Mutex<BlockAllocator> = Mutex::new(BlockAllocator::new());

/// Allocator for executable hook blocks
struct BlockAllocator {
    /// Slabs, keyed by base address
    slabs: BTreeMap<usize, Slab>,
}

struct Slab {
    /// Bytes handed out by bumping
    used: usize,
    /// Blocks past their quarantine
    free: Vec<usize>,
    /// Freed blocks and when they were freed
    quarantined: Vec<(usize, Instant)>,
}

impl Slab {
    fn new() -> Self {
        Self {
            used: 0,
            free: Vec::new(),
            quarantined: Vec::new(),
        }
    }

    /// Move blocks whose quarantine is over to the free list
    fn release_expired(&mut self, now: Instant) {
        let free = &mut self.free;
        self.quarantined.retain(|&(block, freed_at)| {
            if now.saturating_duration_since(freed_at) >= QUARANTINE {
                free.push(block);
                false
            } else {
                true
            }
        });
    }

    fn take(&mut self, base: usize) -> Option<usize> {
        if let Some(block) = self.free.pop() {
            return Some(block);
        }
        if self.used + BLOCK_SIZE <= SLAB_SIZE {
            let block = base + self.used;
            self.used += BLOCK_SIZE;
            return Some(block);
        }
        None
    }

    fn owns(&self, block: usize) -> bool {
        self.free.contains(&block) || self.quarantined.iter().any(|&(b, _)| b == block)
    }
}

fn distance(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}

impl BlockAllocator {
    const fn new() -> Self {
        Self {
            slabs: BTreeMap::new(),
        }
    }

    /// Allocate a block, preferring the nearest one to `target`
    fn alloc(&mut self, target: usize, near: bool, now: Instant) -> Option<NonNull<u8>> {
        let in_range = |base: usize| !near || distance(base, target) < NEAR_RANGE;

        let mut candidates: Vec<usize> = self
            .slabs
            .keys()
            .copied()
            .filter(|&base| in_range(base))
            .collect();
        candidates.sort_by_key(|&base| distance(base, target));

        for base in candidates {
            let Some(slab) = self.slabs.get_mut(&base) else {
                continue;
            };
            slab.release_expired(now);
            if let Some(block) = slab.take(base) {
                return NonNull::new(block as *mut u8);
            }
        }

        let base = if near {
            self.alloc_slab_near(target)
                .or_else(|| self.alloc_slab_anywhere(target))?
        } else {
            self.alloc_slab_anywhere(target)?
        };
        let slab = self.slabs.get_mut(&base)?;
        let block = slab.take(base)?;
        NonNull::new(block as *mut u8)
    }

    /// Quarantine a block in the slab that owns it
    fn free(&mut self, block: usize, now: Instant) -> bool {
        let Some((&base, slab)) = self
            .slabs
            .range_mut(..=block)
            .next_back()
            .filter(|(base, _)| block < **base + SLAB_SIZE)
        else {
            return false;
        };
        if block >= base + slab.used || slab.owns(block) {
            return false;
        }
        slab.quarantined.push((block, now));
        true
    }

    fn insert_slab(&mut self, base: usize) {
        self.slabs.insert(base, Slab::new());
    }

    #[cfg(unix)]
    fn map_slab(hint: Option<usize>) -> Option<usize> {
        use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;

        let result = unsafe {
            mmap_anonymous(
                hint.and_then(NonZeroUsize::new),
                NonZeroUsize::new_unchecked(SLAB_SIZE),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        };
        result.ok().map(|ptr| ptr.as_ptr() as usize)
    }

    #[cfg(unix)]
    fn unmap_slab(base: usize) {
        if let Some(ptr) = NonNull::new(base as *mut std::ffi::c_void) {
            unsafe {
                let _ = nix::sys::mman::munmap(ptr, SLAB_SIZE);
            }
        }
    }

    /// Try hint addresses moving outward from `target`, nearest first
    #[cfg(unix)]
    fn alloc_slab_near(&mut self, target: usize) -> Option<usize> {
        let aligned = target & !(PAGE_SIZE - 1);

        for hint in near_hints(aligned) {
            let Some(base) = Self::map_slab(Some(hint)) else {
                continue;
            };

            // The kernel treats the hint as a suggestion
            if distance(base, target) < NEAR_RANGE {
                self.insert_slab(base);
                return Some(base);
            }
            Self::unmap_slab(base);
        }

        None
    }

    #[cfg(unix)]
    fn alloc_slab_anywhere(&mut self, target: usize) -> Option<usize> {
        match Self::map_slab(None) {
            Some(base) => {
                self.insert_slab(base);
                tracing::warn!(
                    "Hook block fallback: allocated at {:x} for target {:x}",
                    base,
                    target
                );
                Some(base)
            }
            None => {
                tracing::error!("Failed to allocate hook block for {:x}", target);
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn alloc_slab_near(&mut self, _target: usize) -> Option<usize> {
        None
    }

    #[cfg(not(unix))]
    fn alloc_slab_anywhere(&mut self, _target: usize) -> Option<usize> {
        None
    }
}

/// Hint addresses around `center`, alternating below and above it with
/// growing distance, all within [`NEAR_RANGE`]
fn near_hints(center: usize) -> impl Iterator<Item = usize> {
    (1..NEAR_RANGE / HINT_STEP)
        .flat_map(move |i| {
            let offset = i * HINT_STEP;
            [center.checked_sub(offset), center.checked_add(offset)]
        })
        .flatten()
        .filter(|&hint| hint >= PAGE_SIZE * 16)
}

/// Allocate a hook block, near `target` if `near` is set and possible
pub fn alloc_block(target: u64, near: bool) -> Option<NonNull<u8>> {
    ALLOCATOR.lock().alloc(target as usize, near, Instant::now())
}

/// Return a hook block; it becomes reusable after [`QUARANTINE`]
///
/// Returns `false` if the block is unknown or already free.
pub fn free_block(block: NonNull<u8>) -> bool {
    ALLOCATOR.lock().free(block.as_ptr() as usize, Instant::now())
}

/// Whether `to` is reachable from a 5-byte jump at `from`
pub fn within_rel32(from: u64, to: u64) -> bool {
    let disp = to.wrapping_sub(from.wrapping_add(5)) as i64;
    i32::try_from(disp).is_ok()
}
