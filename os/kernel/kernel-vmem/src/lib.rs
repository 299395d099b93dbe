//! # Virtual Memory Support
//!
//! Architecture-neutral page-table walker with pluggable page-table-entry
//! codecs for x86-64, arm64 and riscv64 (Sv39).
//!
//! ## What you get
//! - A [`PageTable`] that maps, unmaps, re-protects and walks ranges of
//!   virtual memory, allocating intermediate tables lazily and reclaiming them
//!   as soon as they become empty.
//! - A [`PteCodec`] trait with one implementation per architecture
//!   ([`X86_64`], [`Aarch64`], [`Sv39`]) that owns every bit of the hardware
//!   entry layout, the canonical-address rules, TLB maintenance and the
//!   page-table base register.
//! - Architecture-neutral [`Attributes`] (read/write/execute plus caching).
//! - The allocator/mapper seams ([`FrameAlloc`], [`PhysMapper`]) and a
//!   [`TlbShootdown`] hook for cross-CPU invalidation.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! All supported schemes use 4 KiB base pages and 512 eight-byte entries per
//! table, so every level consumes nine bits of the virtual address:
//!
//! ```text
//! x86-64 / arm64 (48-bit):
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L3   |  L2   |  L1   |  L0   | Offset |
//!
//! riscv64 Sv39 (39-bit):
//!         | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//!         |  L2   |  L1   |  L0   | Offset |
//! ```
//!
//! Levels are numbered from the leaf upwards so that the number of a level is
//! the same on every architecture:
//!
//! | Level | x86-64 | arm64 | Sv39 | Leaf size |
//! |:------|:-------|:------|:-----|:----------|
//! | 3 | PML4 | L0 | – | – |
//! | 2 | PDPT | L1 | root | 1 GiB |
//! | 1 | PD | L2 | L1 | 2 MiB |
//! | 0 | PT | L3 | L0 | 4 KiB |
//!
//! ### Leaf vs. non-leaf entries
//!
//! - A **leaf entry** maps memory directly: physical base plus permissions.
//!   Level 0 entries are always leaves; levels 1 and 2 may hold huge leaves.
//! - A **non-leaf entry** points at the next lower table. Which bit pattern
//!   distinguishes the two is decided by the codec (`PS` on x86-64, the
//!   descriptor type bit on arm64, `R|W|X != 0` on riscv).

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod arch;
mod attributes;
pub mod page_table;
mod tlb;

extern crate alloc;

pub use crate::arch::{Aarch64, PteCodec, Sv39, X86_64};
pub use crate::attributes::Attributes;
pub use crate::page_table::{FramePolicy, Occupied, PageTable, PageTableError, Translation};
pub use crate::tlb::{LOCAL_ONLY, LocalOnly, TlbShootdown};
pub use kernel_memory_addresses as addresses;

#[cfg(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64"
))]
pub use crate::arch::Native;

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Source of **physical** 4 KiB frames for page tables and mapped memory.
///
/// Frames are a global resource shared by all address spaces, so the
/// implementation is expected to synchronize internally; every method takes
/// `&self`.
pub trait FrameAlloc {
    /// Allocate `count` physically contiguous 4 KiB frames.
    ///
    /// The returned base is aligned to `count` rounded up to a power of two
    /// frames. Returns `None` on out-of-memory.
    fn alloc_frames(&self, count: usize) -> Option<PhysicalAddress>;

    /// Return `count` frames starting at `base` to the allocator.
    fn free_frames(&self, base: PhysicalAddress, count: usize);

    /// Allocate one 4 KiB frame.
    #[inline]
    fn alloc_4k(&self) -> Option<PhysicalAddress> {
        self.alloc_frames(1)
    }

    /// Free one 4 KiB frame.
    #[inline]
    fn free_4k(&self, frame: PhysicalAddress) {
        self.free_frames(frame, 1);
    }
}

impl<T: FrameAlloc + ?Sized> FrameAlloc for &T {
    #[inline]
    fn alloc_frames(&self, count: usize) -> Option<PhysicalAddress> {
        (**self).alloc_frames(count)
    }

    #[inline]
    fn free_frames(&self, base: PhysicalAddress, count: usize) {
        (**self).free_frames(base, count);
    }
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space (e.g., via identity map or a higher-half direct map).
///
/// # Safety
/// - `pa` must be mapped as writable in the current page tables for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Fill `count` 4 KiB frames starting at `pa` with zeroes.
    ///
    /// # Safety
    /// The frames must be owned by the caller and reachable through this mapper.
    unsafe fn zero_frames(&self, pa: PhysicalAddress, count: usize) {
        for i in 0..count as u64 {
            let frame = unsafe { self.phys_to_mut::<[u8; PAGE_SIZE as usize]>(pa + i * PAGE_SIZE) };
            frame.fill(0);
        }
    }
}
