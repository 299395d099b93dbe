//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses that flow between the frame
//! allocator, the page-table walker and the VMA manager.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address translated by the MMU. |
//! | [`PhysicalAddress`] | An address of RAM or MMIO as seen by the bus. |
//! | [`PageSize`] | One of the three leaf sizes shared by x86-64, arm64 (4 KiB granule) and riscv64 Sv39. |
//!
//! Both address types are `#[repr(transparent)]` over `u64`, so they cost
//! nothing at runtime and can sit inside `#[repr(C)]` boot structures.
//!
//! ## Page Sizes
//!
//! All three supported architectures use a 4 KiB base page and a radix of
//! 512 entries per table, so the leaf sizes line up:
//!
//! ```text
//! level 0  →  4 KiB   (shift 12)
//! level 1  →  2 MiB   (shift 21)
//! level 2  →  1 GiB   (shift 30)
//! ```
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0000_0010_0020_1234);
//! assert_eq!(va.align_down(PageSize::Size4K).as_u64(), 0x0000_0010_0020_1000);
//! assert_eq!(va.page_offset(PageSize::Size2M), 0x1234);
//! assert!(!va.is_aligned(PageSize::Size4K));
//!
//! let pa = PhysicalAddress::new(0x4000_0000);
//! assert!(pa.is_aligned(PageSize::Size1G));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use crate::page_size::PageSize;
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;

/// Size of the base page in bytes.
pub const PAGE_SIZE: u64 = PageSize::Size4K.bytes();

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = PageSize::Size4K.shift();

/// Align `x` down to the nearest multiple of `a`.
///
/// This returns the greatest value `y <= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x12345,   16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0,    4096), Some(0));
/// assert_eq!(align_up(1,    4096), Some(4096));
/// assert_eq!(align_up(4097, 4096), Some(8192));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Returns `true` if `x` is a multiple of `a` (`a` a power of two).
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}
