//! # Memory Layout

/// Lowest address the VMA manager hands out for mappings placed by first fit.
pub const DEFAULT_VMA_BASE: u64 = 0x0000_0010_0000_0000;

/// Exclusive upper bound of the first-fit window.
///
/// Kept below `1 << 38` so the window is canonical under riscv64 Sv39 as well.
pub const DEFAULT_VMA_END: u64 = 0x0000_0040_0000_0000;

/// Base of the higher-half direct map (HHDM) of physical memory.
///
/// Anything at [`HHDM_BASE`] + `pa` aliases the physical byte `pa`. The page
/// tables and the frame allocator metadata are accessed through this window.
#[cfg(not(target_arch = "riscv64"))]
pub const HHDM_BASE: u64 = 0xffff_ff80_0000_0000;

/// Base of the higher-half direct map (HHDM) of physical memory.
///
/// Sv39 only has 256 GiB of upper half; the direct map takes half of it.
#[cfg(target_arch = "riscv64")]
pub const HHDM_BASE: u64 = 0xffff_ffe0_0000_0000;

/// Non-present guard pages below the usable part of a stack VMA.
pub const STACK_GUARD_PAGES_BOTTOM: u64 = 4;

/// Non-present guard pages above the usable part of a stack VMA.
pub const STACK_GUARD_PAGES_TOP: u64 = 1;

/// The size of a kernel thread stack when the caller does not pick one.
pub const DEFAULT_STACK_SIZE: u64 = 64 * 1024;

/// The size of the base page all constants are expressed against.
pub const PAGE_SIZE: u64 = 4096;

const _: () = {
    assert!(DEFAULT_VMA_BASE.is_multiple_of(PAGE_SIZE));
    assert!(DEFAULT_VMA_END.is_multiple_of(PAGE_SIZE));
    assert!(DEFAULT_VMA_BASE < DEFAULT_VMA_END);
    assert!(DEFAULT_VMA_END <= 1 << 38);
    assert!(DEFAULT_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(STACK_GUARD_PAGES_BOTTOM + STACK_GUARD_PAGES_TOP > 0);
};
