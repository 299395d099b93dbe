//! # HHDM-based PhysMapper
//!
//! With a higher-half direct map (HHDM) every physical byte `pa` is visible
//! at `offset + pa`. Page tables and the frame allocator metadata are reached
//! through this window, so they need nothing but an addition.
//!
//! The offset is a runtime value: the kernel uses
//! [`HHDM_BASE`](kernel_info::memory::HHDM_BASE), host tests point it into a
//! heap buffer that plays the role of RAM.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_vmem::PhysMapper;
//! use kernel_vmem::addresses::PhysicalAddress;
//!
//! let mut ram = [0u64; 4];
//! let mapper = HhdmPhysMapper::new(ram.as_mut_ptr() as u64);
//! unsafe { *mapper.phys_to_mut::<u64>(PhysicalAddress::new(8)) = 7 };
//! assert_eq!(ram[1], 7);
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_vmem::PhysMapper;
use kernel_vmem::addresses::PhysicalAddress;

/// [`PhysMapper`] for a direct map at a fixed offset.
///
/// # Safety
/// - The direct map must cover every physical address passed to it.
/// - The returned references must only be used for mapped, writable memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    /// A mapper adding `offset` to physical addresses.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The kernel's direct map at [`HHDM_BASE`].
    #[must_use]
    pub const fn kernel() -> Self {
        Self::new(HHDM_BASE)
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::kernel()
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.offset.wrapping_add(pa.as_u64()) as *mut T;
        // SAFETY: Caller must ensure the physical address is valid and mapped via HHDM.
        unsafe { &mut *va }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_mapper_uses_hhdm_base() {
        assert_eq!(HhdmPhysMapper::default().offset(), HHDM_BASE);
    }

    #[test]
    fn zero_frames_goes_through_offset() {
        #[repr(C, align(4096))]
        struct Frames([u8; 2 * 4096]);
        let mut ram = Box::new(Frames([0xFF; 2 * 4096]));
        let base = 0x20_0000u64;
        let mapper = HhdmPhysMapper::new((ram.0.as_mut_ptr() as u64).wrapping_sub(base));
        unsafe { mapper.zero_frames(PhysicalAddress::new(base + 4096), 1) };
        assert!(ram.0[..4096].iter().all(|&b| b == 0xFF));
        assert!(ram.0[4096..].iter().all(|&b| b == 0));
    }
}
