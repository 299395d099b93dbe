//! # Boot Memory Regions
//!
//! Platform bring-up describes physical memory as an ordered list of
//! [`BootMemoryRegion`] descriptors. Keep these `#[repr(C)]` and prefer
//! fixed-size integers at the ABI boundary.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// What a region of physical memory is used for.
///
/// We avoid Rust enums with payloads across the ABI boundary.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BootRegionKind {
    /// Usable RAM; seeds the frame allocator.
    Free = 0,
    /// Firmware or otherwise unusable memory.
    Reserved = 1,
    /// The loaded kernel image (text, data, bss).
    Kernel = 2,
    /// The initial ramdisk handed over by the loader.
    Initrd = 3,
    /// A device (MMIO) window.
    Device = 4,
}

/// Access and mapping hints attached to a region.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct BootRegionFlags {
    /// Region may be read.
    pub read: bool,
    /// Region may be written.
    pub write: bool,
    /// Region may be executed.
    pub execute: bool,
    /// Region is already present in the boot page tables at `virtual_base`.
    pub mapped: bool,
    #[bits(28)]
    __reserved: u32,
}

/// One physical memory region as reported by platform bring-up.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryRegion {
    /// First byte of the region in physical memory.
    pub physical_base: u64,
    /// Where the region is visible in the kernel address space, or 0 if it is
    /// not mapped.
    pub virtual_base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Usage of the region.
    pub kind: BootRegionKind,
    /// Access and mapping hints.
    pub flags: BootRegionFlags,
}

impl BootMemoryRegion {
    /// A free RAM region.
    #[must_use]
    pub const fn free(physical_base: u64, length: u64) -> Self {
        Self {
            physical_base,
            virtual_base: 0,
            length,
            kind: BootRegionKind::Free,
            flags: BootRegionFlags::new().with_read(true).with_write(true),
        }
    }

    #[inline]
    #[must_use]
    pub const fn physical_base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.physical_base)
    }

    /// The virtual base, if the region is visible in the address space.
    #[inline]
    #[must_use]
    pub const fn virtual_base(&self) -> Option<VirtualAddress> {
        if self.virtual_base == 0 {
            None
        } else {
            Some(VirtualAddress::new(self.virtual_base))
        }
    }

    /// Exclusive physical end, or `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn physical_end(&self) -> Option<u64> {
        self.physical_base.checked_add(self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pack_into_low_bits() {
        let f = BootRegionFlags::new()
            .with_read(true)
            .with_execute(true)
            .with_mapped(true);
        assert_eq!(u32::from(f), 0b1101);
    }

    #[test]
    fn free_region_is_unmapped() {
        let r = BootMemoryRegion::free(0x10_0000, 0x1000);
        assert_eq!(r.kind, BootRegionKind::Free);
        assert!(r.virtual_base().is_none());
        assert!(r.flags.write());
        assert_eq!(r.physical_end(), Some(0x10_1000));
    }
}
