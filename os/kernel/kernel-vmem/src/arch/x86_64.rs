//! # x86-64 4-Level Paging
//!
//! One bitfield, [`X86Entry`], models the common superset of PML4E, PDPTE,
//! PDE and PTE. Leaves at level 1 (2 MiB) and level 2 (1 GiB) carry `PS=1`;
//! at level 0 the same bit position is `PAT` and stays clear.
//!
//! ## Caching
//!
//! Memory types are selected through the `PWT`/`PCD` index into the PAT.
//! The kernel programs `PAT[1]` as write-combining during bring-up, so:
//!
//! | `PCD` | `PWT` | Type |
//! |:-----:|:-----:|:-----|
//! | 0 | 0 | write-back |
//! | 0 | 1 | write-combining |
//! | 1 | 1 | uncached |
//!
//! ## TLB
//!
//! `invlpg` is local to the executing CPU; other CPUs need a shootdown.

use crate::Attributes;
use crate::arch::{PteCodec, level_size};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, align_down};

/// A single 64-bit x86-64 paging-structure entry.
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | `P`  | Present |
/// | 1     | `RW` | Writable |
/// | 2     | `US` | User accessible |
/// | 3     | `PWT`| Write-through |
/// | 4     | `PCD`| Cache disable |
/// | 5     | `A`  | Accessed |
/// | 6     | `D`  | Dirty (leaf only) |
/// | 7     | `PS` | Large page (PAT at level 0) |
/// | 8     | `G`  | Global (leaf only) |
/// | 12–51 | addr | Physical frame bits `[51:12]` |
/// | 63    | `NX` | Execute disable |
#[bitfield(u64)]
pub struct X86Entry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// `PS` at levels 1 and 2; `PAT` at level 0.
    pub huge: bool,
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    #[bits(40)]
    pub frame: u64,
    #[bits(7)]
    pub os_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl X86Entry {
    /// Apply protection and caching from `attr`, keeping everything else.
    #[inline]
    const fn with_attr(self, attr: Attributes) -> Self {
        let uncached = attr.contains(Attributes::UNCACHED);
        let wc = !uncached && attr.contains(Attributes::WRITE_COMBINE);
        self.with_writable(attr.contains(Attributes::WRITE))
            .with_no_execute(!attr.contains(Attributes::EXEC))
            .with_write_through(uncached || wc)
            .with_cache_disable(uncached)
    }
}

/// x86-64 codec (4 levels, 48-bit VA, 52-bit PA).
#[derive(Debug, Copy, Clone, Default)]
pub struct X86_64;

impl PteCodec for X86_64 {
    const NAME: &'static str = "x86-64";
    const LEVELS: usize = 4;
    const VA_BITS: u32 = 48;
    const PA_BITS: u32 = 52;
    const BROADCAST_INVALIDATE: bool = false;
    const VALID: u64 = 1;
    /// First of the three OS-available bits.
    const PARKED: u64 = 1 << 9;

    #[inline]
    fn is_present(pte: u64) -> bool {
        X86Entry::from_bits(pte).present()
    }

    #[inline]
    fn is_leaf(pte: u64, level: usize) -> bool {
        match level {
            0 => true,
            1 | 2 => X86Entry::from_bits(pte).huge(),
            _ => false,
        }
    }

    #[inline]
    fn make_table(table: PhysicalAddress) -> u64 {
        X86Entry::new()
            .with_present(true)
            .with_writable(true)
            .with_frame(table.as_u64() >> 12)
            .into_bits()
    }

    #[inline]
    fn make_leaf(frame: PhysicalAddress, attr: Attributes, level: usize) -> u64 {
        X86Entry::new()
            .with_present(true)
            .with_huge(level > 0)
            .with_frame(frame.as_u64() >> 12)
            .with_attr(attr)
            .into_bits()
    }

    #[inline]
    fn address(pte: u64, level: usize) -> PhysicalAddress {
        let raw = X86Entry::from_bits(pte).frame() << 12;
        if level > 0 && Self::is_leaf(pte, level) {
            // Bit 12 of a huge leaf is PAT, not address.
            PhysicalAddress::new(align_down(raw, level_size(level)))
        } else {
            PhysicalAddress::new(raw)
        }
    }

    fn attributes(pte: u64, _level: usize) -> Attributes {
        let e = X86Entry::from_bits(pte);
        let mut attr = Attributes::READ;
        attr.set(Attributes::WRITE, e.writable());
        attr.set(Attributes::EXEC, !e.no_execute());
        if e.cache_disable() {
            attr |= Attributes::UNCACHED;
        } else if e.write_through() {
            attr |= Attributes::WRITE_COMBINE;
        }
        attr
    }

    #[inline]
    fn with_attributes(pte: u64, attr: Attributes, _level: usize) -> u64 {
        X86Entry::from_bits(pte).with_attr(attr).into_bits()
    }

    fn normalize(attr: Attributes) -> Attributes {
        // No way to express write-only, execute-only or no-access leaves.
        let mut out = attr | Attributes::READ;
        if out.contains(Attributes::UNCACHED) {
            out.remove(Attributes::WRITE_COMBINE);
        }
        out
    }

    #[inline]
    unsafe fn invalidate_page(va: VirtualAddress) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = va;
    }

    #[inline]
    unsafe fn invalidate_all() {
        // Reloading CR3 drops every non-global translation.
        unsafe { Self::write_root(Self::read_root()) }
    }

    #[inline]
    unsafe fn read_root() -> PhysicalAddress {
        #[cfg(target_arch = "x86_64")]
        {
            let cr3: u64;
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            }
            PhysicalAddress::new(cr3 & 0x000F_FFFF_FFFF_F000)
        }
        #[cfg(not(target_arch = "x86_64"))]
        PhysicalAddress::zero()
    }

    #[inline]
    unsafe fn write_root(root: PhysicalAddress) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_4k_bits() {
        let pte = X86_64::make_leaf(PhysicalAddress::new(0x1234_5000), Attributes::RW, 0);
        let e = X86Entry::from_bits(pte);
        assert!(e.present() && e.writable() && e.no_execute());
        assert!(!e.huge());
        assert_eq!(X86_64::address(pte, 0).as_u64(), 0x1234_5000);
        assert_eq!(X86_64::attributes(pte, 0), Attributes::RW);
    }

    #[test]
    fn huge_leaf_sets_ps() {
        let pte = X86_64::make_leaf(PhysicalAddress::new(0x4000_0000), Attributes::RX, 2);
        assert!(X86_64::is_leaf(pte, 2));
        assert!(!X86_64::is_leaf(X86_64::make_table(PhysicalAddress::new(0x1000)), 2));
        assert_eq!(X86_64::address(pte, 2).as_u64(), 0x4000_0000);
        assert_eq!(X86_64::attributes(pte, 2), Attributes::RX);
    }

    #[test]
    fn caching_encodings() {
        let uc = X86_64::make_leaf(PhysicalAddress::new(0x1000), Attributes::RW | Attributes::UNCACHED, 0);
        let e = X86Entry::from_bits(uc);
        assert!(e.cache_disable() && e.write_through());
        assert!(X86_64::attributes(uc, 0).contains(Attributes::UNCACHED));

        let wc = X86_64::make_leaf(PhysicalAddress::new(0x1000), Attributes::RW | Attributes::WRITE_COMBINE, 0);
        let e = X86Entry::from_bits(wc);
        assert!(!e.cache_disable() && e.write_through());
        assert_eq!(X86_64::attributes(wc, 0), Attributes::RW | Attributes::WRITE_COMBINE);
    }

    #[test]
    fn normalize_matches_decode() {
        for bits in 0..32u8 {
            let attr = Attributes::from_bits_truncate(bits);
            let pte = X86_64::make_leaf(PhysicalAddress::new(0x2000), attr, 0);
            assert_eq!(X86_64::attributes(pte, 0), X86_64::normalize(attr), "{attr:?}");
        }
    }

    #[test]
    fn reprotect_keeps_address_and_dirty() {
        let pte = X86Entry::from_bits(X86_64::make_leaf(PhysicalAddress::new(0x20_0000), Attributes::RW, 1))
            .with_dirty(true)
            .with_accessed(true)
            .into_bits();
        let ro = X86_64::with_attributes(pte, Attributes::READ, 1);
        let e = X86Entry::from_bits(ro);
        assert!(e.dirty() && e.accessed() && e.huge());
        assert!(!e.writable());
        assert_eq!(X86_64::address(ro, 1).as_u64(), 0x20_0000);
    }

    #[test]
    fn canonical_halves() {
        assert!(X86_64::is_canonical(VirtualAddress::new(0x0000_7fff_ffff_f000)));
        assert!(X86_64::is_canonical(VirtualAddress::new(0xffff_8000_0000_0000)));
        assert!(!X86_64::is_canonical(VirtualAddress::new(0x0000_8000_0000_0000)));
        assert!(X86_64::is_valid_pa(PhysicalAddress::new(0x000f_ffff_ffff_f000)));
        assert!(!X86_64::is_valid_pa(PhysicalAddress::new(1 << 52)));
    }
}
