//! # arm64 VMSAv8-64, 4 KiB Granule, 48-bit VA
//!
//! Level 0 entries are page descriptors (`type=1`); levels 1 and 2 may hold
//! block descriptors (`type=0`). Table descriptors use `type=1` at levels 1–3.
//!
//! ## Memory attributes
//!
//! `AttrIndx` selects a slot in `MAIR_EL1`, which bring-up programs as:
//!
//! | Index | Memory type |
//! |:-----:|:------------|
//! | 0 | Normal, inner/outer write-back |
//! | 1 | Device-nGnRE |
//! | 2 | Normal, non-cacheable |
//!
//! ## TLB
//!
//! `tlbi vae1is` is broadcast to the inner-shareable domain, so no software
//! shootdown is needed.

use crate::Attributes;
use crate::arch::{PteCodec, level_size};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, align_down};

const MAIR_NORMAL: u8 = 0;
const MAIR_DEVICE: u8 = 1;
const MAIR_NON_CACHEABLE: u8 = 2;

/// `AP[2:1]` = EL1 read/write.
const AP_RW: u8 = 0b00;
/// `AP[2:1]` = EL1 read-only.
const AP_RO: u8 = 0b10;
/// Inner shareable.
const SH_INNER: u8 = 0b11;

/// A stage-1 translation table descriptor.
#[bitfield(u64)]
pub struct Arm64Descriptor {
    pub valid: bool,
    /// Descriptor type: table/page when set, block when clear.
    pub table_or_page: bool,
    #[bits(3)]
    pub attr_index: u8,
    pub non_secure: bool,
    #[bits(2)]
    pub access_permissions: u8,
    #[bits(2)]
    pub shareability: u8,
    pub access_flag: bool,
    pub not_global: bool,
    #[bits(36)]
    pub output_address: u64,
    #[bits(4)]
    __res0: u8,
    pub contiguous: bool,
    pub privileged_execute_never: bool,
    pub unprivileged_execute_never: bool,
    #[bits(4)]
    pub software: u8,
    #[bits(5)]
    __ignored: u8,
}

impl Arm64Descriptor {
    #[inline]
    const fn with_attr(self, attr: Attributes) -> Self {
        let index = if attr.contains(Attributes::UNCACHED) {
            MAIR_DEVICE
        } else if attr.contains(Attributes::WRITE_COMBINE) {
            MAIR_NON_CACHEABLE
        } else {
            MAIR_NORMAL
        };
        let ap = if attr.contains(Attributes::WRITE) { AP_RW } else { AP_RO };
        self.with_attr_index(index)
            .with_access_permissions(ap)
            .with_privileged_execute_never(!attr.contains(Attributes::EXEC))
            .with_unprivileged_execute_never(true)
    }
}

/// arm64 codec (4 levels, 48-bit VA, 48-bit PA).
#[derive(Debug, Copy, Clone, Default)]
pub struct Aarch64;

impl PteCodec for Aarch64 {
    const NAME: &'static str = "arm64";
    const LEVELS: usize = 4;
    const VA_BITS: u32 = 48;
    const PA_BITS: u32 = 48;
    const BROADCAST_INVALIDATE: bool = true;
    const VALID: u64 = 1;
    /// First software-reserved bit.
    const PARKED: u64 = 1 << 55;

    #[inline]
    fn is_present(pte: u64) -> bool {
        Arm64Descriptor::from_bits(pte).valid()
    }

    #[inline]
    fn is_leaf(pte: u64, level: usize) -> bool {
        match level {
            0 => true,
            1 | 2 => !Arm64Descriptor::from_bits(pte).table_or_page(),
            _ => false,
        }
    }

    #[inline]
    fn make_table(table: PhysicalAddress) -> u64 {
        Arm64Descriptor::new()
            .with_valid(true)
            .with_table_or_page(true)
            .with_output_address(table.as_u64() >> 12)
            .into_bits()
    }

    #[inline]
    fn make_leaf(frame: PhysicalAddress, attr: Attributes, level: usize) -> u64 {
        Arm64Descriptor::new()
            .with_valid(true)
            .with_table_or_page(level == 0)
            .with_shareability(SH_INNER)
            .with_access_flag(true)
            .with_output_address(frame.as_u64() >> 12)
            .with_attr(attr)
            .into_bits()
    }

    #[inline]
    fn address(pte: u64, level: usize) -> PhysicalAddress {
        let raw = Arm64Descriptor::from_bits(pte).output_address() << 12;
        if level > 0 && Self::is_leaf(pte, level) {
            PhysicalAddress::new(align_down(raw, level_size(level)))
        } else {
            PhysicalAddress::new(raw)
        }
    }

    fn attributes(pte: u64, _level: usize) -> Attributes {
        let d = Arm64Descriptor::from_bits(pte);
        let mut attr = Attributes::READ;
        attr.set(Attributes::WRITE, d.access_permissions() & AP_RO == 0);
        attr.set(Attributes::EXEC, !d.privileged_execute_never());
        match d.attr_index() {
            MAIR_DEVICE => attr |= Attributes::UNCACHED,
            MAIR_NON_CACHEABLE => attr |= Attributes::WRITE_COMBINE,
            _ => {}
        }
        attr
    }

    #[inline]
    fn with_attributes(pte: u64, attr: Attributes, _level: usize) -> u64 {
        Arm64Descriptor::from_bits(pte).with_attr(attr).into_bits()
    }

    fn normalize(attr: Attributes) -> Attributes {
        let mut out = attr | Attributes::READ;
        if out.contains(Attributes::UNCACHED) {
            out.remove(Attributes::WRITE_COMBINE);
        }
        out
    }

    #[inline]
    unsafe fn invalidate_page(va: VirtualAddress) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vae1is, {}",
                "dsb ish",
                "isb",
                in(reg) va.as_u64() >> 12,
                options(nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "aarch64"))]
        let _ = va;
    }

    #[inline]
    unsafe fn invalidate_all() {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vmalle1is",
                "dsb ish",
                "isb",
                options(nostack, preserves_flags)
            );
        }
    }

    #[inline]
    unsafe fn read_root() -> PhysicalAddress {
        #[cfg(target_arch = "aarch64")]
        {
            let ttbr: u64;
            unsafe {
                core::arch::asm!("mrs {}, ttbr0_el1", out(reg) ttbr, options(nomem, nostack, preserves_flags));
            }
            PhysicalAddress::new(ttbr & 0x0000_FFFF_FFFF_F000)
        }
        #[cfg(not(target_arch = "aarch64"))]
        PhysicalAddress::zero()
    }

    #[inline]
    unsafe fn write_root(root: PhysicalAddress) {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "msr ttbr0_el1, {}",
                "isb",
                in(reg) root.as_u64(),
                options(nostack, preserves_flags)
            );
            Self::invalidate_all();
        }
        #[cfg(not(target_arch = "aarch64"))]
        let _ = root;
    }
}
