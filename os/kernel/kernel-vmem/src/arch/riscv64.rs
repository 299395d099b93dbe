//! # riscv64 Sv39
//!
//! Three levels, 39-bit virtual addresses. An entry is a leaf as soon as any of
//! `R`, `W` or `X` is set, at any level; a valid entry with all three clear
//! points at the next table.
//!
//! `W` without `R` is reserved by the privileged architecture, and a leaf cannot be
//! encoded without at least one permission bit. [`Sv39::normalize`] widens
//! such requests.
//!
//! Memory types use the Svpbmt extension (`PMA`, `NC`, `IO`).

use crate::Attributes;
use crate::arch::{PteCodec, level_size};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, align_down};

const PBMT_PMA: u8 = 0;
const PBMT_NC: u8 = 1;
const PBMT_IO: u8 = 2;

/// `satp.MODE` for Sv39.
const SATP_MODE_SV39: u64 = 8 << 60;
const SATP_PPN_MASK: u64 = (1 << 44) - 1;

/// An Sv39 page-table entry.
#[bitfield(u64)]
pub struct Sv39Entry {
    pub valid: bool,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
    pub global: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Reserved for supervisor software.
    #[bits(2)]
    pub rsw: u8,
    #[bits(44)]
    pub ppn: u64,
    #[bits(7)]
    __reserved: u8,
    #[bits(2)]
    pub pbmt: u8,
    pub napot: bool,
}

impl Sv39Entry {
    #[inline]
    const fn with_attr(self, attr: Attributes) -> Self {
        let attr = Sv39::widen(attr);
        let pbmt = if attr.contains(Attributes::UNCACHED) {
            PBMT_IO
        } else if attr.contains(Attributes::WRITE_COMBINE) {
            PBMT_NC
        } else {
            PBMT_PMA
        };
        self.with_readable(attr.contains(Attributes::READ))
            .with_writable(attr.contains(Attributes::WRITE))
            .with_executable(attr.contains(Attributes::EXEC))
            .with_pbmt(pbmt)
    }
}

/// riscv64 Sv39 codec (3 levels, 39-bit VA, 56-bit PA).
#[derive(Debug, Copy, Clone, Default)]
pub struct Sv39;

impl Sv39 {
    /// Protection widening shared by encode and [`PteCodec::normalize`].
    const fn widen(attr: Attributes) -> Attributes {
        let mut out = attr;
        if out.contains(Attributes::WRITE) || !out.is_accessible() {
            out = out.union(Attributes::READ);
        }
        if out.contains(Attributes::UNCACHED) {
            out = out.difference(Attributes::WRITE_COMBINE);
        }
        out
    }
}

impl PteCodec for Sv39 {
    const NAME: &'static str = "riscv64-sv39";
    const LEVELS: usize = 3;
    const VA_BITS: u32 = 39;
    const PA_BITS: u32 = 56;
    const BROADCAST_INVALIDATE: bool = false;
    const VALID: u64 = 1;
    /// Low `RSW` bit.
    const PARKED: u64 = 1 << 8;

    #[inline]
    fn is_present(pte: u64) -> bool {
        Sv39Entry::from_bits(pte).valid()
    }

    #[inline]
    fn is_leaf(pte: u64, _level: usize) -> bool {
        let e = Sv39Entry::from_bits(pte);
        e.readable() || e.writable() || e.executable()
    }

    #[inline]
    fn make_table(table: PhysicalAddress) -> u64 {
        Sv39Entry::new()
            .with_valid(true)
            .with_ppn(table.as_u64() >> 12)
            .into_bits()
    }

    #[inline]
    fn make_leaf(frame: PhysicalAddress, attr: Attributes, _level: usize) -> u64 {
        // A and D are preset so the hart never has to fault to update them.
        Sv39Entry::new()
            .with_valid(true)
            .with_accessed(true)
            .with_dirty(true)
            .with_ppn(frame.as_u64() >> 12)
            .with_attr(attr)
            .into_bits()
    }

    #[inline]
    fn address(pte: u64, level: usize) -> PhysicalAddress {
        let raw = Sv39Entry::from_bits(pte).ppn() << 12;
        if level > 0 && Self::is_leaf(pte, level) {
            PhysicalAddress::new(align_down(raw, level_size(level)))
        } else {
            PhysicalAddress::new(raw)
        }
    }

    fn attributes(pte: u64, _level: usize) -> Attributes {
        let e = Sv39Entry::from_bits(pte);
        let mut attr = Attributes::empty();
        attr.set(Attributes::READ, e.readable());
        attr.set(Attributes::WRITE, e.writable());
        attr.set(Attributes::EXEC, e.executable());
        match e.pbmt() {
            PBMT_IO => attr |= Attributes::UNCACHED,
            PBMT_NC => attr |= Attributes::WRITE_COMBINE,
            _ => {}
        }
        attr
    }

    #[inline]
    fn with_attributes(pte: u64, attr: Attributes, _level: usize) -> u64 {
        Sv39Entry::from_bits(pte).with_attr(attr).into_bits()
    }

    #[inline]
    fn normalize(attr: Attributes) -> Attributes {
        Self::widen(attr)
    }

    #[inline]
    unsafe fn invalidate_page(va: VirtualAddress) {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!(
                "fence rw, rw",
                "sfence.vma {}, zero",
                in(reg) va.as_u64(),
                options(nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "riscv64"))]
        let _ = va;
    }

    #[inline]
    unsafe fn invalidate_all() {
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!("fence rw, rw", "sfence.vma zero, zero", options(nostack, preserves_flags));
        }
    }

    #[inline]
    unsafe fn read_root() -> PhysicalAddress {
        #[cfg(target_arch = "riscv64")]
        {
            let satp: u64;
            unsafe {
                core::arch::asm!("csrr {}, satp", out(reg) satp, options(nomem, nostack, preserves_flags));
            }
            PhysicalAddress::new((satp & SATP_PPN_MASK) << 12)
        }
        #[cfg(not(target_arch = "riscv64"))]
        PhysicalAddress::zero()
    }

    #[inline]
    unsafe fn write_root(root: PhysicalAddress) {
        let satp = SATP_MODE_SV39 | ((root.as_u64() >> 12) & SATP_PPN_MASK);
        #[cfg(target_arch = "riscv64")]
        unsafe {
            core::arch::asm!(
                "csrw satp, {}",
                "sfence.vma zero, zero",
                in(reg) satp,
                options(nostack, preserves_flags)
            );
        }
        #[cfg(not(target_arch = "riscv64"))]
        let _ = satp;
    }
}
