//! # Per-Architecture Page-Table Entry Codecs
//!
//! The generic walker in [`page_table`](crate::page_table) never looks at PTE
//! bits itself. Everything architecture specific sits behind [`PteCodec`]:
//!
//! - **Layout**: how a physical address and [`Attributes`] are packed into a
//!   leaf or table entry, per level.
//! - **Address rules**: which virtual addresses are canonical and which
//!   physical addresses the MMU can output.
//! - **TLB maintenance**: the invalidate instruction and its barriers.
//! - **Base register**: `CR3`, `TTBR0_EL1` or `satp`.
//!
//! The encode/decode half is pure and is unit-tested on any host. The
//! hardware half is only compiled to real instructions on its own target and
//! is never executed by the walker unless the table was activated.

mod aarch64;
mod riscv64;
mod x86_64;

pub use self::aarch64::Aarch64;
pub use self::riscv64::Sv39;
pub use self::x86_64::X86_64;

use crate::Attributes;
use kernel_memory_addresses::{PageSize, PhysicalAddress, VirtualAddress};

/// The codec of the architecture we are compiled for.
#[cfg(target_arch = "x86_64")]
pub type Native = X86_64;

/// The codec of the architecture we are compiled for.
#[cfg(target_arch = "aarch64")]
pub type Native = Aarch64;

/// The codec of the architecture we are compiled for.
#[cfg(target_arch = "riscv64")]
pub type Native = Sv39;

/// Number of virtual-address bits consumed by one table level.
pub const BITS_PER_LEVEL: u32 = 9;

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 1 << BITS_PER_LEVEL;

/// Bytes covered by one entry at `level` (level 0 maps 4 KiB).
#[inline]
#[must_use]
pub const fn level_size(level: usize) -> u64 {
    1 << (12 + BITS_PER_LEVEL as usize * level)
}

/// Number of 4 KiB frames behind a leaf at `level`.
#[inline]
#[must_use]
pub const fn level_frames(level: usize) -> usize {
    1 << (BITS_PER_LEVEL as usize * level)
}

/// Returns `true` if bits `[63:bits]` of `va` are copies of bit `bits - 1`.
#[inline]
#[must_use]
pub const fn sign_extends(va: u64, bits: u32) -> bool {
    let shift = 64 - bits;
    (((va << shift) as i64) >> shift) as u64 == va
}

/// Encode/decode plug-in for one paging scheme.
///
/// All methods are associated functions: a codec has no state beyond the
/// table memory it describes.
pub trait PteCodec: 'static {
    /// Human-readable name used in diagnostics.
    const NAME: &'static str;

    /// Number of table levels walked by the MMU.
    const LEVELS: usize;

    /// Width of a canonical virtual address.
    const VA_BITS: u32;

    /// Width of an output (physical) address.
    const PA_BITS: u32;

    /// Whether [`invalidate_page`](Self::invalidate_page) already reaches
    /// every CPU in the inner-shareable domain. If not, the walker asks the
    /// platform for a shootdown after each local invalidation.
    const BROADCAST_INVALIDATE: bool;

    /// The valid bit. With it clear the MMU ignores every other bit.
    const VALID: u64;

    /// A bit the MMU ignores in an invalid entry, used to mark a *parked*
    /// leaf: a no-access page that keeps its frame and attributes.
    const PARKED: u64;

    /// Table index of `va` at `level`.
    #[inline]
    #[must_use]
    fn index(va: VirtualAddress, level: usize) -> usize {
        ((va.as_u64() >> (12 + BITS_PER_LEVEL as usize * level)) as usize) & (ENTRIES_PER_TABLE - 1)
    }

    /// Whether leaves of `size` can be installed.
    #[inline]
    #[must_use]
    fn supports(size: PageSize) -> bool {
        size.level() < Self::LEVELS
    }

    /// Canonical-address check for the supported virtual address width.
    #[inline]
    #[must_use]
    fn is_canonical(va: VirtualAddress) -> bool {
        sign_extends(va.as_u64(), Self::VA_BITS)
    }

    /// Whether the MMU can output `pa`.
    #[inline]
    #[must_use]
    fn is_valid_pa(pa: PhysicalAddress) -> bool {
        pa.as_u64() >> Self::PA_BITS == 0
    }

    /// Whether the entry holds a valid translation or table pointer.
    fn is_present(pte: u64) -> bool;

    /// Whether a present entry at `level` maps memory (as opposed to pointing
    /// at the next table).
    fn is_leaf(pte: u64, level: usize) -> bool;

    /// A non-leaf entry pointing at the table in `table`.
    fn make_table(table: PhysicalAddress) -> u64;

    /// A leaf mapping `frame` at `level` with `attr`.
    fn make_leaf(frame: PhysicalAddress, attr: Attributes, level: usize) -> u64;

    /// The physical address held by a present entry at `level`.
    fn address(pte: u64, level: usize) -> PhysicalAddress;

    /// The attributes of a present leaf at `level`.
    fn attributes(pte: u64, level: usize) -> Attributes;

    /// `pte` with its protection and caching replaced by `attr`; address and
    /// hardware-managed bits are preserved.
    fn with_attributes(pte: u64, attr: Attributes, level: usize) -> u64;

    /// Turn a present leaf into a parked one.
    #[inline]
    #[must_use]
    fn park(pte: u64) -> u64 {
        (pte & !Self::VALID) | Self::PARKED
    }

    /// Whether `pte` is a parked leaf.
    #[inline]
    #[must_use]
    fn is_parked(pte: u64) -> bool {
        pte & (Self::VALID | Self::PARKED) == Self::PARKED
    }

    /// The present leaf a parked entry was made from.
    #[inline]
    #[must_use]
    fn unpark(pte: u64) -> u64 {
        (pte & !Self::PARKED) | Self::VALID
    }

    /// The attributes a leaf built from `attr` decodes back to.
    fn normalize(attr: Attributes) -> Attributes;

    /// Invalidate the translation of `va` with the required barriers.
    ///
    /// # Safety
    /// Privileged instruction; must run at kernel privilege.
    unsafe fn invalidate_page(va: VirtualAddress);

    /// Invalidate all non-global translations of the current address space.
    ///
    /// # Safety
    /// Privileged instruction; must run at kernel privilege.
    unsafe fn invalidate_all();

    /// Physical address of the active root table.
    ///
    /// # Safety
    /// Privileged instruction; must run at kernel privilege with paging on.
    unsafe fn read_root() -> PhysicalAddress;

    /// Make the table rooted at `root` the active one.
    ///
    /// # Safety
    /// The table must map all code and data the CPU touches after the switch.
    unsafe fn write_root(root: PhysicalAddress);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_geometry() {
        assert_eq!(level_size(0), 4096);
        assert_eq!(level_size(1), 2 * 1024 * 1024);
        assert_eq!(level_size(2), 1024 * 1024 * 1024);
        assert_eq!(level_frames(1), 512);
    }

    #[test]
    fn sign_extension() {
        assert!(sign_extends(0x0000_7fff_ffff_f000, 48));
        assert!(sign_extends(0xffff_8000_0000_0000, 48));
        assert!(!sign_extends(0x0000_8000_0000_0000, 48));
        assert!(!sign_extends(0xfff0_0000_0000_0000, 48));
        assert!(sign_extends(0x0000_003f_ffff_f000, 39));
        assert!(!sign_extends(0x0000_0040_0000_0000, 39));
        assert!(sign_extends(0xffff_ffc0_0000_0000, 39));
    }

    #[test]
    fn indices_per_level() {
        let va = VirtualAddress::new(0xffff_8888_0123_4567);
        assert_eq!(X86_64::index(va, 0), (0xffff_8888_0123_4567 >> 12) & 0x1ff);
        assert_eq!(X86_64::index(va, 3), (0xffff_8888_0123_4567 >> 39) & 0x1ff);
        for level in 0..4 {
            assert!(X86_64::index(va, level) < ENTRIES_PER_TABLE);
        }
    }

    fn parking<C: PteCodec>() {
        let leaf = C::make_leaf(PhysicalAddress::new(0x20_0000), Attributes::RW, 1);
        let parked = C::park(leaf);
        assert!(!C::is_present(parked), "{}", C::NAME);
        assert!(C::is_parked(parked));
        assert!(!C::is_parked(leaf));
        assert!(!C::is_parked(0));
        assert_eq!(C::unpark(parked), leaf);
    }

    #[test]
    fn parked_leaves_are_invalid_and_restorable() {
        parking::<X86_64>();
        parking::<Aarch64>();
        parking::<Sv39>();
    }
}
