//! The same page-table scenarios run against every codec.

use core::cell::{Cell, RefCell};
use kernel_vmem::addresses::{PageSize, PhysicalAddress, VirtualAddress};
use kernel_vmem::{
    Aarch64, Attributes, FrameAlloc, FramePolicy, Occupied, PageTable, PageTableError, PhysMapper,
    PteCodec, Sv39, X86_64,
};

const RAM_BASE: u64 = 0x8000_0000;
const RAM_FRAMES: usize = 2048;

#[repr(C, align(4096))]
struct Frame([u8; 4096]);

struct Ram {
    mem: Box<[Frame]>,
    next: Cell<u64>,
    free: RefCell<Vec<PhysicalAddress>>,
    outstanding: Cell<usize>,
}

impl Ram {
    fn new() -> Self {
        Self {
            mem: (0..RAM_FRAMES).map(|_| Frame([0; 4096])).collect(),
            next: Cell::new(RAM_BASE),
            free: RefCell::new(Vec::new()),
            outstanding: Cell::new(0),
        }
    }

    fn mapper(&self) -> Offset {
        Offset((self.mem.as_ptr() as u64).wrapping_sub(RAM_BASE))
    }
}

impl FrameAlloc for Ram {
    fn alloc_frames(&self, count: usize) -> Option<PhysicalAddress> {
        if count == 1 {
            if let Some(pa) = self.free.borrow_mut().pop() {
                self.outstanding.set(self.outstanding.get() + 1);
                return Some(pa);
            }
        }
        let align = count.next_power_of_two() as u64 * 4096;
        let base = self.next.get().next_multiple_of(align);
        let end = base + count as u64 * 4096;
        if end > RAM_BASE + RAM_FRAMES as u64 * 4096 {
            return None;
        }
        self.next.set(end);
        self.outstanding.set(self.outstanding.get() + count);
        Some(PhysicalAddress::new(base))
    }

    fn free_frames(&self, base: PhysicalAddress, count: usize) {
        let mut free = self.free.borrow_mut();
        for i in 0..count as u64 {
            free.push(base + i * 4096);
        }
        self.outstanding.set(self.outstanding.get() - count);
    }
}

#[derive(Clone, Copy)]
struct Offset(u64);

impl PhysMapper for Offset {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *(pa.as_u64().wrapping_add(self.0) as *mut T) }
    }
}

/// Lower-half address that is canonical for all three schemes.
const VA: u64 = 0x0000_0020_0000_0000;

fn map_then_unmap_returns_every_frame<C: PteCodec>() {
    let ram = Ram::new();
    let mut pt = PageTable::<C, _>::new(ram.mapper(), &ram).unwrap();
    let va = VirtualAddress::new(VA);

    let n = pt
        .map_with(&ram, va, 0x8000, Attributes::RW, PageSize::Size4K, Occupied::Fail, |_, _| {
            ram.alloc_4k().ok_or(PageTableError::OutOfMemory)
        })
        .unwrap();
    assert_eq!(n, 8, "{}", C::NAME);
    for i in 0..8 {
        let t = pt.walk(va + i * 0x1000).unwrap();
        assert_eq!(t.attributes, C::normalize(Attributes::RW), "{}", C::NAME);
    }

    assert_eq!(pt.unmap(&ram, va, 0x8000, FramePolicy::Release), Ok(8));
    assert_eq!(pt.table_count(), 1, "{}", C::NAME);
    pt.destroy(&ram, FramePolicy::Release);
    assert_eq!(ram.outstanding.get(), 0, "{}", C::NAME);
}

fn huge_pages_translate_with_offset<C: PteCodec>() {
    let ram = Ram::new();
    let mut pt = PageTable::<C, _>::new(ram.mapper(), &ram).unwrap();
    let va = VirtualAddress::new(VA);
    let pa = PhysicalAddress::new(0x1_0000_0000);

    pt.map(&ram, va, pa, 0x40_0000, Attributes::RX, PageSize::Size2M).unwrap();
    let t = pt.walk(va + 0x20_1234).unwrap();
    assert_eq!(t.size, PageSize::Size2M);
    assert_eq!(t.address.as_u64(), 0x1_0020_1234);
    assert_eq!(t.attributes, C::normalize(Attributes::RX));

    pt.map(&ram, va + 0x4000_0000, pa, 0x4000_0000, Attributes::READ, PageSize::Size1G)
        .unwrap();
    let t = pt.walk(va + 0x4000_0000 + 0x1234_5678).unwrap();
    assert_eq!(t.size, PageSize::Size1G);
    assert_eq!(t.address.as_u64(), 0x1_1234_5678);
}

fn protect_splits_huge_page<C: PteCodec>() {
    let ram = Ram::new();
    let mut pt = PageTable::<C, _>::new(ram.mapper(), &ram).unwrap();
    let va = VirtualAddress::new(VA);
    pt.map(&ram, va, PhysicalAddress::new(0x1_0000_0000), 0x20_0000, Attributes::RW, PageSize::Size2M)
        .unwrap();

    assert_eq!(pt.protect(&ram, va + 0x10_0000, 0x1000, Attributes::READ), Ok(1));
    let changed = pt.walk(va + 0x10_0000).unwrap();
    assert_eq!(changed.size, PageSize::Size4K);
    assert_eq!(changed.attributes, C::normalize(Attributes::READ));
    let untouched = pt.walk(va + 0x10_1000).unwrap();
    assert_eq!(untouched.attributes, C::normalize(Attributes::RW));
    assert_eq!(untouched.frame.as_u64(), 0x1_0010_1000);
}

fn overlapping_map_conflicts<C: PteCodec>() {
    let ram = Ram::new();
    let mut pt = PageTable::<C, _>::new(ram.mapper(), &ram).unwrap();
    let va = VirtualAddress::new(VA);
    pt.map(&ram, va, PhysicalAddress::new(0x1_0000_0000), 0x20_0000, Attributes::RW, PageSize::Size2M)
        .unwrap();
    let tables = pt.table_count();
    assert_eq!(
        pt.map(&ram, va + 0x3000, PhysicalAddress::new(0x9000), 0x1000, Attributes::RW, PageSize::Size4K),
        Err(PageTableError::Conflict)
    );
    assert_eq!(pt.table_count(), tables);
}

fn unmapping_holes_is_a_no_op<C: PteCodec>() {
    let ram = Ram::new();
    let mut pt = PageTable::<C, _>::new(ram.mapper(), &ram).unwrap();
    assert_eq!(
        pt.unmap(&ram, VirtualAddress::new(VA), 0x100_0000, FramePolicy::Release),
        Ok(0)
    );
    assert_eq!(pt.table_count(), 1);
}

macro_rules! for_all_codecs {
    ($($name:ident),* $(,)?) => {
        mod x86_64 {
            $( #[test] fn $name() { super::$name::<super::X86_64>(); } )*
        }
        mod aarch64 {
            $( #[test] fn $name() { super::$name::<super::Aarch64>(); } )*
        }
        mod sv39 {
            $( #[test] fn $name() { super::$name::<super::Sv39>(); } )*
        }
    };
}

for_all_codecs!(
    map_then_unmap_returns_every_frame,
    huge_pages_translate_with_offset,
    protect_splits_huge_page,
    overlapping_map_conflicts,
    unmapping_holes_is_a_no_op,
);

#[test]
fn sv39_rejects_upper_bits() {
    let ram = Ram::new();
    let mut pt = PageTable::<Sv39, _>::new(ram.mapper(), &ram).unwrap();
    assert_eq!(
        pt.map(
            &ram,
            VirtualAddress::new(0x0000_0040_0000_0000),
            PhysicalAddress::new(0x1000),
            0x1000,
            Attributes::RW,
            PageSize::Size4K
        ),
        Err(PageTableError::InvalidAddress)
    );
}
