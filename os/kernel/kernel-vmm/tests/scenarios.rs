//! End-to-end behavior of address spaces.

mod common;

use common::TestRam;
use kernel_vmem::addresses::{PageSize, VirtualAddress};
use kernel_vmem::{Aarch64, Attributes, FrameAlloc, PteCodec, Sv39, X86_64};
use kernel_vmm::{
    Access, Advice, Behavior, FatalReason, FaultContext, FaultOutcome, MapFlags, VmError,
};

fn assert_sorted_disjoint(vmas: &[kernel_vmm::Vma]) {
    for w in vmas.windows(2) {
        assert!(w[0].end() <= w[1].start(), "{} overlaps {}", w[0], w[1]);
    }
}

#[test]
fn populated_anonymous_memory_is_present_and_zeroed() {
    let ram = TestRam::new(1024);
    let vas = ram.vas::<X86_64>();
    let va = vas
        .map(None, 3 * 4096, Attributes::RW, MapFlags::POPULATE, Behavior::Anonymous)
        .unwrap();
    assert_eq!(va, vas.config().vma_base);

    for i in 0..3 {
        let t = vas.walk(va + i * 4096).expect("page is present");
        assert_eq!(t.size, PageSize::Size4K);
        assert_eq!(t.attributes, X86_64::normalize(Attributes::RW));
        assert!(ram.page(t.frame).iter().all(|&b| b == 0));
    }
    assert!(vas.walk(va + 3 * 4096).is_none());
}

#[test]
fn mapping_over_a_reservation_conflicts() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let va = vas.reserve(None, 4096).unwrap();
    assert_eq!(
        vas.map(Some(va), 4096, Attributes::RW, MapFlags::empty(), Behavior::Anonymous),
        Err(VmError::Conflict)
    );
    assert!(vas.find(va).unwrap().behavior().is_reservation());
}

#[test]
fn adjacent_compatible_vmas_merge() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let a = vas
        .map(None, 0x2000, Attributes::RW, MapFlags::empty(), Behavior::Anonymous)
        .unwrap();
    let b = vas
        .map(Some(a + 0x2000), 0x1000, Attributes::RW, MapFlags::empty(), Behavior::Anonymous)
        .unwrap();
    assert_eq!(b, a + 0x2000);

    let vmas = vas.vmas();
    assert_eq!(vmas.len(), 1);
    assert_eq!(vmas[0].start(), a);
    assert_eq!(vmas[0].len(), 0x3000);
}

#[test]
fn faulting_a_reservation_is_fatal() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let va = vas.reserve(None, 0x4000).unwrap();
    // Reservations carry no permissions, so even a read is refused before
    // the behavior is consulted.
    assert_eq!(
        vas.handle_fault(&FaultContext::new(va + 0x10, Access::Read)),
        FaultOutcome::Fatal(VmError::PermissionDenied)
    );

    let free = ram.free();
    let rw = vas
        .map(None, 0x1000, Attributes::RW, MapFlags::empty(), Behavior::Reservation)
        .unwrap();
    assert_eq!(
        vas.handle_fault(&FaultContext::new(rw, Access::Write)),
        FaultOutcome::Fatal(VmError::Fatal(FatalReason::Reservation))
    );
    assert!(vas.walk(rw).is_none());
    assert_eq!(ram.free(), free);
}

#[test]
fn exhausted_memory_recovers_after_a_free() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let va = vas
        .map(None, 0x2000, Attributes::RW, MapFlags::empty(), Behavior::Anonymous)
        .unwrap();
    assert_eq!(
        vas.handle_fault(&FaultContext::new(va, Access::Write)),
        FaultOutcome::Resolved
    );

    let mut hoard = Vec::new();
    while let Some(f) = ram.frames.alloc_4k() {
        hoard.push(f);
    }

    let second = FaultContext::new(va + 0x1000, Access::Write);
    assert_eq!(vas.handle_fault(&second), FaultOutcome::Fatal(VmError::OutOfMemory));
    assert_eq!(
        vas.map(None, 0x1000, Attributes::RW, MapFlags::POPULATE, Behavior::Anonymous),
        Err(VmError::OutOfMemory)
    );
    assert_eq!(vas.vmas().len(), 1, "failed populate leaves no VMA behind");

    ram.frames.free_4k(hoard.pop().unwrap());
    assert_eq!(vas.handle_fault(&second), FaultOutcome::Resolved);

    for f in hoard {
        ram.frames.free_4k(f);
    }
}

#[test]
fn map_walk_unmap_walk() {
    let ram = TestRam::new(512);
    let initial = ram.free();
    {
        let vas = ram.vas::<X86_64>();
        let va = vas
            .map(None, 0x8000, Attributes::RW, MapFlags::POPULATE, Behavior::Anonymous)
            .unwrap();
        assert!((0..8).all(|i| vas.walk(va + i * 0x1000).is_some()));

        vas.unmap(va + 0x2000, 0x3000).unwrap();
        for i in 0..8 {
            let present = vas.walk(va + i * 0x1000).is_some();
            assert_eq!(present, !(2..5).contains(&i), "page {i}");
        }
        let vmas = vas.vmas();
        assert_eq!(vmas.len(), 2);
        assert_sorted_disjoint(&vmas);
        assert!(vas.find(va + 0x2000).is_none());
    }
    assert_eq!(ram.free(), initial, "dropping the VAS returns every frame");
}

#[test]
fn unmapping_twice_is_harmless() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let va = vas
        .map(None, 0x4000, Attributes::RW, MapFlags::POPULATE, Behavior::Anonymous)
        .unwrap();
    vas.unmap(va, 0x4000).unwrap();
    vas.unmap(va, 0x4000).unwrap();
    vas.unmap(VirtualAddress::new(0x7000_0000), 0x10_0000).unwrap();
    assert!(vas.vmas().is_empty());
}

#[test]
fn first_fit_fills_holes_and_keeps_order() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let a = vas.map(None, 0x1000, Attributes::READ, MapFlags::empty(), Behavior::Anonymous).unwrap();
    let b = vas.map(None, 0x3000, Attributes::RW, MapFlags::empty(), Behavior::Anonymous).unwrap();
    let c = vas.map(None, 0x1000, Attributes::READ, MapFlags::empty(), Behavior::Anonymous).unwrap();
    assert_eq!(b, a + 0x1000);
    assert_eq!(c, b + 0x3000);

    vas.unmap(b, 0x3000).unwrap();
    let d = vas.map(None, 0x2000, Attributes::RX, MapFlags::empty(), Behavior::Anonymous).unwrap();
    assert_eq!(d, b);
    let e = vas.map(None, 0x2000, Attributes::RX, MapFlags::empty(), Behavior::Anonymous).unwrap();
    assert_eq!(e, c + 0x1000);
    assert_sorted_disjoint(&vas.vmas());
}

#[test]
fn replace_unmaps_the_overlap_first() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let va = vas
        .map(None, 0x4000, Attributes::RW, MapFlags::POPULATE, Behavior::Anonymous)
        .unwrap();
    vas.map(
        Some(va + 0x1000),
        0x1000,
        Attributes::READ,
        MapFlags::REPLACE,
        Behavior::Anonymous,
    )
    .unwrap();
    assert!(vas.walk(va + 0x1000).is_none(), "replacement starts unpopulated");
    assert_eq!(vas.find(va + 0x1000).unwrap().attributes(), Attributes::READ);
    assert_eq!(vas.vmas().len(), 3);
    assert!(vas.walk(va).is_some() && vas.walk(va + 0x2000).is_some());
}

#[test]
fn invalid_requests_are_rejected() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    assert_eq!(
        vas.map(None, 0, Attributes::RW, MapFlags::empty(), Behavior::Anonymous),
        Err(VmError::InvalidRange)
    );
    assert_eq!(
        vas.map(
            Some(VirtualAddress::new(0x1234)),
            0x1000,
            Attributes::RW,
            MapFlags::empty(),
            Behavior::Anonymous
        ),
        Err(VmError::InvalidRange)
    );
    assert_eq!(
        vas.map(
            Some(VirtualAddress::new(0x0000_8000_0000_0000)),
            0x1000,
            Attributes::RW,
            MapFlags::empty(),
            Behavior::Anonymous
        ),
        Err(VmError::InvalidAddress)
    );
    assert_eq!(
        vas.protect(vas.config().vma_base, 0x1000, Attributes::READ),
        Err(VmError::InvalidAddress)
    );
    assert_eq!(
        vas.map(
            None,
            0x20_0000,
            Attributes::RW,
            MapFlags::SIZE_2M | MapFlags::SIZE_1G,
            Behavior::Anonymous
        ),
        Err(VmError::InvalidRange)
    );
}

#[test]
fn protect_splits_updates_and_merges_back() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let va = vas
        .map(None, 0x4000, Attributes::RW, MapFlags::POPULATE, Behavior::Anonymous)
        .unwrap();

    vas.protect(va + 0x1000, 0x2000, Attributes::READ).unwrap();
    assert_eq!(vas.vmas().len(), 3);
    assert_eq!(vas.walk(va + 0x1000).unwrap().attributes, X86_64::normalize(Attributes::READ));
    assert_eq!(vas.walk(va + 0x3000).unwrap().attributes, X86_64::normalize(Attributes::RW));
    assert_eq!(
        vas.handle_fault(&FaultContext::new(va + 0x1000, Access::Write)),
        FaultOutcome::Fatal(VmError::PermissionDenied)
    );

    vas.protect(va + 0x1000, 0x2000, Attributes::RW).unwrap();
    assert_eq!(vas.vmas().len(), 1);
}

#[test]
fn will_need_populates_and_dont_need_drops() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let va = vas
        .map(None, 0x4000, Attributes::RW, MapFlags::empty(), Behavior::Anonymous)
        .unwrap();
    let before = ram.free();

    vas.advise(va + 0x1000, 0x2000, Advice::WillNeed).unwrap();
    assert!(vas.walk(va).is_none());
    assert!(vas.walk(va + 0x1000).is_some());
    assert!(vas.walk(va + 0x2000).is_some());
    assert_eq!(vas.walk(va + 0x1000).unwrap().attributes, X86_64::normalize(Attributes::RW));

    ram.page(vas.walk(va + 0x1000).unwrap().frame)[0] = 0x5a;
    vas.advise(va, 0x4000, Advice::DontNeed).unwrap();
    assert!((0..4).all(|i| vas.walk(va + i * 0x1000).is_none()));
    assert_eq!(ram.free(), before);
    assert_eq!(vas.vmas().len(), 1, "advice keeps the VMA");

    assert_eq!(
        vas.handle_fault(&FaultContext::new(va + 0x1000, Access::Read)),
        FaultOutcome::Resolved
    );
    assert_eq!(ram.page(vas.walk(va + 0x1000).unwrap().frame)[0], 0);
}

#[test]
fn huge_anonymous_pages() {
    let ram = TestRam::new(2048);
    let vas = ram.vas::<X86_64>();
    let va = vas
        .map(None, 0x40_0000, Attributes::RW, MapFlags::SIZE_2M, Behavior::Anonymous)
        .unwrap();
    assert!(va.is_aligned(PageSize::Size2M));

    assert_eq!(
        vas.handle_fault(&FaultContext::new(va + 0x20_1234, Access::Write)),
        FaultOutcome::Resolved
    );
    let t = vas.walk(va + 0x20_1234).unwrap();
    assert_eq!(t.size, PageSize::Size2M);
    assert!(t.frame.is_aligned(PageSize::Size2M));
    assert!(vas.walk(va).is_none());

    assert_eq!(vas.unmap(va + 0x1000, 0x1000), Err(VmError::InvalidRange));
    vas.unmap(va + 0x20_0000, 0x20_0000).unwrap();
    assert!(vas.walk(va + 0x20_1234).is_none());
}

fn protect_yields_normalized_attributes<C: PteCodec>() {
    let ram = TestRam::new(512);
    let vas = ram.vas::<C>();
    let va = vas
        .map(None, 0x1000, Attributes::RW, MapFlags::POPULATE, Behavior::Anonymous)
        .unwrap();
    let frame = vas.walk(va).unwrap().frame;
    ram.page(frame)[0] = 0x5a;
    let free = ram.free();

    for bits in 0..8u8 {
        let attr = Attributes::from_bits_truncate(bits);
        vas.protect(va, 0x1000, attr).unwrap();
        assert_eq!(vas.find(va).unwrap().attributes(), attr);
        if !attr.is_accessible() {
            assert!(vas.walk(va).is_none(), "{}: no-access page still translates", C::NAME);
            assert_eq!(
                vas.handle_fault(&FaultContext::new(va, Access::Read)),
                FaultOutcome::Fatal(VmError::PermissionDenied)
            );
            continue;
        }
        let t = vas.walk(va).unwrap();
        assert_eq!(t.attributes, C::normalize(attr), "{} {attr}", C::NAME);
        assert_eq!(t.frame, frame);
        assert_eq!(ram.page(frame)[0], 0x5a, "contents survive a round through no access");
    }
    assert_eq!(ram.free(), free);
}

fn lazy_mapping_faults_in<C: PteCodec>() {
    let ram = TestRam::new(512);
    let vas = ram.vas::<C>();
    let va = vas
        .map(None, 0x3000, Attributes::RW, MapFlags::empty(), Behavior::Anonymous)
        .unwrap();
    assert!(vas.walk(va + 0x2000).is_none());
    assert_eq!(
        vas.handle_fault(&FaultContext::new(va + 0x2fff, Access::Write)),
        FaultOutcome::Resolved
    );
    assert_eq!(
        vas.walk(va + 0x2000).unwrap().attributes,
        C::normalize(Attributes::RW),
        "{}",
        C::NAME
    );
    assert_eq!(
        vas.handle_fault(&FaultContext::new(va + 0x2000, Access::Execute)),
        FaultOutcome::Fatal(VmError::PermissionDenied)
    );
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

for_all_codecs!(protect_yields_normalized_attributes, lazy_mapping_faults_in);
