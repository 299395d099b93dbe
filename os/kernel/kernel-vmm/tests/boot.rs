mod common;

use common::{RAM_BASE, TestRam};
use kernel_info::boot::{BootMemoryRegion, BootRegionFlags, BootRegionKind};
use kernel_vmem::addresses::VirtualAddress;
use kernel_vmem::{Attributes, X86_64};
use kernel_vmm::{Access, Behavior, BootSummary, FaultContext, FaultOutcome, MapFlags, VmError, ingest};

const PAGE: u64 = 4096;

fn region(kind: BootRegionKind, physical_base: u64, virtual_base: u64, length: u64) -> BootMemoryRegion {
    BootMemoryRegion {
        physical_base,
        virtual_base,
        length,
        kind,
        flags: BootRegionFlags::new().with_read(true).with_mapped(virtual_base != 0),
    }
}

#[test]
fn free_ram_seeds_the_allocator_and_the_rest_is_reserved() {
    let ram = TestRam::partial(256, 64);
    let vas = ram.vas::<X86_64>();
    let before = ram.frames.stats();

    let regions = [
        BootMemoryRegion::free(RAM_BASE + 64 * PAGE, 192 * PAGE),
        // Mapped regions become reservations; unmapped ones are left alone.
        region(BootRegionKind::Kernel, 0x20_0000, 0x20_0000_0000, 0x12_3456),
        region(BootRegionKind::Initrd, 0x80_0000, 0, 0x10_0000),
        // Rejected: inside the kernel image, smaller than a frame, already seeded.
        region(BootRegionKind::Device, 0xfee0_0000, 0x20_0000_1000, PAGE),
        BootMemoryRegion::free(RAM_BASE + 300 * PAGE, 100),
        BootMemoryRegion::free(RAM_BASE, 8 * PAGE),
        region(BootRegionKind::Reserved, 0, 0x20_1000_0000, 0),
    ];
    let summary = unsafe { ingest(&vas, &ram.frames, &regions) };

    assert_eq!(
        summary,
        BootSummary {
            frames: 191,
            reserved: 1,
            skipped: 3,
        }
    );
    let after = ram.frames.stats();
    assert_eq!(after.zones, before.zones + 1);
    assert_eq!(after.free, before.free + 191);

    let kernel = vas.find(VirtualAddress::new(0x20_0000_0000)).unwrap();
    assert!(kernel.behavior().is_reservation());
    assert_eq!(kernel.len(), 0x12_4000);
    assert_eq!(
        vas.map(
            Some(VirtualAddress::new(0x20_0010_0000)),
            PAGE,
            Attributes::RW,
            MapFlags::empty(),
            Behavior::Anonymous
        ),
        Err(VmError::Conflict)
    );
}

#[test]
fn ingested_memory_backs_faults() {
    let ram = TestRam::partial(512, 16);
    let vas = ram.vas::<X86_64>();
    let regions = [BootMemoryRegion::free(RAM_BASE + 16 * PAGE, 496 * PAGE)];
    let summary = unsafe { ingest(&vas, &ram.frames, &regions) };
    assert_eq!(summary.frames, 495);

    let va = vas
        .map(None, 64 * PAGE, Attributes::RW, MapFlags::empty(), Behavior::Anonymous)
        .unwrap();
    for i in 0..64 {
        assert_eq!(
            vas.handle_fault(&FaultContext::new(va + i * PAGE, Access::Write)),
            FaultOutcome::Resolved
        );
    }
}

#[test]
fn reservations_follow_the_region_flags() {
    let ram = TestRam::new(256);
    let vas = ram.vas::<X86_64>();
    let text = BootMemoryRegion {
        flags: BootRegionFlags::new().with_read(true).with_execute(true).with_mapped(true),
        ..region(BootRegionKind::Kernel, 0x20_0000, 0x20_0000_0000, 0x8000)
    };
    let data = BootMemoryRegion {
        flags: BootRegionFlags::new().with_read(true).with_write(true).with_mapped(true),
        ..region(BootRegionKind::Kernel, 0x20_8000, 0x20_0000_8000, 0x4000)
    };
    let unmapped = BootMemoryRegion {
        flags: BootRegionFlags::new().with_read(true),
        ..region(BootRegionKind::Initrd, 0x80_0000, 0x20_0010_0000, 0x1000)
    };
    let no_address = BootMemoryRegion {
        flags: BootRegionFlags::new().with_mapped(true),
        ..region(BootRegionKind::Device, 0xfee0_0000, 0, PAGE)
    };
    let summary = unsafe { ingest(&vas, &ram.frames, &[text, data, unmapped, no_address]) };
    assert_eq!(
        summary,
        BootSummary {
            frames: 0,
            reserved: 2,
            skipped: 1,
        }
    );

    let vmas = vas.vmas();
    assert_eq!(vmas.len(), 2, "different protection keeps them apart");
    assert_eq!(vmas[0].attributes(), Attributes::RX);
    assert_eq!(vmas[1].attributes(), Attributes::RW);
    assert!(vmas.iter().all(|v| v.behavior().is_reservation()));
    assert!(vas.find(VirtualAddress::new(0x20_0010_0000)).is_none());

    // Writing to the kernel text is a protection violation, not a reservation hit.
    assert_eq!(
        vas.handle_fault(&FaultContext::new(VirtualAddress::new(0x20_0000_0000), Access::Write)),
        FaultOutcome::Fatal(VmError::PermissionDenied)
    );
}
