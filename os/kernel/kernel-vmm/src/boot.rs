//! Hand-over of the boot memory map.

use crate::VmError;
use crate::behavior::Behavior;
use crate::vas::Vas;
use crate::vma::MapFlags;
use kernel_alloc::BuddyFrameAllocator;
use kernel_info::boot::{BootMemoryRegion, BootRegionFlags, BootRegionKind};
use kernel_memory_addresses::{PAGE_SIZE, PageSize, align_up};
use kernel_vmem::{Attributes, FrameAlloc, PhysMapper, PteCodec};
use log::{debug, warn};

/// What [`ingest`] did with the regions it was given.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BootSummary {
    /// Frames that became allocatable.
    pub frames: usize,
    /// Reservations created for regions visible in the address space.
    pub reserved: usize,
    /// Regions that were rejected.
    pub skipped: usize,
}

/// Seed `frames` with the free RAM of `regions` and reserve the virtual
/// ranges of every other region flagged as mapped, with the protection its
/// flags describe.
///
/// Rejected regions are logged and skipped; one bad entry does not stop
/// bring-up.
///
/// # Safety
/// Every [`BootRegionKind::Free`] region must be unused RAM that is reachable
/// through the mapper of `frames`.
pub unsafe fn ingest<C, M, A, P>(
    vas: &Vas<'_, C, M, A>,
    frames: &BuddyFrameAllocator<P>,
    regions: &[BootMemoryRegion],
) -> BootSummary
where
    C: PteCodec,
    M: PhysMapper + Clone,
    A: FrameAlloc,
    P: PhysMapper,
{
    let mut summary = BootSummary::default();
    for region in regions {
        if region.length == 0 {
            continue;
        }

        if region.kind == BootRegionKind::Free {
            match unsafe { frames.add_memory(region.physical_base(), region.length) } {
                Ok(n) => summary.frames += n,
                Err(e) => {
                    warn!("boot: free region {region:?} not usable: {e}");
                    summary.skipped += 1;
                }
            }
            continue;
        }

        if !region.flags.mapped() {
            continue;
        }
        let Some(va) = region.virtual_base() else {
            warn!("boot: {:?} region at {:?} is mapped without a virtual base", region.kind, region.physical_base());
            summary.skipped += 1;
            continue;
        };
        let base = va.align_down(PageSize::Size4K);
        let len = align_up(va.page_offset(PageSize::Size4K) + region.length, PAGE_SIZE);
        let attr = attributes(region.flags);
        let reserve = |len| vas.map(Some(base), len, attr, MapFlags::empty(), Behavior::Reservation);
        match len.ok_or(VmError::InvalidRange).and_then(reserve) {
            Ok(_) => {
                debug!("boot: reserved {:?} region at {base:?} {attr}", region.kind);
                summary.reserved += 1;
            }
            Err(e) => {
                warn!("boot: cannot reserve {:?} region at {va:?}: {e}", region.kind);
                summary.skipped += 1;
            }
        }
    }
    summary
}

/// The protection a boot region was mapped with.
fn attributes(flags: BootRegionFlags) -> Attributes {
    let mut attr = Attributes::empty();
    attr.set(Attributes::READ, flags.read());
    attr.set(Attributes::WRITE, flags.write());
    attr.set(Attributes::EXEC, flags.execute());
    attr
}
