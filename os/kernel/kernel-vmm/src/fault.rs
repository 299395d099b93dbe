//! # Demand Paging
//!
//! Page faults are resolved in a single pass:
//!
//! ```text
//! fault ─▶ find VMA ──none──▶ fatal (InvalidAddress)
//!              │
//!              ▼
//!         permitted? ──no──▶ fatal (PermissionDenied)
//!              │
//!              ▼
//!   reservation / guard / present ──▶ fatal
//!              │
//!              ▼
//!   already installed? ──yes──▶ flush, Retry
//!              │
//!              ▼
//!   populate ─▶ install PTE ──lost the race──▶ release frame, Retry
//!                   │
//!                   ▼
//!               Resolved
//! ```
//!
//! The trap layer only turns architecture state into a [`FaultContext`]; see
//! [`trap`](crate::trap).

use crate::error::{FatalReason, VmError};
use crate::vas::Vas;
use crate::vma::MapFlags;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Attributes, FrameAlloc, Occupied, PhysMapper, PteCodec};
use log::{error, trace};

/// Kind of the faulting access.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// The attribute an access of this kind needs.
    #[must_use]
    pub const fn required(self) -> Attributes {
        match self {
            Self::Read => Attributes::READ,
            Self::Write => Attributes::WRITE,
            Self::Execute => Attributes::EXEC,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        })
    }
}

/// What the trap layer knows about a fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FaultContext {
    /// The faulting address.
    pub vaddr: VirtualAddress,
    /// The kind of access.
    pub access: Access,
    /// Whether the hardware found a valid translation (protection fault).
    pub present: bool,
}

impl FaultContext {
    #[must_use]
    pub const fn new(vaddr: VirtualAddress, access: Access) -> Self {
        Self {
            vaddr,
            access,
            present: false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// A page was installed; resume the faulting instruction.
    Resolved,
    /// The translation is in place already; resume and let the CPU try again.
    Retry,
    /// The fault cannot be resolved.
    Fatal(VmError),
}

impl<C: PteCodec, M: PhysMapper + Clone, A: FrameAlloc> Vas<'_, C, M, A> {
    /// Resolve a page fault.
    pub fn handle_fault(&self, ctx: &FaultContext) -> FaultOutcome {
        let state = self.state.read();
        let Some(vma) = state.vmas.find(ctx.vaddr) else {
            return FaultOutcome::Fatal(VmError::InvalidAddress);
        };

        let allowed = if vma.attributes.is_accessible() {
            C::normalize(vma.attributes)
        } else {
            Attributes::empty()
        };
        if !allowed.contains(ctx.access.required()) {
            return FaultOutcome::Fatal(VmError::PermissionDenied);
        }
        if vma.behavior.is_reservation() {
            return FaultOutcome::Fatal(FatalReason::Reservation.into());
        }
        if vma.is_guard(ctx.vaddr) {
            return FaultOutcome::Fatal(FatalReason::GuardPage.into());
        }
        if ctx.present {
            return FaultOutcome::Fatal(FatalReason::Refault.into());
        }

        let size = vma.page_size;
        let page = ctx.vaddr.align_down(size);
        {
            let pt = state.pt.lock();
            if pt.walk(ctx.vaddr).is_some() {
                pt.flush(ctx.vaddr);
                return FaultOutcome::Retry;
            }
        }

        let zero = !vma.flags.contains(MapFlags::UNINITIALIZED);
        let frame = match vma
            .behavior
            .populate(vma.start, page, size, self.frames, &self.mapper, zero)
        {
            Ok(frame) => frame,
            Err(e) => return FaultOutcome::Fatal(e),
        };

        let mut pt = state.pt.lock();
        match pt.map_with(
            self.frames,
            page,
            size.bytes(),
            vma.attributes,
            size,
            Occupied::Fail,
            |_, _| Ok::<_, VmError>(frame),
        ) {
            Ok(_) => {
                trace!("fault: {} {:?} -> {frame:?}", ctx.access, ctx.vaddr);
                FaultOutcome::Resolved
            }
            Err(VmError::Conflict) => {
                pt.flush(ctx.vaddr);
                drop(pt);
                vma.behavior.discard(frame, size, self.frames);
                FaultOutcome::Retry
            }
            Err(e) => {
                drop(pt);
                vma.behavior.discard(frame, size, self.frames);
                FaultOutcome::Fatal(e)
            }
        }
    }

    /// Resolve a page fault or bring the system down.
    ///
    /// This is what the architecture trap handlers call. A fatal outcome is
    /// logged with everything known about the address and then panics.
    pub fn on_page_fault(&self, ctx: &FaultContext) -> FaultOutcome {
        let outcome = self.handle_fault(ctx);
        let FaultOutcome::Fatal(e) = outcome else {
            return outcome;
        };

        error!(
            "PAGE FAULT: {} at {:?}{}: {e}",
            ctx.access,
            ctx.vaddr,
            if ctx.present { " (present)" } else { "" }
        );
        match self.find(ctx.vaddr) {
            Some(vma) => error!("  vma: {vma}"),
            None => error!("  vma: none"),
        }
        match self.walk(ctx.vaddr) {
            Some(t) => error!(
                "  pte: {:#018x} -> {:?} {} {}",
                t.raw, t.frame, t.size, t.attributes
            ),
            None => error!("  pte: not present"),
        }
        panic!("unresolvable page fault at {:?}: {e}", ctx.vaddr);
    }
}
