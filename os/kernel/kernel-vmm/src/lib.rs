//! # Virtual Memory Management
//!
//! Address spaces built from VMAs on top of the page-table walker in
//! [`kernel_vmem`] and the frame allocator in [`kernel_alloc`].
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │ trap adapters (x86 #PF, arm64 ESR, riscv scause)      │
//! └───────────────┬───────────────────────────────────────┘
//!                 │ FaultContext
//! ┌───────────────▼───────────────────────────────────────┐
//! │ Vas                                                   │
//! │  • VmaList: sorted, non-overlapping, split and merge  │
//! │  • Behavior: anonymous, stack, direct, file, reserved │
//! │  • handle_fault: populate on first touch              │
//! └───────────────┬───────────────────────────────────────┘
//!                 │ PageTable<C: PteCodec, M: PhysMapper>
//! ┌───────────────▼───────────────────────────────────────┐
//! │ kernel-vmem            kernel-alloc (FrameAlloc)      │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Mappings
//!
//! [`Vas::map`] only records a VMA unless [`MapFlags::POPULATE`] is given;
//! pages are installed by [`Vas::handle_fault`] on first access. Anonymous
//! and stack memory is zero-filled, file memory is read through
//! [`FileBacking`], direct mappings point at fixed physical memory and
//! reservations never get any backing.
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::{BuddyFrameAllocator, HhdmPhysMapper};
//! use kernel_vmem::addresses::PhysicalAddress;
//! use kernel_vmem::{Attributes, X86_64};
//! use kernel_vmm::{Access, Behavior, FaultContext, FaultOutcome, MapFlags, Vas};
//!
//! #[repr(C, align(4096))]
//! struct Frame([u8; 4096]);
//! let ram: Vec<Frame> = (0..256).map(|_| Frame([0; 4096])).collect();
//! let base = 0x10_0000;
//! let mapper = HhdmPhysMapper::new((ram.as_ptr() as u64).wrapping_sub(base));
//! let frames = BuddyFrameAllocator::new(mapper);
//! unsafe { frames.add_memory(PhysicalAddress::new(base), 256 * 4096) }.unwrap();
//!
//! let vas = Vas::<X86_64, _, _>::new(&frames, mapper).unwrap();
//! let va = vas
//!     .map(None, 0x3000, Attributes::RW, MapFlags::empty(), Behavior::Anonymous)
//!     .unwrap();
//! assert!(vas.walk(va).is_none());
//!
//! let outcome = vas.handle_fault(&FaultContext::new(va + 0x1234, Access::Write));
//! assert_eq!(outcome, FaultOutcome::Resolved);
//! assert!(vas.walk(va + 0x1000).is_some());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod behavior;
pub mod boot;
mod error;
pub mod fault;
pub mod trap;
pub mod vas;
pub mod vma;

pub use crate::behavior::{Behavior, FileBacking};
pub use crate::boot::{BootSummary, ingest};
pub use crate::error::{FatalReason, VmError};
pub use crate::fault::{Access, FaultContext, FaultOutcome};
pub use crate::vas::{Advice, StackFlags, Vas, VasConfig};
pub use crate::vma::{MapFlags, Vma, VmaList};
