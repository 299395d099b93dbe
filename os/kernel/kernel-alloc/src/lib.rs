//! # Physical Memory Allocation
//!
//! The bottom layer of the memory subsystem: it owns physical RAM and hands it
//! out in power-of-two blocks of 4 KiB frames.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        kernel-vmm (VAS, VMAs, fault handling)       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  FrameAlloc / PhysMapper
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper                        │
//! │    • HHDM (Higher Half Direct Mapping)              │
//! │    • Physical-to-virtual address translation        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Buddy Frame Allocator                     │
//! │    • Zones added at runtime (`add_memory`)          │
//! │    • Per-zone metadata stored in the zone itself    │
//! │    • Intrusive free lists, buddy coalescing         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Frame Allocator ([`frame_alloc`])
//!
//! * **Buddy Discipline**: requests are rounded up to `2^order` frames and
//!   blocks are aligned to their size, so huge pages come out suitably aligned.
//! * **No-Heap Design**: all bookkeeping lives in the first frames of each
//!   zone, so the allocator is usable before a heap exists.
//! * **Incremental Growth**: every call to `add_memory` adds a zone.
//! * **Locking**: one `spin::Mutex`; allocation never blocks on anything else.
//!
//! ### Physical Mapper ([`phys_mapper`])
//!
//! Converts physical addresses into references through the direct map. The
//! allocator and the page-table walker use it to reach memory they manage.
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::frame_alloc::BuddyFrameAllocator;
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_vmem::FrameAlloc;
//! use kernel_vmem::addresses::PhysicalAddress;
//!
//! #[repr(C, align(4096))]
//! struct Frame([u8; 4096]);
//! let ram: Vec<Frame> = (0..64).map(|_| Frame([0; 4096])).collect();
//! let base = 0x10_0000;
//! let mapper = HhdmPhysMapper::new((ram.as_ptr() as u64).wrapping_sub(base));
//!
//! let frames = BuddyFrameAllocator::new(mapper);
//! unsafe { frames.add_memory(PhysicalAddress::new(base), 64 * 4096) }.unwrap();
//! let frame = frames.alloc_4k().unwrap();
//! frames.free_4k(frame);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod frame_alloc;
pub mod phys_mapper;

pub use crate::frame_alloc::{BuddyFrameAllocator, FrameAllocError, FrameStats, MAX_ORDER};
pub use crate::phys_mapper::HhdmPhysMapper;
