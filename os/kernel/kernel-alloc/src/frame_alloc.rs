//! # Buddy Frame Allocator
//!
//! Physical memory is handed to the allocator one region at a time with
//! [`BuddyFrameAllocator::add_memory`]. Every region becomes a *zone* that
//! carries its own metadata in its first frames:
//!
//! ```text
//! region start
//! ┌──────────────┬───────────────────────┬─────────────────────────────┐
//! │  ZoneHeader  │ order map (1 B/frame) │ data frames (buddy blocks)  │
//! └──────────────┴───────────────────────┴─────────────────────────────┘
//!  ⌊ metadata frames, ceil((header + frames) / 4 KiB) ⌋
//! ```
//!
//! - Blocks are `2^order` frames and aligned to their size in *physical*
//!   memory, so the buddy of a block at `pa` is simply `pa ^ size`.
//! - The order map stores `order + 1` for the first frame of each free block
//!   and `0` everywhere else. This is what coalescing consults.
//! - Free lists are intrusive: the first bytes of every free block hold a
//!   [`FreeBlock`] with the physical addresses of its neighbours.
//!
//! No memory outside the zones is ever needed, so the allocator works before
//! any heap exists.

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, warn};

/// Largest block order: `2^18` frames = 1 GiB.
pub const MAX_ORDER: usize = 18;

const ORDERS: usize = MAX_ORDER + 1;

/// Null link in the intrusive lists.
const NIL: u64 = u64::MAX;

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum FrameAllocError {
    #[error("no free block large enough")]
    OutOfMemory,
    #[error("frame count must be between 1 and 2^MAX_ORDER")]
    InvalidCount,
    #[error("region cannot hold its own metadata and one frame")]
    RegionTooSmall,
    #[error("region overlaps memory already managed by the allocator")]
    Overlap,
    #[error("block is not owned by any zone or is already free")]
    InvalidFree,
}

/// Allocator statistics, in 4 KiB frames.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FrameStats {
    /// Frames available for allocation across all zones (metadata excluded).
    pub total: usize,
    /// Frames currently on a free list.
    pub free: usize,
    /// Number of zones.
    pub zones: usize,
}

#[repr(C)]
struct ZoneHeader {
    /// Physical address of the next zone header, or [`NIL`].
    next: u64,
    /// First byte of the region (the header itself).
    start: u64,
    /// First data frame.
    base: u64,
    /// Exclusive end of the data frames.
    end: u64,
    free_heads: [u64; ORDERS],
    free_frames: u64,
}

#[repr(C)]
struct FreeBlock {
    next: u64,
    prev: u64,
}

const HEADER_SIZE: u64 = size_of::<ZoneHeader>() as u64;

const _: () = assert!(size_of::<ZoneHeader>() < PAGE_SIZE as usize);

struct State {
    first_zone: u64,
    stats: FrameStats,
}

/// Buddy allocator over any number of physical regions.
///
/// All bookkeeping memory is reached through `M`; the allocator itself is two
/// words and a lock.
pub struct BuddyFrameAllocator<M: PhysMapper> {
    mapper: M,
    state: spin::Mutex<State>,
}

/// Block size in bytes for `order`.
#[inline]
const fn block_bytes(order: usize) -> u64 {
    PAGE_SIZE << order
}

/// Smallest order holding `count` frames.
#[inline]
const fn order_for(count: usize) -> Option<usize> {
    if count == 0 || count > (1 << MAX_ORDER) {
        return None;
    }
    Some(count.next_power_of_two().trailing_zeros() as usize)
}

impl<M: PhysMapper> BuddyFrameAllocator<M> {
    /// An allocator without memory. Feed it with [`add_memory`](Self::add_memory).
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            state: spin::Mutex::new(State {
                first_zone: NIL,
                stats: FrameStats {
                    total: 0,
                    free: 0,
                    zones: 0,
                },
            }),
        }
    }

    /// Add `[base, base + len)` as a new zone.
    ///
    /// The range is shrunk to whole frames. Returns the number of frames that
    /// became allocatable.
    ///
    /// # Errors
    /// - [`FrameAllocError::RegionTooSmall`] if the region cannot hold its
    ///   metadata plus at least one frame.
    /// - [`FrameAllocError::Overlap`] if it intersects an existing zone.
    ///
    /// # Safety
    /// The whole region must be unused RAM reachable through the mapper.
    pub unsafe fn add_memory(&self, base: PhysicalAddress, len: u64) -> Result<usize, FrameAllocError> {
        let start = align_up(base.as_u64(), PAGE_SIZE).ok_or(FrameAllocError::RegionTooSmall)?;
        let end = base
            .as_u64()
            .checked_add(len)
            .map(|e| e & !(PAGE_SIZE - 1))
            .ok_or(FrameAllocError::RegionTooSmall)?;
        if end <= start {
            warn!("rejecting region {base:?}+{len:#x}: smaller than one frame");
            return Err(FrameAllocError::RegionTooSmall);
        }

        let frames = (end - start) / PAGE_SIZE;
        let meta = (HEADER_SIZE + frames).div_ceil(PAGE_SIZE);
        if meta >= frames {
            warn!("rejecting region {base:?}+{len:#x}: no room after {meta} metadata frames");
            return Err(FrameAllocError::RegionTooSmall);
        }

        let mut state = self.state.lock();
        let mut zone = state.first_zone;
        while zone != NIL {
            let z = self.header(zone);
            if start < z.end && z.start < end {
                warn!("rejecting region {base:?}+{len:#x}: overlaps zone at {:#x}", z.start);
                return Err(FrameAllocError::Overlap);
            }
            zone = z.next;
        }

        unsafe { self.mapper.zero_frames(PhysicalAddress::new(start), meta as usize) };
        let data = start + meta * PAGE_SIZE;
        let header = self.header(start);
        header.next = state.first_zone;
        header.start = start;
        header.base = data;
        header.end = end;
        header.free_heads = [NIL; ORDERS];
        header.free_frames = 0;

        // Greedy seeding: the largest naturally aligned block at every step.
        let mut cursor = data;
        while cursor < end {
            let mut order = MAX_ORDER;
            while cursor % block_bytes(order) != 0 || cursor + block_bytes(order) > end {
                order -= 1;
            }
            self.push(start, cursor, order);
            cursor += block_bytes(order);
        }

        let usable = ((end - data) / PAGE_SIZE) as usize;
        state.first_zone = start;
        state.stats.zones += 1;
        state.stats.total += usable;
        state.stats.free += usable;
        debug!("zone {start:#x}..{end:#x}: {usable} frames, {meta} metadata frames");
        Ok(usable)
    }

    /// Allocate `count` contiguous frames, rounded up to a power of two.
    ///
    /// # Errors
    /// - [`FrameAllocError::InvalidCount`] for `0` or more than `2^MAX_ORDER`.
    /// - [`FrameAllocError::OutOfMemory`] if no zone has a large enough block.
    pub fn alloc(&self, count: usize) -> Result<PhysicalAddress, FrameAllocError> {
        let order = order_for(count).ok_or(FrameAllocError::InvalidCount)?;
        let mut state = self.state.lock();

        let mut zone = state.first_zone;
        while zone != NIL {
            let (found, next) = {
                let z = self.header(zone);
                let found = (order..ORDERS).find(|&o| z.free_heads[o] != NIL);
                (found.map(|o| (o, z.free_heads[o])), z.next)
            };
            if let Some((mut have, pa)) = found {
                self.unlink(zone, pa, have);
                while have > order {
                    have -= 1;
                    self.push(zone, pa + block_bytes(have), have);
                }
                state.stats.free -= 1 << order;
                return Ok(PhysicalAddress::new(pa));
            }
            zone = next;
        }
        Err(FrameAllocError::OutOfMemory)
    }

    /// Return a block obtained from [`alloc`](Self::alloc), or any
    /// naturally aligned part of one.
    ///
    /// # Errors
    /// - [`FrameAllocError::InvalidCount`] for an impossible `count`.
    /// - [`FrameAllocError::InvalidFree`] if the block lies outside every zone,
    ///   is misaligned, or is already free.
    pub fn free(&self, base: PhysicalAddress, count: usize) -> Result<(), FrameAllocError> {
        let mut order = order_for(count).ok_or(FrameAllocError::InvalidCount)?;
        let frames = 1usize << order;
        let mut pa = base.as_u64();
        let mut state = self.state.lock();

        let zone = self
            .zone_of(state.first_zone, pa, block_bytes(order))
            .ok_or(FrameAllocError::InvalidFree)?;
        let (zbase, zend) = {
            let z = self.header(zone);
            (z.base, z.end)
        };
        if pa % block_bytes(order) != 0 || self.overlaps_free(zone, zbase, pa, order) {
            warn!("rejecting free of {frames} frames at {base:?}");
            return Err(FrameAllocError::InvalidFree);
        }

        while order < MAX_ORDER {
            let buddy = pa ^ block_bytes(order);
            let inside = buddy >= zbase && buddy + block_bytes(order) <= zend;
            if !inside || self.order_mark(zone, buddy) != order as u8 + 1 {
                break;
            }
            self.unlink(zone, buddy, order);
            pa = pa.min(buddy);
            order += 1;
        }
        self.push(zone, pa, order);
        state.stats.free += frames;
        Ok(())
    }

    /// Current statistics.
    pub fn stats(&self) -> FrameStats {
        self.state.lock().stats
    }

    /// The zone whose data range holds `[pa, pa + len)`.
    fn zone_of(&self, first: u64, pa: u64, len: u64) -> Option<u64> {
        let mut zone = first;
        while zone != NIL {
            let z = self.header(zone);
            if pa >= z.base && pa.checked_add(len)? <= z.end {
                return Some(zone);
            }
            zone = z.next;
        }
        None
    }

    /// Insert the block at `pa` at the head of its free list.
    fn push(&self, zone: u64, pa: u64, order: usize) {
        let z = self.header(zone);
        let head = z.free_heads[order];
        let block = self.block(pa);
        block.next = head;
        block.prev = NIL;
        if head != NIL {
            self.block(head).prev = pa;
        }
        z.free_heads[order] = pa;
        z.free_frames += 1 << order;
        *self.order_slot(zone, pa) = order as u8 + 1;
    }

    /// Remove the free block at `pa` from its list.
    fn unlink(&self, zone: u64, pa: u64, order: usize) {
        let z = self.header(zone);
        let (next, prev) = {
            let b = self.block(pa);
            (b.next, b.prev)
        };
        if prev == NIL {
            z.free_heads[order] = next;
        } else {
            self.block(prev).next = next;
        }
        if next != NIL {
            self.block(next).prev = prev;
        }
        z.free_frames -= 1 << order;
        *self.order_slot(zone, pa) = 0;
    }

    /// Whether any frame of the order-`order` block at `pa` is already free.
    ///
    /// Aligned blocks either nest or are disjoint, so a free block touching
    /// the range either contains `pa` or starts inside the range.
    fn overlaps_free(&self, zone: u64, zbase: u64, pa: u64, order: usize) -> bool {
        for o in 0..ORDERS {
            let head = pa & !(block_bytes(o) - 1);
            if head < zbase {
                break;
            }
            let mark = self.order_mark(zone, head);
            if mark != 0 && head + block_bytes(mark as usize - 1) > pa {
                return true;
            }
        }
        (1..1u64 << order).any(|i| self.order_mark(zone, pa + i * PAGE_SIZE) != 0)
    }

    fn order_mark(&self, zone: u64, pa: u64) -> u8 {
        *self.order_slot(zone, pa)
    }

    #[allow(clippy::mut_from_ref)]
    fn order_slot(&self, zone: u64, pa: u64) -> &mut u8 {
        let index = (pa - zone) / PAGE_SIZE;
        // SAFETY: the order map covers every frame of the zone and lives in
        // its metadata frames; callers hold the state lock.
        unsafe { self.mapper.phys_to_mut(PhysicalAddress::new(zone + HEADER_SIZE + index)) }
    }

    #[allow(clippy::mut_from_ref)]
    fn header(&self, zone: u64) -> &mut ZoneHeader {
        // SAFETY: zone headers sit in the first metadata frame of their zone
        // and are only touched under the state lock.
        unsafe { self.mapper.phys_to_mut(PhysicalAddress::new(zone)) }
    }

    #[allow(clippy::mut_from_ref)]
    fn block(&self, pa: u64) -> &mut FreeBlock {
        // SAFETY: free blocks belong to the allocator; under the state lock
        // nobody else touches them.
        unsafe { self.mapper.phys_to_mut(PhysicalAddress::new(pa)) }
    }
}

impl<M: PhysMapper> FrameAlloc for BuddyFrameAllocator<M> {
    fn alloc_frames(&self, count: usize) -> Option<PhysicalAddress> {
        self.alloc(count).ok()
    }

    fn free_frames(&self, base: PhysicalAddress, count: usize) {
        if let Err(e) = self.free(base, count) {
            warn!("ignoring free of {count} frames at {base:?}: {e}");
        }
    }
}
