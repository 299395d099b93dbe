//! # Virtual Address Spaces
//!
//! A [`Vas`] pairs one page-table tree with the sorted list of VMAs that
//! describe it. Every change goes through the VMA list first; the page table
//! only ever holds translations a VMA allows.
//!
//! ## Locking
//!
//! ```text
//! Vas::state   RwLock   map / unmap / protect / advise / reserve: write
//!                       handle_fault / walk / vmas / find:      read
//!   └─ pt      Mutex    held only to install or look up entries
//! ```
//!
//! Faults populate (zero a frame, read a file) under the read lock alone and
//! then take the inner mutex for the install, so concurrent faults on
//! different pages do not wait on each other's populate.

use crate::behavior::Behavior;
use crate::error::VmError;
use crate::vma::{MapFlags, Vma, VmaList};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::mem::ManuallyDrop;
use kernel_info::memory::{
    DEFAULT_STACK_SIZE, DEFAULT_VMA_BASE, DEFAULT_VMA_END, STACK_GUARD_PAGES_BOTTOM,
    STACK_GUARD_PAGES_TOP,
};
use kernel_memory_addresses::{PAGE_SIZE, PageSize, PhysicalAddress, VirtualAddress, align_down, align_up};
use kernel_vmem::{
    Attributes, FrameAlloc, FramePolicy, LOCAL_ONLY, Occupied, PageTable, PhysMapper, PteCodec,
    TlbShootdown, Translation,
};
use log::{debug, warn};

/// Runtime layout knobs of an address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VasConfig {
    /// Lowest address handed out by first fit.
    pub vma_base: VirtualAddress,
    /// Exclusive end of the first-fit window.
    pub vma_end: VirtualAddress,
    /// Guard pages below a stack.
    pub stack_guard_bottom: u64,
    /// Guard pages above a stack.
    pub stack_guard_top: u64,
    /// Stack size used when [`Vas::map_stack`] is asked for zero bytes.
    pub default_stack_size: u64,
}

impl Default for VasConfig {
    fn default() -> Self {
        Self {
            vma_base: VirtualAddress::new(DEFAULT_VMA_BASE),
            vma_end: VirtualAddress::new(DEFAULT_VMA_END),
            stack_guard_bottom: STACK_GUARD_PAGES_BOTTOM,
            stack_guard_top: STACK_GUARD_PAGES_TOP,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct StackFlags: u32 {
        /// The stack grows towards higher addresses.
        const GROWS_UP = 1 << 0;
    }
}

/// Hint passed to [`Vas::advise`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Advice {
    /// Populate the range now.
    WillNeed,
    /// Drop the backing of the range; the next touch faults it in again.
    DontNeed,
}

pub(crate) struct VasState<C: PteCodec, M: PhysMapper> {
    pub(crate) vmas: VmaList,
    pub(crate) pt: spin::Mutex<PageTable<C, M>>,
}

/// A virtual address space.
pub struct Vas<'f, C: PteCodec, M: PhysMapper + Clone, A: FrameAlloc> {
    pub(crate) frames: &'f A,
    pub(crate) mapper: M,
    config: VasConfig,
    pub(crate) state: ManuallyDrop<spin::RwLock<VasState<C, M>>>,
}

impl<'f, C: PteCodec, M: PhysMapper + Clone, A: FrameAlloc> Vas<'f, C, M, A> {
    /// An empty address space with the default layout.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the root table cannot be allocated.
    pub fn new(frames: &'f A, mapper: M) -> Result<Self, VmError> {
        Self::with_config(frames, mapper, VasConfig::default(), &LOCAL_ONLY)
    }

    /// An empty address space with an explicit layout and shootdown hook.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the root table cannot be allocated.
    pub fn with_config(
        frames: &'f A,
        mapper: M,
        config: VasConfig,
        shootdown: &'static dyn TlbShootdown,
    ) -> Result<Self, VmError> {
        let pt = PageTable::with_shootdown(mapper, frames, shootdown)?;
        Ok(Self::from_page_table(frames, config, pt))
    }

    /// Wrap an existing tree, e.g. one obtained with [`PageTable::adopt`].
    ///
    /// Translations already in the tree are not described by any VMA; use
    /// [`reserve`](Self::reserve) to keep first fit away from them.
    pub fn from_page_table(frames: &'f A, config: VasConfig, pt: PageTable<C, M>) -> Self {
        Self {
            frames,
            mapper: pt.mapper().clone(),
            config,
            state: ManuallyDrop::new(spin::RwLock::new(VasState {
                vmas: VmaList::new(),
                pt: spin::Mutex::new(pt),
            })),
        }
    }

    /// Load the page table of this address space.
    ///
    /// # Safety
    /// See [`PageTable::activate`].
    pub unsafe fn activate(&self) {
        let state = self.state.read();
        unsafe { state.pt.lock().activate() };
    }

    #[must_use]
    pub const fn config(&self) -> &VasConfig {
        &self.config
    }

    /// Physical address of the root table.
    #[must_use]
    pub fn root_address(&self) -> PhysicalAddress {
        self.state.read().pt.lock().root_address()
    }

    /// Claim `[addr, addr + len)` (or a first-fit range) without backing.
    ///
    /// # Errors
    /// As for [`map`](Self::map).
    pub fn reserve(&self, addr: Option<VirtualAddress>, len: u64) -> Result<VirtualAddress, VmError> {
        self.map(addr, len, Attributes::empty(), MapFlags::empty(), Behavior::Reservation)
    }

    /// Create a VMA of `len` bytes (rounded up to the page size).
    ///
    /// With `addr` the VMA is placed there; otherwise the lowest free range
    /// of the configured window is used. Returns the start of the VMA.
    ///
    /// # Errors
    /// - [`VmError::NotSupported`] for shared file mappings or a page size
    ///   the architecture lacks.
    /// - [`VmError::InvalidRange`] for an empty range, a misaligned `addr`
    ///   or conflicting size hints.
    /// - [`VmError::InvalidAddress`] for a non-canonical range.
    /// - [`VmError::Conflict`] if `addr` overlaps a VMA and
    ///   [`MapFlags::REPLACE`] is not set.
    /// - [`VmError::OutOfMemory`] if no range is free or eager population
    ///   runs out of frames; the VMA is gone in that case.
    pub fn map(
        &self,
        addr: Option<VirtualAddress>,
        len: u64,
        attr: Attributes,
        flags: MapFlags,
        behavior: Behavior,
    ) -> Result<VirtualAddress, VmError> {
        let mut state = self.state.write();
        self.map_locked(&mut state, addr, len, attr, flags, behavior)
    }

    fn map_locked(
        &self,
        state: &mut VasState<C, M>,
        addr: Option<VirtualAddress>,
        len: u64,
        attr: Attributes,
        flags: MapFlags,
        behavior: Behavior,
    ) -> Result<VirtualAddress, VmError> {
        let size = flags.page_size()?;
        if !C::supports(size) {
            return Err(VmError::NotSupported);
        }
        behavior.check(size)?;
        let len = align_up(len, size.bytes())
            .filter(|&l| l != 0)
            .ok_or(VmError::InvalidRange)?;

        let start = match addr {
            Some(va) => {
                if !va.is_aligned(size) {
                    return Err(VmError::InvalidRange);
                }
                let end = self.check_range(va, len)?;
                if !state.vmas.is_free(va, end) {
                    if !flags.contains(MapFlags::REPLACE) {
                        return Err(VmError::Conflict);
                    }
                    self.unmap_locked(state, va, end)?;
                }
                va
            }
            None => state
                .vmas
                .first_fit(len, size.bytes(), self.config.vma_base, self.config.vma_end)
                .ok_or(VmError::OutOfMemory)?,
        };
        let end = start + len;

        let vma = Vma::new(start, end, attr, flags, size, behavior);
        debug!("vas: map {vma}");
        state.vmas.insert(vma)?;

        if flags.contains(MapFlags::POPULATE)
            && let Err(e) = self.populate_locked(state, start, end)
        {
            debug!("vas: populating {start:?}+{len:#x} failed: {e}");
            if let Err(undo) = self.unmap_locked(state, start, end) {
                warn!("vas: rolling back {start:?}+{len:#x} failed: {undo}");
            }
            return Err(e);
        }

        state.vmas.merge(start, end);
        Ok(start)
    }

    /// Map a stack of `size` bytes (`0` picks the configured default) with
    /// guard pages at both ends.
    ///
    /// `premapped` bytes at the growth end are populated right away: the top
    /// of a downward stack, the bottom of a [`StackFlags::GROWS_UP`] one.
    /// Returns the lowest usable address.
    ///
    /// # Errors
    /// As for [`map`](Self::map).
    pub fn map_stack(
        &self,
        addr: Option<VirtualAddress>,
        size: u64,
        flags: StackFlags,
        premapped: u64,
    ) -> Result<VirtualAddress, VmError> {
        let size = if size == 0 { self.config.default_stack_size } else { size };
        let size = align_up(size, PAGE_SIZE).ok_or(VmError::InvalidRange)?;
        let guard_bottom = self.config.stack_guard_bottom * PAGE_SIZE;
        let guard_top = self.config.stack_guard_top * PAGE_SIZE;
        let grows_up = flags.contains(StackFlags::GROWS_UP);
        let total = size
            .checked_add(guard_bottom + guard_top)
            .ok_or(VmError::InvalidRange)?;

        let mut state = self.state.write();
        let start = self.map_locked(
            &mut state,
            addr,
            total,
            Attributes::RW,
            MapFlags::empty(),
            Behavior::Stack {
                guard_bottom,
                guard_top,
                grows_up,
            },
        )?;
        let base = start + guard_bottom;
        let top = base + size;

        let premapped = align_up(premapped.min(size), PAGE_SIZE).unwrap_or(size);
        if premapped > 0 {
            let (lo, hi) = if grows_up {
                (base, base + premapped)
            } else {
                (VirtualAddress::new(top.as_u64() - premapped), top)
            };
            if let Err(e) = self.populate_locked(&mut state, lo, hi) {
                if let Err(undo) = self.unmap_locked(&mut state, start, start + total) {
                    warn!("vas: rolling back stack at {start:?} failed: {undo}");
                }
                return Err(e);
            }
        }
        Ok(base)
    }

    /// Map device memory at `pa` uncached and return its virtual address.
    ///
    /// # Errors
    /// As for [`map`](Self::map).
    pub fn map_device(&self, pa: PhysicalAddress, len: u64) -> Result<VirtualAddress, VmError> {
        if len == 0 {
            return Err(VmError::InvalidRange);
        }
        let offset = pa.page_offset(PageSize::Size4K);
        let len = offset.checked_add(len).ok_or(VmError::InvalidRange)?;
        let va = self.map(
            None,
            len,
            Attributes::RW | Attributes::UNCACHED,
            MapFlags::POPULATE,
            Behavior::Direct {
                phys: pa.align_down(PageSize::Size4K),
            },
        )?;
        Ok(va + offset)
    }

    /// Remove every VMA in `[addr, addr + len)`, splitting the ones that
    /// stick out, and release their backing.
    ///
    /// A range without VMAs is not an error.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] / [`VmError::InvalidAddress`] for a
    ///   malformed range, or one cutting a huge page.
    /// - [`VmError::NotSupported`] if only part of a stack is covered.
    pub fn unmap(&self, addr: VirtualAddress, len: u64) -> Result<(), VmError> {
        let end = self.check_request(addr, len)?;
        let mut state = self.state.write();
        self.unmap_locked(&mut state, addr, end)
    }

    pub(crate) fn unmap_locked(
        &self,
        state: &mut VasState<C, M>,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmError> {
        let VasState { vmas, pt } = state;
        if vmas.is_free(start, end) {
            return Ok(());
        }
        vmas.check_split(start)?;
        vmas.check_split(end)?;
        vmas.split_at(start)?;
        vmas.split_at(end)?;

        let pt = pt.get_mut();
        for vma in vmas.remove_range(start, end) {
            debug!("vas: unmap {vma}");
            if !vma.behavior.is_reservation() {
                pt.unmap(self.frames, vma.start, vma.len(), vma.behavior.frame_policy())?;
            }
        }
        Ok(())
    }

    /// Change the protection of `[addr, addr + len)`.
    ///
    /// VMAs are split at the boundaries, updated, and merged with their
    /// neighbors again. Installed pages are re-encoded in place; without any
    /// access bit they stop translating but keep their frames.
    ///
    /// # Errors
    /// - [`VmError::InvalidAddress`] if the range is not fully covered by VMAs.
    /// - [`VmError::NotSupported`] if only part of a stack is covered.
    /// - [`VmError::InvalidRange`] for a malformed range, or one cutting a
    ///   huge page.
    pub fn protect(&self, addr: VirtualAddress, len: u64, attr: Attributes) -> Result<(), VmError> {
        let end = self.check_request(addr, len)?;
        let mut state = self.state.write();
        let VasState { vmas, pt } = &mut *state;
        if !vmas.covers(addr, end) {
            return Err(VmError::InvalidAddress);
        }
        vmas.check_split(addr)?;
        vmas.check_split(end)?;
        vmas.split_at(addr)?;
        vmas.split_at(end)?;

        let pt = pt.get_mut();
        for vma in vmas.range_mut(addr, end) {
            vma.attributes = attr;
            if !vma.behavior.is_reservation() {
                pt.protect(self.frames, vma.start, vma.len(), attr)?;
            }
        }
        debug!("vas: protect {addr:?}+{len:#x} {attr}");
        vmas.merge(addr, end);
        Ok(())
    }

    /// Apply `advice` to `[addr, addr + len)`. Holes are ignored.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] / [`VmError::InvalidAddress`] for a
    ///   malformed range.
    /// - Population errors for [`Advice::WillNeed`]; pages populated before
    ///   the failure stay.
    pub fn advise(&self, addr: VirtualAddress, len: u64, advice: Advice) -> Result<(), VmError> {
        let end = self.check_request(addr, len)?;
        let mut state = self.state.write();
        match advice {
            Advice::WillNeed => self.populate_locked(&mut state, addr, end),
            Advice::DontNeed => self.discard_locked(&mut state, addr, end),
        }
    }

    /// Install every missing page of the accessible VMAs in `[start, end)`.
    fn populate_locked(
        &self,
        state: &mut VasState<C, M>,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmError> {
        let VasState { vmas, pt } = state;
        let pt = pt.get_mut();
        for vma in vmas.iter().filter(|v| v.overlaps(start, end)) {
            if vma.behavior.is_reservation() || !vma.attributes.is_accessible() {
                continue;
            }
            let size = vma.page_size;
            let usable = vma.usable();
            let lo = align_down(start.max(usable.start).as_u64(), size.bytes());
            let hi = align_up(end.min(usable.end).as_u64(), size.bytes()).unwrap_or(usable.end.as_u64());
            if lo >= hi {
                continue;
            }

            let zero = !vma.flags.contains(MapFlags::UNINITIALIZED);
            pt.map_with(
                self.frames,
                VirtualAddress::new(lo),
                hi - lo,
                vma.attributes,
                size,
                Occupied::Skip,
                |va, size| vma.behavior.populate(vma.start, va, size, self.frames, &self.mapper, zero),
            )?;
        }
        Ok(())
    }

    /// Drop the backing of whole pages in `[start, end)`.
    fn discard_locked(
        &self,
        state: &mut VasState<C, M>,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmError> {
        let VasState { vmas, pt } = state;
        let pt = pt.get_mut();
        for vma in vmas.iter().filter(|v| v.overlaps(start, end)) {
            if vma.behavior.is_reservation() {
                continue;
            }
            let size = vma.page_size.bytes();
            let lo = align_up(start.max(vma.start).as_u64(), size).unwrap_or(u64::MAX);
            let hi = align_down(end.min(vma.end).as_u64(), size);
            if lo < hi {
                pt.unmap(self.frames, VirtualAddress::new(lo), hi - lo, vma.behavior.frame_policy())?;
            }
        }
        Ok(())
    }

    /// Translate `va` through the page table.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<Translation> {
        self.state.read().pt.lock().walk(va)
    }

    /// Snapshot of all VMAs in address order.
    #[must_use]
    pub fn vmas(&self) -> Vec<Vma> {
        self.state.read().vmas.iter().cloned().collect()
    }

    /// The VMA containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<Vma> {
        self.state.read().vmas.find(va).cloned()
    }

    /// Validate a user-supplied range and return its end.
    fn check_request(&self, addr: VirtualAddress, len: u64) -> Result<VirtualAddress, VmError> {
        if !addr.is_aligned(PageSize::Size4K) {
            return Err(VmError::InvalidRange);
        }
        let len = align_up(len, PAGE_SIZE)
            .filter(|&l| l != 0)
            .ok_or(VmError::InvalidRange)?;
        self.check_range(addr, len)
    }

    fn check_range(&self, va: VirtualAddress, len: u64) -> Result<VirtualAddress, VmError> {
        let end = va.checked_add(len).ok_or(VmError::InvalidRange)?;
        let last = VirtualAddress::new(end.as_u64() - 1);
        if !C::is_canonical(va) || !C::is_canonical(last) || (va.as_u64() ^ last.as_u64()) >> 63 != 0 {
            return Err(VmError::InvalidAddress);
        }
        Ok(end)
    }
}

impl<C: PteCodec, M: PhysMapper + Clone, A: FrameAlloc> Drop for Vas<'_, C, M, A> {
    fn drop(&mut self) {
        let state = unsafe { ManuallyDrop::take(&mut self.state) }.into_inner();
        let VasState { vmas, pt } = state;
        let mut pt = pt.into_inner();
        for vma in vmas.iter().filter(|v| !v.behavior.is_reservation()) {
            if let Err(e) = pt.unmap(self.frames, vma.start, vma.len(), vma.behavior.frame_policy()) {
                warn!("vas: releasing {vma} failed: {e}");
            }
        }
        pt.destroy(self.frames, FramePolicy::Keep);
    }
}
