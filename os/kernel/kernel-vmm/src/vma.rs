//! Virtual memory areas and the sorted list that tracks them.

use crate::VmError;
use crate::behavior::Behavior;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::ops::Range;
use kernel_memory_addresses::{PageSize, VirtualAddress, align_up};
use kernel_vmem::Attributes;
use log::debug;

bitflags! {
    /// Mapping flags, in the spirit of `MAP_*`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Populate the whole range before returning.
        const POPULATE = 1 << 0;
        /// Unmap whatever overlaps the requested fixed address first.
        const REPLACE = 1 << 1;
        /// Do not zero anonymous frames.
        const UNINITIALIZED = 1 << 2;
        /// Back the mapping with 2 MiB pages.
        const SIZE_2M = 1 << 3;
        /// Back the mapping with 1 GiB pages.
        const SIZE_1G = 1 << 4;
    }
}

impl MapFlags {
    /// Flags that stay attached to the VMA after the mapping call.
    pub const PERSISTENT: Self = Self::UNINITIALIZED;

    /// The page size requested by the size hints.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] if both hints are set.
    pub const fn page_size(self) -> Result<PageSize, VmError> {
        match (self.contains(Self::SIZE_2M), self.contains(Self::SIZE_1G)) {
            (false, false) => Ok(PageSize::Size4K),
            (true, false) => Ok(PageSize::Size2M),
            (false, true) => Ok(PageSize::Size1G),
            (true, true) => Err(VmError::InvalidRange),
        }
    }
}

/// A contiguous range of virtual memory with uniform attributes and behavior.
#[derive(Debug, Clone)]
pub struct Vma {
    pub(crate) start: VirtualAddress,
    pub(crate) end: VirtualAddress,
    pub(crate) attributes: Attributes,
    pub(crate) flags: MapFlags,
    pub(crate) page_size: PageSize,
    pub(crate) behavior: Behavior,
}

impl Vma {
    pub(crate) fn new(
        start: VirtualAddress,
        end: VirtualAddress,
        attributes: Attributes,
        flags: MapFlags,
        page_size: PageSize,
        behavior: Behavior,
    ) -> Self {
        debug_assert!(start < end, "VMA start must be < end");
        debug_assert!(start.is_aligned(page_size) && end.is_aligned(page_size));
        Self {
            start,
            end,
            attributes,
            flags: flags & MapFlags::PERSISTENT,
            page_size,
            behavior,
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Exclusive end.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[inline]
    #[must_use]
    pub const fn attributes(&self) -> Attributes {
        self.attributes
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> MapFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub const fn behavior(&self) -> &Behavior {
        &self.behavior
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start < end && start < self.end
    }

    /// The part of the VMA that may be backed; excludes stack guards.
    #[must_use]
    pub fn usable(&self) -> Range<VirtualAddress> {
        let (bottom, top) = self.behavior.guards();
        (self.start + bottom)..VirtualAddress::new(self.end.as_u64() - top)
    }

    /// Whether `va` falls into a guard page.
    #[must_use]
    pub fn is_guard(&self, va: VirtualAddress) -> bool {
        self.contains(va) && !self.usable().contains(&va)
    }

    fn covers(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start >= start && self.end <= end
    }

    /// Whether `next` can be folded into this VMA.
    fn mergeable(&self, next: &Self) -> bool {
        self.end == next.start
            && self.attributes == next.attributes
            && self.flags == next.flags
            && self.page_size == next.page_size
            && self.behavior.continues(self.len(), &next.behavior)
    }
}

impl fmt::Display for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}-{:?} {} {} {}",
            self.start,
            self.end,
            self.attributes,
            self.behavior.name(),
            self.page_size
        )
    }
}

/// Sorted list of non-overlapping VMAs.
#[derive(Debug, Default, Clone)]
pub struct VmaList {
    vmas: Vec<Vma>,
}

impl VmaList {
    #[must_use]
    pub const fn new() -> Self {
        Self { vmas: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vmas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vmas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter()
    }

    /// The VMA containing `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<&Vma> {
        let i = self.vmas.partition_point(|v| v.end <= va);
        self.vmas.get(i).filter(|v| v.contains(va))
    }

    /// Indices of the VMAs overlapping `[start, end)`.
    #[must_use]
    pub fn overlapping(&self, start: VirtualAddress, end: VirtualAddress) -> Range<usize> {
        let first = self.vmas.partition_point(|v| v.end <= start);
        let last = self.vmas.partition_point(|v| v.start < end);
        first..last.max(first)
    }

    #[must_use]
    pub fn is_free(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.overlapping(start, end).is_empty()
    }

    /// Whether the VMAs in `[start, end)` cover it without holes.
    #[must_use]
    pub fn covers(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        let mut cursor = start;
        for vma in &self.vmas[self.overlapping(start, end)] {
            if vma.start > cursor {
                return false;
            }
            cursor = vma.end;
        }
        cursor >= end
    }

    /// Insert a VMA.
    ///
    /// # Errors
    /// [`VmError::Conflict`] if it overlaps an existing one.
    pub fn insert(&mut self, vma: Vma) -> Result<(), VmError> {
        if !self.is_free(vma.start, vma.end) {
            return Err(VmError::Conflict);
        }
        let pos = self.vmas.partition_point(|v| v.start < vma.start);
        self.vmas.insert(pos, vma);
        Ok(())
    }

    /// Lowest `align`-aligned gap of `len` bytes inside `[base, end)`.
    #[must_use]
    pub fn first_fit(
        &self,
        len: u64,
        align: u64,
        base: VirtualAddress,
        end: VirtualAddress,
    ) -> Option<VirtualAddress> {
        let mut candidate = align_up(base.as_u64(), align)?;
        for vma in &self.vmas[self.overlapping(base, end)] {
            if candidate.checked_add(len)? <= vma.start.as_u64() {
                break;
            }
            candidate = candidate.max(align_up(vma.end.as_u64(), align)?);
        }
        let fits = candidate.checked_add(len)? <= end.as_u64();
        fits.then_some(VirtualAddress::new(candidate))
    }

    /// Check that splitting at `va` is possible.
    ///
    /// # Errors
    /// - [`VmError::NotSupported`] if `va` falls inside a stack.
    /// - [`VmError::InvalidRange`] if `va` is not aligned to the page size of
    ///   the VMA it splits.
    pub fn check_split(&self, va: VirtualAddress) -> Result<(), VmError> {
        match self.find(va) {
            Some(vma) if vma.start != va => {
                if vma.behavior.is_stack() {
                    Err(VmError::NotSupported)
                } else if !va.is_aligned(vma.page_size) {
                    Err(VmError::InvalidRange)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Make `va` a VMA boundary.
    ///
    /// # Errors
    /// See [`check_split`](Self::check_split).
    pub fn split_at(&mut self, va: VirtualAddress) -> Result<(), VmError> {
        self.check_split(va)?;
        let i = self.vmas.partition_point(|v| v.end <= va);
        let Some(vma) = self.vmas.get_mut(i).filter(|v| v.start < va && va < v.end) else {
            return Ok(());
        };

        let right = Vma {
            start: va,
            end: vma.end,
            attributes: vma.attributes,
            flags: vma.flags,
            page_size: vma.page_size,
            behavior: vma.behavior.split_off(va - vma.start),
        };
        vma.end = va;
        debug!("vma: split {vma} | {right}");
        self.vmas.insert(i + 1, right);
        Ok(())
    }

    /// Take every VMA fully inside `[start, end)` out of the list.
    ///
    /// Callers split at the boundaries first.
    pub fn remove_range(&mut self, start: VirtualAddress, end: VirtualAddress) -> Vec<Vma> {
        let range = self.overlapping(start, end);
        debug_assert!(self.vmas[range.clone()].iter().all(|v| v.covers(start, end)));
        self.vmas.drain(range).collect()
    }

    /// Mutable access to the VMAs overlapping `[start, end)`.
    pub fn range_mut(&mut self, start: VirtualAddress, end: VirtualAddress) -> &mut [Vma] {
        let range = self.overlapping(start, end);
        &mut self.vmas[range]
    }

    /// Fold compatible neighbors in and around `[start, end)`.
    pub fn merge(&mut self, start: VirtualAddress, end: VirtualAddress) {
        let range = self.overlapping(start, end);
        let mut i = range.start.saturating_sub(1);
        let mut last = (range.end + 1).min(self.vmas.len());

        while i + 1 < last {
            if self.vmas[i].mergeable(&self.vmas[i + 1]) {
                let next = self.vmas.remove(i + 1);
                debug!("vma: merge {} + {next}", self.vmas[i]);
                self.vmas[i].end = next.end;
                last -= 1;
            } else {
                i += 1;
            }
        }
    }
}
