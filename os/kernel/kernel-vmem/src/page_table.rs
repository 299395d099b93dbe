//! # Page Table
//!
//! Architecture-neutral page-table tree, generic over a [`PteCodec`] for the
//! entry layout and a [`PhysMapper`] for reaching table frames.
//!
//! ## Highlights
//!
//! - [`PageTable::map`] / [`PageTable::map_with`] install a range of leaves of
//!   one [`PageSize`], creating intermediate tables on demand.
//! - [`PageTable::unmap`] and [`PageTable::protect`] skip holes and split
//!   huge leaves that are only partially covered.
//! - Intermediate tables whose last entry goes away are unlinked and their
//!   frame is returned right away, so an empty tree is just the root.
//! - [`PageTable::walk`] translates a virtual address and reports the leaf.
//! - Leaves without any access are *parked*: the MMU sees an invalid entry,
//!   the walker still knows the frame, and granting access restores them.
//!
//! ## Design
//!
//! Table memory is viewed as `[AtomicU64; 512]`. Loads use `Acquire` and
//! stores `Release`, so a concurrent hardware or software walker never sees a
//! table pointer before the table was zeroed. Writers are serialized by
//! `&mut self`.
//!
//! Per-table metadata (level, parent slot, live-entry count) lives in a
//! [`TableArena`] next to the tree rather than in the tables themselves.
//!
//! ## TLB maintenance
//!
//! Invalidation is issued only once the table was [activated](PageTable::activate).
//! On architectures without broadcast invalidation the configured
//! [`TlbShootdown`] runs after every local flush.

mod arena;

use crate::arch::{ENTRIES_PER_TABLE, PteCodec, level_frames, level_size};
use crate::{Attributes, FrameAlloc, LOCAL_ONLY, PhysMapper, TlbShootdown};
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::{PageSize, PhysicalAddress, VirtualAddress, align_down};
use log::{trace, warn};

pub use self::arena::{NodeId, TableArena, TableNode};

#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum PageTableError {
    #[error("out of memory for page-table frames")]
    OutOfMemory,
    #[error("range is empty, misaligned or overflows")]
    InvalidRange,
    #[error("address is not canonical or not addressable")]
    InvalidAddress,
    #[error("range is already mapped")]
    Conflict,
    #[error("page size not supported by this architecture")]
    NotSupported,
}

/// What to do with the frames behind removed leaves.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FramePolicy {
    /// Frames stay owned by the caller (device windows, shared frames).
    Keep,
    /// Frames are returned to the allocator.
    Release,
}

/// What [`PageTable::map_with`] does when it meets an existing entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Occupied {
    /// Stop with [`PageTableError::Conflict`].
    Fail,
    /// Leave the existing translation alone and continue.
    Skip,
}

/// Result of [`PageTable::walk`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// The physical address `va` translates to.
    pub address: PhysicalAddress,
    /// Base of the leaf frame.
    pub frame: PhysicalAddress,
    /// Size of the leaf.
    pub size: PageSize,
    /// Decoded leaf attributes.
    pub attributes: Attributes,
    /// The raw entry, for diagnostics.
    pub raw: u64,
}

#[repr(C, align(4096))]
struct RawTable([AtomicU64; ENTRIES_PER_TABLE]);

const _: () = assert!(size_of::<RawTable>() == 4096);

/// Where a downward walk ended.
enum Descent {
    /// The table holding the entries of the requested level.
    Table(NodeId),
    /// A leaf at `level` already covers the address.
    Covered { level: usize },
}

/// Where a lookup ended.
enum Slot {
    /// No translation; the hole spans one entry at `level`.
    Absent { level: usize },
    /// A present or parked leaf. `pte` always holds the present form.
    Leaf {
        node: NodeId,
        level: usize,
        index: usize,
        pte: u64,
        parked: bool,
    },
}

/// A page-table tree rooted at one table frame.
///
/// Dropping a `PageTable` leaks its frames; use [`PageTable::destroy`].
pub struct PageTable<C: PteCodec, M: PhysMapper> {
    mapper: M,
    arena: TableArena,
    root: NodeId,
    active: bool,
    shootdown: &'static dyn TlbShootdown,
    _codec: PhantomData<fn() -> C>,
}

impl<C: PteCodec, M: PhysMapper> PageTable<C, M> {
    /// Create an empty tree with a freshly zeroed root.
    ///
    /// # Errors
    /// [`PageTableError::OutOfMemory`] if no frame is available for the root.
    pub fn new<A: FrameAlloc>(mapper: M, frames: &A) -> Result<Self, PageTableError> {
        Self::with_shootdown(mapper, frames, &LOCAL_ONLY)
    }

    /// Like [`new`](Self::new) with a platform shootdown hook.
    ///
    /// # Errors
    /// [`PageTableError::OutOfMemory`] if no frame is available for the root.
    pub fn with_shootdown<A: FrameAlloc>(
        mapper: M,
        frames: &A,
        shootdown: &'static dyn TlbShootdown,
    ) -> Result<Self, PageTableError> {
        let root = alloc_table(&mapper, frames)?;
        let mut arena = TableArena::new();
        let id = arena.insert(TableNode {
            frame: root,
            level: C::LEVELS - 1,
            live: 0,
            parent: None,
        });
        trace!("{}: new page table, root {root:?}", C::NAME);
        Ok(Self {
            mapper,
            arena,
            root: id,
            active: false,
            shootdown,
            _codec: PhantomData,
        })
    }

    /// Take over an existing tree, e.g. the one built by the boot loader.
    ///
    /// Every reachable table is registered so that it can be reclaimed later.
    /// The returned table is inactive; see [`assume_active`](Self::assume_active).
    ///
    /// # Safety
    /// `root` must be a well-formed tree for codec `C` whose frames are not
    /// referenced by any other `PageTable` and are reachable through `mapper`.
    pub unsafe fn adopt(mapper: M, root: PhysicalAddress, shootdown: &'static dyn TlbShootdown) -> Self {
        let mut arena = TableArena::new();
        let root_id = arena.insert(TableNode {
            frame: root,
            level: C::LEVELS - 1,
            live: 0,
            parent: None,
        });
        let mut this = Self {
            mapper,
            arena,
            root: root_id,
            active: false,
            shootdown,
            _codec: PhantomData,
        };

        let mut pending = Vec::from([root_id]);
        while let Some(id) = pending.pop() {
            let node = this.node(id);
            let mut live = 0u16;
            for index in 0..ENTRIES_PER_TABLE {
                let pte = this.load(node.frame, index);
                if C::is_parked(pte) {
                    live += 1;
                    continue;
                }
                if !C::is_present(pte) {
                    continue;
                }
                live += 1;
                if node.level > 0 && !C::is_leaf(pte, node.level) {
                    pending.push(this.arena.insert(TableNode {
                        frame: C::address(pte, node.level),
                        level: node.level - 1,
                        live: 0,
                        parent: Some((id, index)),
                    }));
                }
            }
            this.node_mut(id).live = live;
        }
        trace!("{}: adopted page table at {root:?} with {} tables", C::NAME, this.arena.len());
        this
    }

    /// Load this tree into the page-table base register.
    ///
    /// From now on every change is followed by TLB maintenance.
    ///
    /// # Safety
    /// The tree must map all code, data and stacks the CPU uses after the switch.
    pub unsafe fn activate(&mut self) {
        unsafe { C::write_root(self.root_address()) };
        self.active = true;
    }

    /// Mark the tree as the one the CPU already walks, without touching the
    /// base register.
    ///
    /// # Safety
    /// The base register must actually point at [`root_address`](Self::root_address).
    pub const unsafe fn assume_active(&mut self) {
        self.active = true;
    }

    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Physical address of the root table.
    #[inline]
    #[must_use]
    pub fn root_address(&self) -> PhysicalAddress {
        self.node(self.root).frame
    }

    /// Number of table frames in use, the root included.
    #[inline]
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Map `[va, va + len)` to `[pa, pa + len)` with leaves of `size`.
    ///
    /// All or nothing: on any error the leaves this call installed are
    /// removed again before returning.
    ///
    /// # Errors
    /// - [`PageTableError::NotSupported`] if the codec cannot express `size`.
    /// - [`PageTableError::InvalidRange`] if `va`, `pa` or `len` is not
    ///   `size`-aligned, or `len` is zero.
    /// - [`PageTableError::InvalidAddress`] for non-canonical `va` or an
    ///   unaddressable `pa`.
    /// - [`PageTableError::Conflict`] if a translation already exists.
    /// - [`PageTableError::OutOfMemory`] if a table frame cannot be allocated.
    pub fn map<A: FrameAlloc>(
        &mut self,
        frames: &A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        attr: Attributes,
        size: PageSize,
    ) -> Result<usize, PageTableError> {
        if !pa.is_aligned(size) {
            return Err(PageTableError::InvalidRange);
        }
        match self.fill(frames, va, len, attr, size, Occupied::Fail, &mut |v, _| {
            Ok::<_, PageTableError>(pa + (v - va))
        }) {
            Ok(n) => Ok(n),
            Err((e, reached)) => {
                let done = reached - va.as_u64();
                if done > 0
                    && let Err(undo) = self.unmap(frames, va, done, FramePolicy::Keep)
                {
                    warn!("{}: rolling back {va:?}+{done:#x} failed: {undo}", C::NAME);
                }
                Err(e)
            }
        }
    }

    /// Install leaves of `size` over `[va, va + len)`, asking `produce` for
    /// the frame of each one.
    ///
    /// `produce` runs only for slots that are actually going to be filled.
    /// On error, leaves installed by this call before the failure stay
    /// mapped; intermediate tables created for the failing slot are
    /// reclaimed.
    ///
    /// Returns the number of leaves installed.
    ///
    /// # Errors
    /// As for [`map`](Self::map), plus whatever `produce` returns.
    #[allow(clippy::too_many_arguments)]
    pub fn map_with<A, E, F>(
        &mut self,
        frames: &A,
        va: VirtualAddress,
        len: u64,
        attr: Attributes,
        size: PageSize,
        occupied: Occupied,
        mut produce: F,
    ) -> Result<usize, E>
    where
        A: FrameAlloc,
        E: From<PageTableError>,
        F: FnMut(VirtualAddress, PageSize) -> Result<PhysicalAddress, E>,
    {
        self.fill(frames, va, len, attr, size, occupied, &mut produce)
            .map_err(|(e, _)| e)
    }

    #[allow(clippy::too_many_arguments)]
    fn fill<A, E, F>(
        &mut self,
        frames: &A,
        va: VirtualAddress,
        len: u64,
        attr: Attributes,
        size: PageSize,
        occupied: Occupied,
        produce: &mut F,
    ) -> Result<usize, (E, u64)>
    where
        A: FrameAlloc,
        E: From<PageTableError>,
        F: FnMut(VirtualAddress, PageSize) -> Result<PhysicalAddress, E>,
    {
        let end = self
            .check_range(va, len, size)
            .map_err(|e| (E::from(e), va.as_u64()))?;
        let level = size.level();
        let mut cursor = va.as_u64();
        let mut installed = 0;

        while cursor < end {
            let here = VirtualAddress::new(cursor);
            let node = match self.descend(frames, here, level) {
                Ok(Descent::Table(node)) => node,
                Ok(Descent::Covered { level: covering }) => {
                    if occupied == Occupied::Fail {
                        return Err((PageTableError::Conflict.into(), cursor));
                    }
                    cursor = align_down(cursor, level_size(covering)).saturating_add(level_size(covering));
                    continue;
                }
                Err(e) => return Err((e.into(), cursor)),
            };

            let frame = self.node(node).frame;
            let index = C::index(here, level);
            if in_use::<C>(self.load(frame, index)) {
                if occupied == Occupied::Fail {
                    return Err((PageTableError::Conflict.into(), cursor));
                }
                cursor += size.bytes();
                continue;
            }

            let pa = match produce(here, size) {
                Ok(pa) => pa,
                Err(e) => {
                    self.collect(frames, node);
                    return Err((e, cursor));
                }
            };
            let end_pa = pa.as_u64().checked_add(size.bytes() - 1).map(PhysicalAddress::new);
            if !pa.is_aligned(size) || end_pa.is_none_or(|e| !C::is_valid_pa(e)) {
                self.collect(frames, node);
                let e = if pa.is_aligned(size) {
                    PageTableError::InvalidAddress
                } else {
                    PageTableError::InvalidRange
                };
                return Err((e.into(), cursor));
            }

            self.store(frame, index, leaf::<C>(C::make_leaf(pa, attr, level), attr));
            self.node_mut(node).live += 1;
            installed += 1;
            cursor += size.bytes();
        }

        trace!("{}: mapped {installed} x {size} at {va:?}", C::NAME);
        Ok(installed)
    }

    /// Remove every translation in `[va, va + len)`.
    ///
    /// Holes are skipped. A huge leaf that is only partly inside the range is
    /// first split into leaves of the next smaller size. Returns the number of
    /// leaves removed.
    ///
    /// # Errors
    /// - [`PageTableError::InvalidRange`] / [`PageTableError::InvalidAddress`]
    ///   for a malformed range.
    /// - [`PageTableError::OutOfMemory`] if splitting a huge leaf needs a
    ///   table frame that cannot be allocated. Leaves before the failing one
    ///   are already gone.
    pub fn unmap<A: FrameAlloc>(
        &mut self,
        frames: &A,
        va: VirtualAddress,
        len: u64,
        policy: FramePolicy,
    ) -> Result<usize, PageTableError> {
        let end = self.check_range(va, len, PageSize::Size4K)?;
        let mut cursor = va.as_u64();
        let mut removed = 0;

        while cursor < end {
            match self.locate(VirtualAddress::new(cursor)) {
                Slot::Absent { level } => {
                    cursor = align_down(cursor, level_size(level)).saturating_add(level_size(level));
                }
                Slot::Leaf {
                    node,
                    level,
                    index,
                    pte,
                    parked,
                } => {
                    let size = level_size(level);
                    let base = align_down(cursor, size);
                    if base < cursor || base.saturating_add(size) > end {
                        self.demote(frames, node, index, level, pte, parked, VirtualAddress::new(base))?;
                        continue;
                    }

                    let frame = self.node(node).frame;
                    self.store(frame, index, 0);
                    self.node_mut(node).live -= 1;
                    self.invalidate(VirtualAddress::new(base));
                    if policy == FramePolicy::Release {
                        frames.free_frames(C::address(pte, level), level_frames(level));
                    }
                    self.collect(frames, node);
                    removed += 1;
                    cursor = base.saturating_add(size);
                }
            }
        }

        trace!("{}: unmapped {removed} leaves in {va:?}+{len:#x}", C::NAME);
        Ok(removed)
    }

    /// Replace the attributes of every leaf in `[va, va + len)`.
    ///
    /// Holes are skipped; partly covered huge leaves are split first. Without
    /// any access bit the leaves are parked, otherwise they are made present
    /// again. Returns the number of leaves changed.
    ///
    /// # Errors
    /// As for [`unmap`](Self::unmap).
    pub fn protect<A: FrameAlloc>(
        &mut self,
        frames: &A,
        va: VirtualAddress,
        len: u64,
        attr: Attributes,
    ) -> Result<usize, PageTableError> {
        let end = self.check_range(va, len, PageSize::Size4K)?;
        let mut cursor = va.as_u64();
        let mut changed = 0;

        while cursor < end {
            match self.locate(VirtualAddress::new(cursor)) {
                Slot::Absent { level } => {
                    cursor = align_down(cursor, level_size(level)).saturating_add(level_size(level));
                }
                Slot::Leaf {
                    node,
                    level,
                    index,
                    pte,
                    parked,
                } => {
                    let size = level_size(level);
                    let base = align_down(cursor, size);
                    if base < cursor || base.saturating_add(size) > end {
                        self.demote(frames, node, index, level, pte, parked, VirtualAddress::new(base))?;
                        continue;
                    }

                    let frame = self.node(node).frame;
                    self.store(frame, index, leaf::<C>(C::with_attributes(pte, attr, level), attr));
                    self.invalidate(VirtualAddress::new(base));
                    changed += 1;
                    cursor = base.saturating_add(size);
                }
            }
        }
        Ok(changed)
    }

    /// Translate `va` the way the MMU would; parked leaves do not translate.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<Translation> {
        if !C::is_canonical(va) {
            return None;
        }
        match self.locate(va) {
            Slot::Absent { .. } | Slot::Leaf { parked: true, .. } => None,
            Slot::Leaf { level, pte, .. } => {
                let size = PageSize::from_level(level)?;
                let frame = C::address(pte, level);
                Some(Translation {
                    address: frame + va.page_offset(size),
                    frame,
                    size,
                    attributes: C::attributes(pte, level),
                    raw: pte,
                })
            }
        }
    }

    /// Drop the local TLB entry for `va` if this tree is active.
    ///
    /// Used after a fault found the translation already in place.
    pub fn flush(&self, va: VirtualAddress) {
        if self.active {
            unsafe { C::invalidate_page(va) };
        }
    }

    /// Free every table frame and, with [`FramePolicy::Release`], every mapped
    /// frame.
    ///
    /// An active tree is leaked with a warning, since the CPU may still walk it.
    pub fn destroy<A: FrameAlloc>(self, frames: &A, policy: FramePolicy) {
        if self.active {
            warn!(
                "{}: refusing to free the active page table at {:?}",
                C::NAME,
                self.root_address()
            );
            return;
        }

        let nodes: Vec<TableNode> = self.arena.iter().map(|(_, n)| *n).collect();
        for node in &nodes {
            if policy == FramePolicy::Release {
                for index in 0..ENTRIES_PER_TABLE {
                    let mut pte = self.load(node.frame, index);
                    if C::is_parked(pte) {
                        pte = C::unpark(pte);
                    }
                    if C::is_present(pte) && (node.level == 0 || C::is_leaf(pte, node.level)) {
                        frames.free_frames(C::address(pte, node.level), level_frames(node.level));
                    }
                }
            }
            frames.free_4k(node.frame);
        }
        trace!("{}: destroyed page table with {} tables", C::NAME, nodes.len());
    }

    fn check_range(&self, va: VirtualAddress, len: u64, size: PageSize) -> Result<u64, PageTableError> {
        if !C::supports(size) {
            return Err(PageTableError::NotSupported);
        }
        if len == 0 || !va.is_aligned(size) || len % size.bytes() != 0 {
            return Err(PageTableError::InvalidRange);
        }
        let end = va.as_u64().checked_add(len).ok_or(PageTableError::InvalidRange)?;
        let last = end - 1;
        if !C::is_canonical(va) || !C::is_canonical(VirtualAddress::new(last)) {
            return Err(PageTableError::InvalidAddress);
        }
        if (va.as_u64() ^ last) >> 63 != 0 {
            return Err(PageTableError::InvalidAddress);
        }
        Ok(end)
    }

    /// Walk towards `va`, creating tables down to `level`.
    fn descend<A: FrameAlloc>(
        &mut self,
        frames: &A,
        va: VirtualAddress,
        level: usize,
    ) -> Result<Descent, PageTableError> {
        let mut node = self.root;
        let mut current = C::LEVELS - 1;
        while current > level {
            let frame = self.node(node).frame;
            let index = C::index(va, current);
            let pte = self.load(frame, index);
            node = if C::is_parked(pte) {
                return Ok(Descent::Covered { level: current });
            } else if !C::is_present(pte) {
                match self.link_table(frames, node, index) {
                    Ok(child) => child,
                    Err(e) => {
                        self.collect(frames, node);
                        return Err(e);
                    }
                }
            } else if C::is_leaf(pte, current) {
                return Ok(Descent::Covered { level: current });
            } else {
                self.child(C::address(pte, current))
            };
            current -= 1;
        }
        Ok(Descent::Table(node))
    }

    /// Read-only walk to the leaf or hole covering `va`.
    fn locate(&self, va: VirtualAddress) -> Slot {
        let mut node = self.root;
        let mut level = C::LEVELS - 1;
        loop {
            let frame = self.node(node).frame;
            let index = C::index(va, level);
            let pte = self.load(frame, index);
            if C::is_parked(pte) {
                return Slot::Leaf {
                    node,
                    level,
                    index,
                    pte: C::unpark(pte),
                    parked: true,
                };
            }
            if !C::is_present(pte) {
                return Slot::Absent { level };
            }
            if level == 0 || C::is_leaf(pte, level) {
                return Slot::Leaf {
                    node,
                    level,
                    index,
                    pte,
                    parked: false,
                };
            }
            node = self.child(C::address(pte, level));
            level -= 1;
        }
    }

    fn link_table<A: FrameAlloc>(
        &mut self,
        frames: &A,
        parent: NodeId,
        index: usize,
    ) -> Result<NodeId, PageTableError> {
        let frame = alloc_table(&self.mapper, frames)?;
        let p = self.node(parent);
        let id = self.arena.insert(TableNode {
            frame,
            level: p.level - 1,
            live: 0,
            parent: Some((parent, index)),
        });
        self.store(p.frame, index, C::make_table(frame));
        self.node_mut(parent).live += 1;
        Ok(id)
    }

    /// Replace the huge leaf in `node[index]` by a full table of leaves of the
    /// next smaller size with the same attributes.
    #[allow(clippy::too_many_arguments)]
    fn demote<A: FrameAlloc>(
        &mut self,
        frames: &A,
        node: NodeId,
        index: usize,
        level: usize,
        pte: u64,
        parked: bool,
        base: VirtualAddress,
    ) -> Result<(), PageTableError> {
        let table = alloc_table(&self.mapper, frames)?;
        let child_level = level - 1;
        let attr = C::attributes(pte, level);
        let pa = C::address(pte, level);
        let step = level_size(child_level);
        for i in 0..ENTRIES_PER_TABLE {
            let child = C::make_leaf(pa + i as u64 * step, attr, child_level);
            self.store(table, i, if parked { C::park(child) } else { child });
        }
        self.arena.insert(TableNode {
            frame: table,
            level: child_level,
            live: ENTRIES_PER_TABLE as u16,
            parent: Some((node, index)),
        });
        let frame = self.node(node).frame;
        self.store(frame, index, C::make_table(table));
        self.invalidate(base);
        trace!("{}: split {} leaf at {base:?}", C::NAME, level_size(level));
        Ok(())
    }

    /// Unlink and free `node` and its ancestors while they are empty.
    fn collect<A: FrameAlloc>(&mut self, frames: &A, node: NodeId) {
        let mut id = node;
        let mut freed = false;
        loop {
            let n = self.node(id);
            let Some((parent, index)) = n.parent else {
                break;
            };
            if n.live != 0 {
                break;
            }
            let parent_frame = self.node(parent).frame;
            self.store(parent_frame, index, 0);
            self.arena.remove(id);
            self.node_mut(parent).live -= 1;
            if !freed {
                // Paging-structure caches may still hold the unlinked table.
                self.invalidate_all();
                freed = true;
            }
            frames.free_4k(n.frame);
            id = parent;
        }
    }

    fn invalidate(&self, va: VirtualAddress) {
        if !self.active {
            return;
        }
        unsafe { C::invalidate_page(va) };
        if !C::BROADCAST_INVALIDATE {
            self.shootdown.shootdown(Some(va));
        }
    }

    fn invalidate_all(&self) {
        if !self.active {
            return;
        }
        unsafe { C::invalidate_all() };
        if !C::BROADCAST_INVALIDATE {
            self.shootdown.shootdown(None);
        }
    }

    #[inline]
    fn entries(&self, frame: PhysicalAddress) -> &RawTable {
        // SAFETY: table frames belong to this tree and are reachable through
        // the mapper; entries are only accessed atomically.
        unsafe { self.mapper.phys_to_mut::<RawTable>(frame) }
    }

    #[inline]
    fn load(&self, frame: PhysicalAddress, index: usize) -> u64 {
        self.entries(frame).0[index].load(Ordering::Acquire)
    }

    #[inline]
    fn store(&self, frame: PhysicalAddress, index: usize, pte: u64) {
        self.entries(frame).0[index].store(pte, Ordering::Release);
    }

    #[inline]
    fn node(&self, id: NodeId) -> TableNode {
        match self.arena.node(id) {
            Some(n) => *n,
            None => corrupted(id),
        }
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> &mut TableNode {
        match self.arena.node_mut(id) {
            Some(n) => n,
            None => corrupted(id),
        }
    }

    #[inline]
    fn child(&self, frame: PhysicalAddress) -> NodeId {
        match self.arena.lookup(frame) {
            Some(id) => id,
            None => panic!("{}: table {frame:?} is not part of this tree", C::NAME),
        }
    }
}

/// Whether a slot holds a leaf or table, present or parked.
#[inline]
fn in_use<C: PteCodec>(pte: u64) -> bool {
    C::is_present(pte) || C::is_parked(pte)
}

/// `pte` as stored for `attr`: parked when nothing may access it.
#[inline]
fn leaf<C: PteCodec>(pte: u64, attr: Attributes) -> u64 {
    if attr.is_accessible() { pte } else { C::park(pte) }
}

#[cold]
fn corrupted(id: NodeId) -> ! {
    panic!("page-table arena corrupted: stale node {id:?}")
}

fn alloc_table<M: PhysMapper, A: FrameAlloc>(
    mapper: &M,
    frames: &A,
) -> Result<PhysicalAddress, PageTableError> {
    let frame = frames.alloc_4k().ok_or(PageTableError::OutOfMemory)?;
    unsafe { mapper.zero_frames(frame, 1) };
    Ok(frame)
}
