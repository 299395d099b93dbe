//! Bookkeeping for the intermediate tables of one [`PageTable`](super::PageTable).
//!
//! The hardware tables only hold physical addresses. To reclaim a table when
//! its last entry goes away we need its parent slot and a live-entry count;
//! both live here, keyed by a stable [`NodeId`] and indexed by frame address.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalAddress;

/// Handle of a table in the arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    const fn slot(self) -> usize {
        self.0 as usize
    }
}

/// One page-table frame.
#[derive(Copy, Clone, Debug)]
pub struct TableNode {
    /// Physical frame holding the 512 entries.
    pub frame: PhysicalAddress,
    /// Level of the entries in this table (0 holds 4 KiB leaves).
    pub level: usize,
    /// Number of present entries.
    pub live: u16,
    /// Parent table and the index of the entry pointing at us; `None` for
    /// the root.
    pub parent: Option<(NodeId, usize)>,
}

#[derive(Debug, Default)]
pub struct TableArena {
    slots: Vec<Option<TableNode>>,
    vacant: Vec<NodeId>,
    by_frame: BTreeMap<PhysicalAddress, NodeId>,
}

impl TableArena {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            by_frame: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, node: TableNode) -> NodeId {
        let frame = node.frame;
        let id = if let Some(id) = self.vacant.pop() {
            self.slots[id.slot()] = Some(node);
            id
        } else {
            let id = NodeId(u32::try_from(self.slots.len()).unwrap_or(u32::MAX));
            self.slots.push(Some(node));
            id
        };
        self.by_frame.insert(frame, id);
        id
    }

    pub fn remove(&mut self, id: NodeId) -> Option<TableNode> {
        let node = self.slots.get_mut(id.slot())?.take()?;
        self.by_frame.remove(&node.frame);
        self.vacant.push(id);
        Some(node)
    }

    #[inline]
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&TableNode> {
        self.slots.get(id.slot())?.as_ref()
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut TableNode> {
        self.slots.get_mut(id.slot())?.as_mut()
    }

    /// The table stored in `frame`, if it belongs to this arena.
    #[inline]
    #[must_use]
    pub fn lookup(&self, frame: PhysicalAddress) -> Option<NodeId> {
        self.by_frame.get(&frame).copied()
    }

    /// Number of tables, the root included.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_frame.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_frame.is_empty()
    }

    /// All live tables in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TableNode)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i as u32), n)))
    }
}
