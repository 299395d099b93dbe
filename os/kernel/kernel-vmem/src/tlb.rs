use kernel_memory_addresses::VirtualAddress;

/// Cross-CPU TLB invalidation.
///
/// Called by the walker after it changed or removed an entry of an *active*
/// table on an architecture whose invalidate instruction is CPU local. The
/// implementation must make every other CPU drop its cached translation for
/// `page` (or for the whole address space if `page` is `None`) before
/// returning.
pub trait TlbShootdown: Sync {
    fn shootdown(&self, page: Option<VirtualAddress>);
}

/// Shootdown for uniprocessor configurations: the local flush suffices.
#[derive(Debug, Copy, Clone, Default)]
pub struct LocalOnly;

impl TlbShootdown for LocalOnly {
    #[inline]
    fn shootdown(&self, _page: Option<VirtualAddress>) {}
}

/// The default shootdown used by [`PageTable::new`](crate::PageTable::new).
pub static LOCAL_ONLY: LocalOnly = LocalOnly;
