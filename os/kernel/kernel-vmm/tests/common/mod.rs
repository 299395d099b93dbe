//! Simulated RAM for address-space tests.

#![allow(dead_code)]

use kernel_alloc::{BuddyFrameAllocator, HhdmPhysMapper};
use kernel_vmem::addresses::PhysicalAddress;
use kernel_vmem::{PhysMapper, PteCodec};
use kernel_vmm::Vas;
use std::sync::Arc;

/// Physical address of the first simulated frame; 1 GiB aligned so the buddy
/// allocator can hand out naturally aligned huge blocks.
pub const RAM_BASE: u64 = 0x4000_0000;

#[repr(C, align(4096))]
pub struct Frame([u8; 4096]);

pub struct TestRam {
    _mem: Vec<Frame>,
    pub mapper: HhdmPhysMapper,
    pub frames: BuddyFrameAllocator<HhdmPhysMapper>,
}

impl TestRam {
    /// `count` frames of RAM, all of it handed to the allocator.
    pub fn new(count: usize) -> Self {
        Self::partial(count, count)
    }

    /// `count` frames of RAM of which only the first `seeded` are handed to
    /// the allocator.
    pub fn partial(count: usize, seeded: usize) -> Self {
        let mem: Vec<Frame> = (0..count).map(|_| Frame([0; 4096])).collect();
        let mapper = HhdmPhysMapper::new((mem.as_ptr() as u64).wrapping_sub(RAM_BASE));
        let frames = BuddyFrameAllocator::new(mapper);
        unsafe { frames.add_memory(PhysicalAddress::new(RAM_BASE), seeded as u64 * 4096) }
            .expect("test RAM is large enough");
        Self {
            _mem: mem,
            mapper,
            frames,
        }
    }

    pub fn vas<C: PteCodec>(&self) -> Vas<'_, C, HhdmPhysMapper, BuddyFrameAllocator<HhdmPhysMapper>> {
        Vas::new(&self.frames, self.mapper).expect("root table")
    }

    pub fn free(&self) -> usize {
        self.frames.stats().free
    }

    pub fn page(&self, pa: PhysicalAddress) -> &mut [u8; 4096] {
        unsafe { self.mapper.phys_to_mut(pa.align_down(kernel_vmem::addresses::PageSize::Size4K)) }
    }
}

/// A file whose contents are held in memory.
pub struct MemFile {
    pub data: Vec<u8>,
    pub fail: bool,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { data, fail: false })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            data: Vec::new(),
            fail: true,
        })
    }
}

impl kernel_vmm::FileBacking for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, kernel_vmm::VmError> {
        if self.fail {
            return Err(kernel_vmm::VmError::Io);
        }
        let start = (offset as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start).min(1000);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}
