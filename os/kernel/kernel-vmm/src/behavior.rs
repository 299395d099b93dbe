//! # VMA Behaviors
//!
//! A [`Behavior`] decides where the frames of a VMA come from and what happens
//! to them when the VMA goes away:
//!
//! | Behavior | Populate | Release | Split | Merge |
//! |:---------|:---------|:--------|:------|:------|
//! | [`Anonymous`](Behavior::Anonymous) | fresh frame, zeroed | free | yes | yes |
//! | [`Stack`](Behavior::Stack) | fresh frame, zeroed; guards fatal | free | no | no |
//! | [`Direct`](Behavior::Direct) | `phys + offset` | keep | advances `phys` | if contiguous |
//! | [`File`](Behavior::File) | fresh frame, read from file | free | advances `offset` | same file, contiguous |
//! | [`Reservation`](Behavior::Reservation) | fatal | no-op | yes | yes |

use crate::VmError;
use crate::error::FatalReason;
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::{PAGE_SIZE, PageSize, PhysicalAddress, VirtualAddress};
use kernel_vmem::{FrameAlloc, FramePolicy, PhysMapper};

/// Source of the contents of file-backed mappings.
///
/// Implemented by the file-system layer. Reads are synchronous.
pub trait FileBacking: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; `0` means end of file.
    ///
    /// # Errors
    /// Any error is reported to the faulting context as is.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmError>;
}

#[derive(Clone)]
pub enum Behavior {
    /// Zero-filled private memory.
    Anonymous,
    /// A stack with non-present guard pages at both ends, sizes in bytes.
    Stack {
        guard_bottom: u64,
        guard_top: u64,
        grows_up: bool,
    },
    /// A window onto fixed physical memory (devices, DMA buffers).
    Direct { phys: PhysicalAddress },
    /// A private copy of a file starting at byte `offset`.
    File {
        file: Arc<dyn FileBacking>,
        offset: u64,
        shared: bool,
    },
    /// Address space that is claimed but never backed.
    Reservation,
}

impl Behavior {
    /// A private file mapping.
    #[must_use]
    pub fn file(file: Arc<dyn FileBacking>, offset: u64) -> Self {
        Self::File {
            file,
            offset,
            shared: false,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Anonymous => "anon",
            Self::Stack { .. } => "stack",
            Self::Direct { .. } => "direct",
            Self::File { .. } => "file",
            Self::Reservation => "reserved",
        }
    }

    #[must_use]
    pub const fn is_stack(&self) -> bool {
        matches!(self, Self::Stack { .. })
    }

    #[must_use]
    pub const fn is_reservation(&self) -> bool {
        matches!(self, Self::Reservation)
    }

    /// What unmapping does with the frames behind this behavior.
    #[must_use]
    pub const fn frame_policy(&self) -> FramePolicy {
        match self {
            Self::Anonymous | Self::Stack { .. } | Self::File { .. } => FramePolicy::Release,
            Self::Direct { .. } | Self::Reservation => FramePolicy::Keep,
        }
    }

    /// Guard sizes in bytes at the bottom and top of the VMA.
    #[must_use]
    pub const fn guards(&self) -> (u64, u64) {
        match self {
            Self::Stack {
                guard_bottom,
                guard_top,
                ..
            } => (*guard_bottom, *guard_top),
            _ => (0, 0),
        }
    }

    /// Whether a VMA with this behavior can be created with pages of `size`.
    pub(crate) const fn check(&self, size: PageSize) -> Result<(), VmError> {
        match self {
            Self::File { shared: true, .. } => Err(VmError::NotSupported),
            Self::Stack { .. } if !matches!(size, PageSize::Size4K) => Err(VmError::NotSupported),
            Self::Direct { phys } if !phys.is_aligned(size) => Err(VmError::InvalidRange),
            _ => Ok(()),
        }
    }

    /// Produce the frame backing the page at `va` of a VMA starting at
    /// `vma_start`.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if no frame is available.
    /// - Whatever the file returns for file-backed memory.
    /// - [`VmError::Fatal`] for reservations.
    pub fn populate<A: FrameAlloc, M: PhysMapper>(
        &self,
        vma_start: VirtualAddress,
        va: VirtualAddress,
        size: PageSize,
        frames: &A,
        mapper: &M,
        zero: bool,
    ) -> Result<PhysicalAddress, VmError> {
        let delta = va - vma_start;
        match self {
            Self::Anonymous | Self::Stack { .. } => {
                let frame = frames
                    .alloc_frames(size.frames())
                    .ok_or(VmError::OutOfMemory)?;
                if zero {
                    unsafe { mapper.zero_frames(frame, size.frames()) };
                }
                Ok(frame)
            }
            Self::Direct { phys } => Ok(*phys + delta),
            Self::File { file, offset, .. } => {
                let frame = frames
                    .alloc_frames(size.frames())
                    .ok_or(VmError::OutOfMemory)?;
                if let Err(e) = fill_from_file(&**file, offset + delta, frame, size, mapper) {
                    frames.free_frames(frame, size.frames());
                    return Err(e);
                }
                Ok(frame)
            }
            Self::Reservation => Err(FatalReason::Reservation.into()),
        }
    }

    /// Give back a frame produced by [`populate`](Self::populate) that was
    /// never installed.
    pub fn discard<A: FrameAlloc>(&self, frame: PhysicalAddress, size: PageSize, frames: &A) {
        if self.frame_policy() == FramePolicy::Release {
            frames.free_frames(frame, size.frames());
        }
    }

    /// The behavior of the part that starts `delta` bytes into this one.
    #[must_use]
    pub fn split_off(&self, delta: u64) -> Self {
        match self {
            Self::Direct { phys } => Self::Direct { phys: *phys + delta },
            Self::File {
                file,
                offset,
                shared,
            } => Self::File {
                file: Arc::clone(file),
                offset: offset + delta,
                shared: *shared,
            },
            other => other.clone(),
        }
    }

    /// Whether `next`, starting right after `len` bytes of this behavior,
    /// continues it seamlessly.
    #[must_use]
    pub fn continues(&self, len: u64, next: &Self) -> bool {
        match (self, next) {
            (Self::Anonymous, Self::Anonymous) | (Self::Reservation, Self::Reservation) => true,
            (Self::Direct { phys: a }, Self::Direct { phys: b }) => a.checked_add(len) == Some(*b),
            (
                Self::File {
                    file: fa,
                    offset: oa,
                    shared: sa,
                },
                Self::File {
                    file: fb,
                    offset: ob,
                    shared: sb,
                },
            ) => same_file(fa, fb) && sa == sb && oa.checked_add(len) == Some(*ob),
            _ => false,
        }
    }
}

fn same_file(a: &Arc<dyn FileBacking>, b: &Arc<dyn FileBacking>) -> bool {
    core::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Read one page worth of file contents into `frame`, zero-filling past EOF.
fn fill_from_file<M: PhysMapper>(
    file: &dyn FileBacking,
    offset: u64,
    frame: PhysicalAddress,
    size: PageSize,
    mapper: &M,
) -> Result<(), VmError> {
    for i in 0..size.frames() as u64 {
        let page = unsafe { mapper.phys_to_mut::<[u8; PAGE_SIZE as usize]>(frame + i * PAGE_SIZE) };
        let mut filled = 0;
        while filled < page.len() {
            let n = file.read_at(offset + i * PAGE_SIZE + filled as u64, &mut page[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        page[filled..].fill(0);
    }
    Ok(())
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Stack {
                guard_bottom,
                guard_top,
                grows_up,
            } => f
                .debug_struct("Stack")
                .field("guard_bottom", guard_bottom)
                .field("guard_top", guard_top)
                .field("grows_up", grows_up)
                .finish(),
            Self::Direct { phys } => f.debug_struct("Direct").field("phys", phys).finish(),
            Self::File { offset, shared, .. } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("shared", shared)
                .finish_non_exhaustive(),
            Self::Reservation => f.write_str("Reservation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bytes(alloc::vec::Vec<u8>);

    impl FileBacking for Bytes {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmError> {
            let start = usize::try_from(offset).map_err(|_| VmError::Io)?.min(self.0.len());
            let n = buf.len().min(self.0.len() - start);
            buf[..n].copy_from_slice(&self.0[start..start + n]);
            Ok(n)
        }
    }

    #[test]
    fn direct_split_and_merge_follow_physical_layout() {
        let a = Behavior::Direct {
            phys: PhysicalAddress::new(0x1000_0000),
        };
        let b = a.split_off(0x3000);
        assert!(a.continues(0x3000, &b));
        assert!(!a.continues(0x2000, &b));
    }

    #[test]
    fn file_merge_requires_same_file() {
        let f: Arc<dyn FileBacking> = Arc::new(Bytes(alloc::vec![1, 2, 3]));
        let g: Arc<dyn FileBacking> = Arc::new(Bytes(alloc::vec![1, 2, 3]));
        let a = Behavior::file(Arc::clone(&f), 0);
        assert!(a.continues(0x1000, &Behavior::file(Arc::clone(&f), 0x1000)));
        assert!(!a.continues(0x1000, &Behavior::file(g, 0x1000)));
        assert!(!a.continues(0x1000, &Behavior::file(f, 0x2000)));
    }

    #[test]
    fn stacks_never_merge() {
        let s = Behavior::Stack {
            guard_bottom: 0x1000,
            guard_top: 0x1000,
            grows_up: false,
        };
        assert!(!s.continues(0x1000, &s.clone()));
        assert!(!Behavior::Anonymous.continues(0x1000, &s));
    }

    #[test]
    fn creation_checks() {
        let f: Arc<dyn FileBacking> = Arc::new(Bytes(alloc::vec![]));
        let shared = Behavior::File {
            file: f,
            offset: 0,
            shared: true,
        };
        assert_eq!(shared.check(PageSize::Size4K), Err(VmError::NotSupported));
        assert_eq!(Behavior::Anonymous.check(PageSize::Size2M), Ok(()));
        let misaligned = Behavior::Direct {
            phys: PhysicalAddress::new(0x1000),
        };
        assert_eq!(misaligned.check(PageSize::Size2M), Err(VmError::InvalidRange));
    }

    #[test]
    fn release_policy_per_behavior() {
        assert_eq!(Behavior::Anonymous.frame_policy(), FramePolicy::Release);
        assert_eq!(Behavior::Reservation.frame_policy(), FramePolicy::Keep);
        assert_eq!(
            Behavior::Direct {
                phys: PhysicalAddress::zero()
            }
            .frame_policy(),
            FramePolicy::Keep
        );
    }
}
