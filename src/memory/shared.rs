//! Shared memory segment using named POSIX shared memory.
//!
//! Segments are created with `shm_open(O_CREAT | O_EXCL)` and mapped
//! `MAP_SHARED`, so any process that knows the name can map the same physical
//! pages, possibly at a different address.

use super::{MemorySegment, SegmentKind};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm::ShmOFlags;
use std::ptr::NonNull;

/// A memory segment backed by a named POSIX shared-memory object.
///
/// The name stays visible under `/dev/shm` until [`SharedMemorySegment::unlink`]
/// is called; existing mappings stay valid after unlinking.
///
/// # Example
///
/// ```rust,ignore
/// use surfacekit::memory::{SharedMemorySegment, MemorySegment};
///
/// let segment = SharedMemorySegment::create("/my-buffer", 4096)?;
/// let peer = SharedMemorySegment::open("/my-buffer")?;
/// assert_eq!(peer.len(), 4096);
/// SharedMemorySegment::unlink("/my-buffer")?;
/// ```
pub struct SharedMemorySegment {
    name: String,
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedMemorySegment {
    /// Create a new named segment of `size` bytes.
    ///
    /// Fails with the OS error (`EEXIST`) if the name is already taken.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BadArgument("size must be greater than 0".into()));
        }

        let fd = rustix::shm::shm_open(
            name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )?;

        let mapped = rustix::fs::ftruncate(&fd, size as u64)
            .map_err(Error::from)
            .and_then(|()| map(&fd, size));
        match mapped {
            Ok(ptr) => Ok(Self {
                ptr,
                len: size,
                name: name.to_string(),
            }),
            Err(e) => {
                let _ = rustix::shm::shm_unlink(name);
                Err(e)
            }
        }
    }

    /// Map an existing named segment at its current size.
    pub fn open(name: &str) -> Result<Self> {
        let fd = rustix::shm::shm_open(name, ShmOFlags::RDWR, Mode::empty())?;

        let len = rustix::fs::fstat(&fd)?.st_size as usize;
        if len == 0 {
            return Err(Error::InvalidRegion(format!("{name} has zero size")));
        }

        let ptr = map(&fd, len)?;
        Ok(Self {
            ptr,
            len,
            name: name.to_string(),
        })
    }

    /// Remove the name so no further process can open it.
    pub fn unlink(name: &str) -> Result<()> {
        rustix::shm::shm_unlink(name)?;
        Ok(())
    }

    /// Get the name of this segment.
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: mapping a fresh region; no existing memory is replaced.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::OutOfMemory("mmap returned null".into()))
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn kind(&self) -> SegmentKind {
        SegmentKind::Named
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` are exactly what `map` returned; nothing
        // borrowed from the segment outlives it.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!(name = %self.name, error = %e, "munmap failed");
        }
    }
}

// SAFETY: the mapping is MAP_SHARED memory with no thread affinity.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}
