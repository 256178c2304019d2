//! Private memory segment for the in-process backend.

use super::{MemorySegment, SegmentKind};
use crate::error::{Error, Result};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Zeroed, page-aligned memory owned by this process.
///
/// Stands in for shared memory in [`HeapBackend`] so tests and
/// single-process setups never touch `/dev/shm`.
///
/// [`HeapBackend`]: crate::backend::HeapBackend
///
/// ```rust
/// use surfacekit::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(4096).unwrap();
/// assert_eq!(segment.len(), 4096);
/// assert_eq!(segment.as_ptr() as usize % 4096, 0);
/// ```
pub struct HeapSegment {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapSegment {
    /// Allocate `size` zeroed bytes aligned to the OS page size.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BadArgument("segment size must be non-zero".into()));
        }
        let layout = Layout::from_size_align(size, crate::defaults::page_size())
            .map_err(|e| Error::BadArgument(format!("segment of {size} bytes: {e}")))?;

        // SAFETY: the layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| {
            Error::OutOfMemory(format!("heap segment of {size} bytes"))
        })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for HeapSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapSegment")
            .field("len", &self.layout.size())
            .finish()
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn kind(&self) -> SegmentKind {
        SegmentKind::Private
    }
}

// SAFETY: the allocation never moves and is freed only on drop; access to the
// bytes follows the same surface-lock discipline as shared memory.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}
