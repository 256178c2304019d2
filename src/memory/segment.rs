//! The mapped-memory abstraction every backend hands out.

/// Where a segment's pages come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// A named POSIX shared-memory object; other processes can map it by name.
    Named,
    /// Private memory of this process.
    Private,
}

/// A contiguous, always-mapped byte range holding one buffer's pixels.
///
/// The segment hands out raw pointers only; who may read or write through
/// them is decided by the surface lock, not by the segment.
///
/// # Safety
///
/// Implementors guarantee that `as_ptr()..as_ptr() + len()` stays mapped
/// and does not move for as long as the segment value is alive.
pub trait MemorySegment: Send + Sync {
    /// First byte of the mapping.
    fn as_ptr(&self) -> *const u8;

    /// First byte of the mapping, for writing.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Mapped length in bytes.
    fn len(&self) -> usize;

    /// Whether the mapping is zero bytes long.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Origin of the pages.
    fn kind(&self) -> SegmentKind;

    /// Overwrite the mapping with zeros.
    ///
    /// # Safety
    ///
    /// No other thread may access the mapping during the call.
    unsafe fn zero(&self) {
        // SAFETY: the range is mapped (trait contract) and unshared (caller contract).
        unsafe { self.as_mut_ptr().write_bytes(0, self.len()) }
    }

    /// View the mapping as bytes.
    ///
    /// # Safety
    ///
    /// Nobody may write to the mapping while the slice is alive.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: the range is mapped; the caller rules out writers.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}

impl std::fmt::Debug for dyn MemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySegment")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::memory::HeapSegment;

    #[test]
    fn test_debug_through_trait_object() {
        let segment: Box<dyn MemorySegment> = Box::new(HeapSegment::new(4096).unwrap());
        let text = format!("{segment:?}");
        assert!(text.contains("Private"));
        assert!(text.contains("4096"));
    }
}
