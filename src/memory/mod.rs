//! Memory segments backing buffer pixels.
//!
//! # Architecture
//!
//! - [`MemorySegment`]: Trait for memory backends (shared memory, heap)
//! - [`SharedMemorySegment`]: named POSIX shared memory, mappable by every process
//! - [`HeapSegment`]: process-local stand-in used by the in-memory backend

mod heap;
mod segment;
mod shared;

pub use heap::HeapSegment;
pub use segment::{MemorySegment, SegmentKind};
pub use shared::SharedMemorySegment;
