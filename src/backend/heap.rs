//! Heap allocation backend.

use super::{
    AllocationBackend, Allocation, BackendConfig, BufferDescriptor, UsageFlags, allocation_size,
    check_clone_size,
};
use crate::error::{Error, Result};
use crate::format::{PixelFormat, SurfaceLayout};
use crate::id::{ProcessId, RegionHandle};
use crate::memory::{HeapSegment, MemorySegment};
use crate::registry::BufferInfo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Backend that allocates from the process heap.
///
/// Regions live in a table owned by the backend, so two allocators that share
/// one `Arc<HeapBackend>` can clone each other's buffers exactly as two
/// processes would through shared memory.
#[derive(Debug, Default)]
pub struct HeapBackend {
    config: BackendConfig,
    regions: Mutex<HashMap<RegionHandle, Arc<HeapSegment>>>,
    next_serial: AtomicU32,
}

impl HeapBackend {
    /// Create a backend with the given settings.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Number of regions currently alive.
    pub fn region_count(&self) -> usize {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl AllocationBackend for HeapBackend {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn allocate(&self, descriptor: &BufferDescriptor) -> Result<Allocation> {
        self.validate(descriptor)?;
        let layout = self.layout_for(descriptor);
        let segment = Arc::new(HeapSegment::new(allocation_size(&layout))?);

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed) + 1;
        let region = RegionHandle::compose(ProcessId::current(), serial);
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region, Arc::clone(&segment));

        Ok(Allocation::new(segment, region, layout, true))
    }

    fn clone_region(&self, info: &BufferInfo) -> Result<Allocation> {
        let segment = self
            .regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&info.region)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidRegion(format!(
                    "region {} of buffer {} no longer exists",
                    info.region, info.id
                ))
            })?;
        check_clone_size(info, segment.len())?;

        let layout = SurfaceLayout::from_planes(info.descriptor.format, info.layout.planes());
        Ok(Allocation::new(segment, info.region, layout, false))
    }

    fn free(&self, allocation: Allocation) -> Result<()> {
        if allocation.owns_region() {
            self.regions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&allocation.region());
        }
        Ok(())
    }

    fn stride_alignment(&self, _format: PixelFormat) -> usize {
        self.config.stride_alignment
    }

    fn max_width(&self) -> u32 {
        self.config.max_width
    }

    fn max_height(&self) -> u32 {
        self.config.max_height
    }

    fn supports_format(&self, _format: PixelFormat) -> bool {
        true
    }

    fn supports_usage(&self, usage: UsageFlags) -> bool {
        (UsageFlags::CPU_READ | UsageFlags::CPU_WRITE | UsageFlags::SHARED).contains(usage)
    }
}
