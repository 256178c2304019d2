//! Shared-memory allocation backend.

use super::{
    AllocationBackend, Allocation, BackendConfig, BufferDescriptor, UsageFlags, allocation_size,
    check_clone_size,
};
use crate::error::{Error, Result};
use crate::format::{PixelFormat, SurfaceLayout};
use crate::id::{ProcessId, RegionHandle};
use crate::memory::{MemorySegment, SharedMemorySegment};
use crate::registry::BufferInfo;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Serial for region handles created by this process.
static REGION_SERIAL: AtomicU32 = AtomicU32::new(1);

/// Backend that places every buffer in its own named POSIX shared-memory
/// object, so any process that learns the region handle can map it.
///
/// Object names are `/<prefix>-<region>`, with the region handle in hex.
#[derive(Debug, Default)]
pub struct SharedMemoryBackend {
    config: BackendConfig,
}

impl SharedMemoryBackend {
    /// Create a backend with the given settings.
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Object name for `region`.
    pub fn region_name(&self, region: RegionHandle) -> String {
        format!("/{}-{region}", self.config.region_prefix)
    }

    fn next_region() -> RegionHandle {
        let serial = REGION_SERIAL.fetch_add(1, Ordering::Relaxed);
        RegionHandle::compose(ProcessId::current(), serial)
    }
}

impl AllocationBackend for SharedMemoryBackend {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn allocate(&self, descriptor: &BufferDescriptor) -> Result<Allocation> {
        self.validate(descriptor)?;
        let layout = self.layout_for(descriptor);
        let size = allocation_size(&layout);

        let region = Self::next_region();
        let segment = SharedMemorySegment::create(&self.region_name(region), size)?;

        tracing::debug!(
            %region,
            size,
            width = descriptor.width,
            height = descriptor.height,
            format = ?descriptor.format,
            "created shared memory region"
        );
        Ok(Allocation::new(Arc::new(segment), region, layout, true))
    }

    fn clone_region(&self, info: &BufferInfo) -> Result<Allocation> {
        let name = self.region_name(info.region);
        let segment = match SharedMemorySegment::open(&name) {
            Ok(segment) => segment,
            Err(Error::System(errno)) if errno == rustix::io::Errno::NOENT => {
                return Err(Error::InvalidRegion(format!(
                    "region {} of buffer {} no longer exists",
                    info.region, info.id
                )));
            }
            Err(e) => return Err(e),
        };
        check_clone_size(info, segment.len())?;

        let layout = SurfaceLayout::from_planes(info.descriptor.format, info.layout.planes());
        tracing::debug!(region = %info.region, id = %info.id, "mapped shared memory region");
        Ok(Allocation::new(Arc::new(segment), info.region, layout, false))
    }

    fn free(&self, allocation: Allocation) -> Result<()> {
        let region = allocation.region();
        let owned = allocation.owns_region();
        // Unmapping happens when the last reference to the segment drops.
        drop(allocation);

        if owned {
            SharedMemorySegment::unlink(&self.region_name(region))?;
            tracing::debug!(%region, "unlinked shared memory region");
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
